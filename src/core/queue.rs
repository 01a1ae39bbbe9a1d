//! Per-destination write queues
//!
//! Buffers are written strictly in the order they were queued. Only the
//! head is ever handed to the sink, and its cursor only moves forward, so
//! no byte is written twice even when every write completes partially.

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::buffer::Buffer;
use super::stream::{DrainSink, Sink, WriteOutcome};

/// FIFO of buffers waiting on one destination
///
/// Non-empty exactly while a write is outstanding for the destination.
#[derive(Debug, Default)]
pub struct WriteQueue {
    buffers: VecDeque<Buffer>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a write is in flight
    pub fn is_busy(&self) -> bool {
        !self.buffers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Unsent bytes across all queued buffers
    pub fn pending_bytes(&self) -> usize {
        self.buffers.iter().map(Buffer::len).sum()
    }

    /// Queue a buffer, writing immediately if the destination is idle
    pub fn enqueue<S: Sink + ?Sized>(&mut self, sink: &mut S, buf: Buffer) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let idle = self.buffers.is_empty();
        self.buffers.push_back(buf);
        if idle {
            self.drain(sink)
        } else {
            Ok(())
        }
    }

    /// The sink signalled that the outstanding write finished
    pub fn complete<S: Sink + ?Sized>(&mut self, sink: &mut S) -> io::Result<()> {
        let Some(head) = self.buffers.front() else {
            return Ok(());
        };

        match sink.complete_write(head.bytes())? {
            WriteOutcome::Written(n) => {
                self.consume(n)?;
                self.drain(sink)
            }
            WriteOutcome::Pending => Ok(()),
        }
    }

    /// Block until everything queued is written or `timeout` elapses.
    ///
    /// The head may already be in flight; it is waited on before anything
    /// new is issued. Returns false if time ran out with data still queued.
    pub fn flush<S: DrainSink + ?Sized>(&mut self, sink: &mut S, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;

        while let Some(head) = self.buffers.front() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match sink.wait_write(head.bytes(), remaining)? {
                WriteOutcome::Written(n) => {
                    self.consume(n)?;
                    // Issue the next write so the following wait has
                    // something in flight
                    self.drain(sink)?;
                }
                WriteOutcome::Pending => {
                    warn!(
                        buffers = self.len(),
                        bytes = self.pending_bytes(),
                        "flush timed out"
                    );
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Write the head repeatedly until the queue empties or the sink blocks
    fn drain<S: Sink + ?Sized>(&mut self, sink: &mut S) -> io::Result<()> {
        while let Some(head) = self.buffers.front() {
            match sink.start_write(head.bytes())? {
                WriteOutcome::Written(n) => self.consume(n)?,
                WriteOutcome::Pending => {
                    debug!(queued = self.len(), "write pending");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Advance the head by `n` written bytes, freeing it once exhausted
    fn consume(&mut self, n: usize) -> io::Result<()> {
        let Some(head) = self.buffers.front_mut() else {
            return Ok(());
        };
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "destination accepted no bytes",
            ));
        }

        head.advance(n);
        if head.is_consumed() {
            self.buffers.pop_front();
        }
        Ok(())
    }
}
