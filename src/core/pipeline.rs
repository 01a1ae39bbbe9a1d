//! Read pipelines and post-read routing
//!
//! A read that completes immediately and one that completes after a
//! readiness signal go through the same [`ReadPipeline::pump`] loop: route
//! the buffer, then issue the next read, until a read is left pending.
//! The loop never stalls behind a source that has more data ready than
//! the poller would report.

use std::io::Write;

use tracing::{debug, info, trace};

use super::buffer::Buffer;
use super::error::{Error, Result};
use super::escape::EscapeDetector;
use super::queue::WriteQueue;
use super::stream::{ReadOutcome, Role, Sink, Source};

/// What a completion handler tells the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// The escape sequence was typed
    Finished,
}

/// Issues reads for one source
#[derive(Debug)]
pub struct ReadPipeline {
    role: Role,
    capacity: usize,
    reads: u64,
    bytes: u64,
}

impl ReadPipeline {
    pub fn new(role: Role, capacity: usize) -> Self {
        Self {
            role,
            capacity,
            reads: 0,
            bytes: 0,
        }
    }

    /// Completed reads so far
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Bytes read so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Issue a read on an idle source
    pub fn start<S, F>(&mut self, source: &mut S, route: F) -> Result<Step>
    where
        S: Source + ?Sized,
        F: FnMut(Buffer) -> Result<Step>,
    {
        let outcome = source
            .start_read(Buffer::with_capacity(self.capacity))
            .map_err(|e| Error::io(self.role.name(), e))?;
        self.pump(source, outcome, route)
    }

    /// Finish the pending read after the poller reported the source ready
    pub fn complete<S, F>(&mut self, source: &mut S, route: F) -> Result<Step>
    where
        S: Source + ?Sized,
        F: FnMut(Buffer) -> Result<Step>,
    {
        let outcome = source
            .complete_read()
            .map_err(|e| Error::io(self.role.name(), e))?;
        self.pump(source, outcome, route)
    }

    fn pump<S, F>(&mut self, source: &mut S, mut outcome: ReadOutcome, mut route: F) -> Result<Step>
    where
        S: Source + ?Sized,
        F: FnMut(Buffer) -> Result<Step>,
    {
        loop {
            let buf = match outcome {
                ReadOutcome::Pending => return Ok(Step::Continue),
                ReadOutcome::Ready(buf) => buf,
            };

            self.reads += 1;
            self.bytes += buf.len() as u64;
            trace!(role = %self.role, len = buf.len(), "read completed");

            if route(buf)? == Step::Finished {
                return Ok(Step::Finished);
            }

            outcome = source
                .start_read(Buffer::with_capacity(self.capacity))
                .map_err(|e| Error::io(self.role.name(), e))?;
        }
    }
}

/// Forward keystrokes to the channel, stopping at the escape sequence.
///
/// Bytes before the escape are sent; the escape and everything after it
/// in the same read are dropped.
pub fn route_input<C>(
    mut buf: Buffer,
    detector: &mut EscapeDetector,
    queue: &mut WriteQueue,
    channel: &mut C,
) -> Result<Step>
where
    C: Sink + ?Sized,
{
    let scan = detector.scan(buf.bytes());
    let to_channel = |e| Error::io(Role::ChannelWrite.name(), e);

    if scan.release_tilde {
        queue
            .enqueue(channel, Buffer::from_slice(b"~"))
            .map_err(to_channel)?;
    }
    buf.truncate(scan.forward);
    queue.enqueue(channel, buf).map_err(to_channel)?;

    if scan.escaped {
        info!("escape sequence typed");
        return Ok(Step::Finished);
    }
    Ok(Step::Continue)
}

/// Show channel output on the terminal, then hand it to the log.
///
/// The terminal write is synchronous and complete before the buffer is
/// queued for the log, so the log never holds bytes the user has not seen.
pub fn route_channel<O, L>(
    buf: Buffer,
    output: &mut O,
    log: Option<&mut L>,
    log_queue: &mut WriteQueue,
) -> Result<Step>
where
    O: Write + ?Sized,
    L: Sink + ?Sized,
{
    if buf.is_empty() {
        return Ok(Step::Continue);
    }

    output
        .write_all(buf.bytes())
        .and_then(|()| output.flush())
        .map_err(|e| Error::io("terminal output", e))?;

    if let Some(log) = log {
        log_queue
            .enqueue(log, buf)
            .map_err(|e| Error::io(Role::LogWrite.name(), e))?;
        if log_queue.is_busy() {
            debug!(queued = log_queue.len(), "log write pending");
        }
    }
    Ok(Step::Continue)
}
