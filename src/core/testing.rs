//! Scripted in-memory streams for engine tests

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::rc::Rc;
use std::time::Duration;

use super::buffer::Buffer;
use super::session::Backend;
use super::stream::{Armed, DrainSink, Poller, ReadOutcome, Role, Sink, Source, WriteOutcome};

/// One scripted reaction of a [`TestSink`] to a write attempt
#[derive(Debug, Clone, Copy)]
pub enum SinkStep {
    /// Accept at most this many bytes
    Accept(usize),
    /// Report the write as pending
    Block,
    /// Fail with `BrokenPipe`
    Fail,
}

#[derive(Debug, Default)]
struct SinkState {
    script: VecDeque<SinkStep>,
    delivered: Vec<u8>,
    writes_issued: usize,
    in_flight: bool,
    stall_waits: bool,
}

/// A sink that behaves like an overlapped handle: a blocked write stays in
/// flight and its bytes land when it completes.
///
/// Clones share state, so a test can keep one and hand another to the
/// session.
#[derive(Debug, Clone, Default)]
pub struct TestSink {
    state: Rc<RefCell<SinkState>>,
}

impl TestSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&mut self, steps: impl IntoIterator<Item = SinkStep>) {
        self.state.borrow_mut().script.extend(steps);
    }

    /// Make `wait_write` time out instead of completing
    pub fn stall_waits(&mut self) {
        self.state.borrow_mut().stall_waits = true;
    }

    pub fn delivered(&self) -> Vec<u8> {
        self.state.borrow().delivered.clone()
    }

    pub fn writes_issued(&self) -> usize {
        self.state.borrow().writes_issued
    }

    fn attempt(&mut self, bytes: &[u8]) -> io::Result<WriteOutcome> {
        let mut state = self.state.borrow_mut();
        let step = state.script.pop_front().unwrap_or(SinkStep::Accept(usize::MAX));
        match step {
            SinkStep::Accept(n) => {
                let n = n.min(bytes.len());
                state.delivered.extend_from_slice(&bytes[..n]);
                state.in_flight = false;
                Ok(WriteOutcome::Written(n))
            }
            SinkStep::Block => {
                state.in_flight = true;
                Ok(WriteOutcome::Pending)
            }
            SinkStep::Fail => Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed")),
        }
    }
}

impl Sink for TestSink {
    fn start_write(&mut self, bytes: &[u8]) -> io::Result<WriteOutcome> {
        self.state.borrow_mut().writes_issued += 1;
        self.attempt(bytes)
    }

    fn complete_write(&mut self, bytes: &[u8]) -> io::Result<WriteOutcome> {
        if !self.state.borrow().in_flight {
            return Ok(WriteOutcome::Pending);
        }
        self.attempt(bytes)
    }
}

impl DrainSink for TestSink {
    fn wait_write(&mut self, bytes: &[u8], _timeout: Duration) -> io::Result<WriteOutcome> {
        if self.state.borrow().stall_waits {
            return Ok(WriteOutcome::Pending);
        }
        // A pending write always finishes when waited on
        let mut state = self.state.borrow_mut();
        state.delivered.extend_from_slice(bytes);
        state.in_flight = false;
        Ok(WriteOutcome::Written(bytes.len()))
    }
}

#[derive(Debug, Default)]
struct SourceState {
    chunks: VecDeque<io::Result<Vec<u8>>>,
    parked: Option<Buffer>,
    reads_issued: usize,
}

/// A source fed with chunks by the test. Each chunk is one completed
/// read; with nothing queued a read stays pending.
#[derive(Debug, Clone, Default)]
pub struct TestSource {
    state: Rc<RefCell<SourceState>>,
}

impl TestSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, chunk: &[u8]) {
        self.state.borrow_mut().chunks.push_back(Ok(chunk.to_vec()));
    }

    pub fn push_error(&self, kind: io::ErrorKind) {
        self.state
            .borrow_mut()
            .chunks
            .push_back(Err(io::Error::new(kind, "scripted read failure")));
    }

    pub fn is_parked(&self) -> bool {
        self.state.borrow().parked.is_some()
    }

    pub fn reads_issued(&self) -> usize {
        self.state.borrow().reads_issued
    }

    fn attempt(&mut self, mut buf: Buffer) -> io::Result<ReadOutcome> {
        let mut state = self.state.borrow_mut();
        match state.chunks.pop_front() {
            Some(Ok(chunk)) => {
                let area = buf.fill_area();
                let n = chunk.len().min(area.len());
                area[..n].copy_from_slice(&chunk[..n]);
                buf.set_filled(n);
                if n < chunk.len() {
                    state.chunks.push_front(Ok(chunk[n..].to_vec()));
                }
                Ok(ReadOutcome::Ready(buf))
            }
            Some(Err(err)) => Err(err),
            None => {
                state.parked = Some(buf);
                Ok(ReadOutcome::Pending)
            }
        }
    }
}

impl Source for TestSource {
    fn start_read(&mut self, buf: Buffer) -> io::Result<ReadOutcome> {
        {
            let mut state = self.state.borrow_mut();
            assert!(state.parked.is_none(), "second read issued while one is pending");
            state.reads_issued += 1;
        }
        self.attempt(buf)
    }

    fn complete_read(&mut self) -> io::Result<ReadOutcome> {
        let parked = self.state.borrow_mut().parked.take();
        match parked {
            Some(buf) => self.attempt(buf),
            None => Ok(ReadOutcome::Pending),
        }
    }
}

/// Channel double: reads from a [`TestSource`], writes to a [`TestSink`]
#[derive(Debug, Clone, Default)]
pub struct TestChannel {
    pub source: TestSource,
    pub sink: TestSink,
}

impl Source for TestChannel {
    fn start_read(&mut self, buf: Buffer) -> io::Result<ReadOutcome> {
        self.source.start_read(buf)
    }

    fn complete_read(&mut self) -> io::Result<ReadOutcome> {
        self.source.complete_read()
    }
}

impl Sink for TestChannel {
    fn start_write(&mut self, bytes: &[u8]) -> io::Result<WriteOutcome> {
        self.sink.start_write(bytes)
    }

    fn complete_write(&mut self, bytes: &[u8]) -> io::Result<WriteOutcome> {
        self.sink.complete_write(bytes)
    }
}

/// Terminal output double
#[derive(Debug, Clone, Default)]
pub struct TestOutput {
    written: Rc<RefCell<Vec<u8>>>,
}

impl TestOutput {
    pub fn contents(&self) -> Vec<u8> {
        self.written.borrow().clone()
    }
}

impl Write for TestOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Poller that replays a fixed list of ready roles, then fails.
///
/// An event may carry a chunk that lands in a source just as the event
/// fires, standing in for data arriving while the loop waits.
#[derive(Debug, Clone, Default)]
pub struct TestPoller {
    ready: Rc<RefCell<VecDeque<(Role, Option<(TestSource, Vec<u8>)>)>>>,
    seen: Rc<RefCell<Vec<Armed>>>,
}

impl TestPoller {
    pub fn fire(&self, role: Role) {
        self.ready.borrow_mut().push_back((role, None));
    }

    pub fn fire_with(&self, role: Role, source: &TestSource, chunk: &[u8]) {
        self.ready
            .borrow_mut()
            .push_back((role, Some((source.clone(), chunk.to_vec()))));
    }

    /// The armed set passed to each wait
    pub fn armed_history(&self) -> Vec<Armed> {
        self.seen.borrow().clone()
    }
}

impl Poller for TestPoller {
    fn wait(&mut self, armed: Armed) -> io::Result<Role> {
        self.seen.borrow_mut().push(armed);
        let (role, arrival) = self
            .ready
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no more scripted events"))?;
        assert!(armed.contains(role), "{role} fired while not armed");
        if let Some((source, chunk)) = arrival {
            source.push(&chunk);
        }
        Ok(role)
    }
}

/// Backend made of the doubles above
#[derive(Debug)]
pub struct TestBackend;

impl Backend for TestBackend {
    type Input = TestSource;
    type Channel = TestChannel;
    type Log = TestSink;
    type Output = TestOutput;
    type Poller = TestPoller;
}
