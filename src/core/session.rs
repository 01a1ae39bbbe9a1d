//! Session: the event loop and everything it drives
//!
//! A [`Session`] owns the streams, their write queues and the escape
//! detector. [`Session::run`] arms the first reads, waits for readiness
//! and dispatches each ready role to its completion handler until the
//! escape sequence is typed or something fails.
//!
//! # Lifecycle
//!
//! ```text
//! Init ──► Running ──┬─► TerminatingNormal (drain log) ──┐
//!                    └─► TerminatingError ───────────────┴─► Done
//! ```
//!
//! Restoring the terminal mode is left to the caller, which does it on
//! both paths after `run` returns.

use std::io::Write;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::buffer::DEFAULT_CAPACITY;
use super::error::{Error, Result};
use super::escape::EscapeDetector;
use super::pipeline::{route_channel, route_input, ReadPipeline, Step};
use super::queue::WriteQueue;
use super::stream::{Armed, DrainSink, Poller, Role, Sink, Source};

/// The concrete stream types a platform provides
pub trait Backend {
    type Input: Source;
    type Channel: Source + Sink;
    type Log: DrainSink;
    type Output: Write;
    type Poller: Poller;
}

/// Opened streams, ready to be handed to a session
pub struct Streams<B: Backend> {
    pub input: B::Input,
    pub channel: B::Channel,
    pub log: Option<B::Log>,
    pub output: B::Output,
    pub poller: B::Poller,
}

/// Tunables for a session
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Capacity of each read buffer
    pub buffer_size: usize,
    /// Upper bound on the exit-time log drain
    pub drain_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_CAPACITY,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Running,
    TerminatingNormal,
    TerminatingError,
    Done,
}

/// A terminal-to-channel session
pub struct Session<B: Backend> {
    // Streams are declared, and so dropped, before the queues: a backend
    // cancels its in-flight I/O on drop, and that I/O may point into
    // queued buffers.
    input: B::Input,
    channel: B::Channel,
    log: Option<B::Log>,
    output: B::Output,
    poller: B::Poller,
    channel_queue: WriteQueue,
    log_queue: WriteQueue,
    detector: EscapeDetector,
    input_reads: ReadPipeline,
    channel_reads: ReadPipeline,
    drain_timeout: Duration,
    state: SessionState,
}

impl<B: Backend> Session<B> {
    pub fn new(streams: Streams<B>, options: SessionOptions) -> Self {
        Self {
            input: streams.input,
            channel: streams.channel,
            log: streams.log,
            output: streams.output,
            poller: streams.poller,
            channel_queue: WriteQueue::new(),
            log_queue: WriteQueue::new(),
            detector: EscapeDetector::new(),
            input_reads: ReadPipeline::new(Role::TerminalInput, options.buffer_size),
            channel_reads: ReadPipeline::new(Role::ChannelRead, options.buffer_size),
            drain_timeout: options.drain_timeout,
            state: SessionState::Init,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(from = ?self.state, to = ?state, "session state");
        self.state = state;
    }

    /// Roles with outstanding work
    pub fn armed(&self) -> Armed {
        Armed {
            channel_write: self.channel_queue.is_busy(),
            log_write: self.log.is_some() && self.log_queue.is_busy(),
        }
    }

    /// Run until the escape sequence (`Ok`) or a fatal error (`Err`).
    ///
    /// On the normal path queued log writes are drained before returning.
    /// Either way the session ends in [`SessionState::Done`].
    pub fn run(&mut self) -> Result<()> {
        let result = match self.start() {
            Ok(Step::Finished) => Ok(()),
            Ok(Step::Continue) => self.event_loop(),
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                self.set_state(SessionState::TerminatingNormal);
                self.drain_log();
            }
            Err(ref err) => {
                self.set_state(SessionState::TerminatingError);
                error!(%err, "session failed");
            }
        }

        info!(
            input_reads = self.input_reads.reads(),
            input_bytes = self.input_reads.bytes(),
            channel_reads = self.channel_reads.reads(),
            channel_bytes = self.channel_reads.bytes(),
            "session over"
        );
        self.set_state(SessionState::Done);
        result
    }

    fn start(&mut self) -> Result<Step> {
        self.set_state(SessionState::Running);
        info!("session running");

        if self.start_channel_read()? == Step::Finished {
            return Ok(Step::Finished);
        }
        self.start_input_read()
    }

    fn event_loop(&mut self) -> Result<()> {
        loop {
            let role = self.poller.wait(self.armed()).map_err(Error::Wait)?;
            debug!(%role, "ready");
            if self.dispatch(role)? == Step::Finished {
                return Ok(());
            }
        }
    }

    fn dispatch(&mut self, role: Role) -> Result<Step> {
        match role {
            Role::TerminalInput => self.complete_input_read(),
            Role::ChannelRead => self.complete_channel_read(),
            Role::ChannelWrite => {
                self.channel_queue
                    .complete(&mut self.channel)
                    .map_err(|e| Error::io(role.name(), e))?;
                Ok(Step::Continue)
            }
            Role::LogWrite => {
                if let Some(log) = self.log.as_mut() {
                    self.log_queue
                        .complete(log)
                        .map_err(|e| Error::io(role.name(), e))?;
                }
                Ok(Step::Continue)
            }
        }
    }

    fn start_input_read(&mut self) -> Result<Step> {
        let Self {
            input,
            channel,
            channel_queue,
            detector,
            input_reads,
            ..
        } = self;
        input_reads.start(input, |buf| route_input(buf, detector, channel_queue, channel))
    }

    fn complete_input_read(&mut self) -> Result<Step> {
        let Self {
            input,
            channel,
            channel_queue,
            detector,
            input_reads,
            ..
        } = self;
        input_reads.complete(input, |buf| route_input(buf, detector, channel_queue, channel))
    }

    fn start_channel_read(&mut self) -> Result<Step> {
        let Self {
            channel,
            output,
            log,
            log_queue,
            channel_reads,
            ..
        } = self;
        channel_reads.start(channel, |buf| {
            route_channel(buf, output, log.as_mut(), log_queue)
        })
    }

    fn complete_channel_read(&mut self) -> Result<Step> {
        let Self {
            channel,
            output,
            log,
            log_queue,
            channel_reads,
            ..
        } = self;
        channel_reads.complete(channel, |buf| {
            route_channel(buf, output, log.as_mut(), log_queue)
        })
    }

    /// Best-effort, bounded flush of the log on deliberate exit.
    /// Channel work still in flight is abandoned.
    fn drain_log(&mut self) {
        let Some(log) = self.log.as_mut() else {
            return;
        };
        if self.log_queue.is_empty() {
            return;
        }

        info!(bytes = self.log_queue.pending_bytes(), "draining log");
        match self.log_queue.flush(log, self.drain_timeout) {
            Ok(true) => debug!("log drained"),
            Ok(false) => warn!(
                bytes = self.log_queue.pending_bytes(),
                "log drain timed out, output lost"
            ),
            Err(err) => warn!(%err, "log drain failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{
        SinkStep, TestBackend, TestChannel, TestOutput, TestPoller, TestSink, TestSource,
    };
    use std::io;

    /// Test-side handles onto a session's streams
    struct Harness {
        input: TestSource,
        channel: TestChannel,
        log: TestSink,
        output: TestOutput,
        poller: TestPoller,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                input: TestSource::new(),
                channel: TestChannel::default(),
                log: TestSink::new(),
                output: TestOutput::default(),
                poller: TestPoller::default(),
            }
        }

        fn session(&self, with_log: bool) -> Session<TestBackend> {
            let streams = Streams {
                input: self.input.clone(),
                channel: self.channel.clone(),
                log: with_log.then(|| self.log.clone()),
                output: self.output.clone(),
                poller: self.poller.clone(),
            };
            Session::new(streams, SessionOptions::default())
        }
    }

    #[test]
    fn test_escape_stops_forwarding() {
        let h = Harness::new();
        h.input.push(b"ab\r~.\r");
        let mut session = h.session(false);

        session.run().unwrap();

        assert_eq!(h.channel.sink.delivered(), b"ab\r");
        assert_eq!(session.state(), SessionState::Done);
        assert!(h.poller.armed_history().is_empty());
    }

    #[test]
    fn test_channel_output_reaches_terminal_and_log() {
        let mut h = Harness::new();
        h.channel.source.push(b"hello");
        h.log.script([SinkStep::Block]);
        let mut session = h.session(true);
        h.poller.fire_with(Role::TerminalInput, &h.input, b"~.");

        session.run().unwrap();

        assert_eq!(h.output.contents(), b"hello");
        // The log write was still pending at the escape; the drain finished it
        assert_eq!(h.log.delivered(), b"hello");
        assert_eq!(
            h.poller.armed_history(),
            vec![Armed {
                channel_write: false,
                log_write: true
            }]
        );
    }

    #[test]
    fn test_mid_line_tilde_is_forwarded() {
        let h = Harness::new();
        h.input.push(b"x~y");
        let mut session = h.session(false);

        // No more events are scripted, so the wait fails once input is idle
        let err = session.run().unwrap_err();

        assert!(matches!(err, Error::Wait(_)));
        assert_eq!(h.channel.sink.delivered(), b"x~y");
        assert_eq!(session.state(), SessionState::Done);
    }

    #[test]
    fn test_escape_split_across_events() {
        let h = Harness::new();
        let mut session = h.session(false);
        h.poller.fire_with(Role::TerminalInput, &h.input, b"ls\r");
        h.poller.fire_with(Role::TerminalInput, &h.input, b"~");
        h.poller.fire_with(Role::TerminalInput, &h.input, b".");

        session.run().unwrap();

        assert_eq!(h.channel.sink.delivered(), b"ls\r");
    }

    #[test]
    fn test_pending_channel_write_is_armed_until_complete() {
        let mut h = Harness::new();
        h.channel.sink.script([SinkStep::Block]);
        let mut session = h.session(false);
        h.poller.fire_with(Role::TerminalInput, &h.input, b"abc");
        h.poller.fire(Role::ChannelWrite);
        h.poller.fire_with(Role::TerminalInput, &h.input, b"\r~.");

        session.run().unwrap();

        assert_eq!(h.channel.sink.delivered(), b"abc\r");
        let channel_write: Vec<bool> = h
            .poller
            .armed_history()
            .iter()
            .map(|armed| armed.channel_write)
            .collect();
        assert_eq!(channel_write, vec![false, true, false]);
    }

    #[test]
    fn test_escape_abandons_pending_channel_write() {
        let mut h = Harness::new();
        h.channel.sink.script([SinkStep::Accept(2), SinkStep::Block]);
        let mut session = h.session(true);
        h.poller.fire_with(Role::TerminalInput, &h.input, b"abcd\r");
        h.poller.fire_with(Role::TerminalInput, &h.input, b"~.");

        session.run().unwrap();

        // Only the log is drained on exit
        assert_eq!(h.channel.sink.delivered(), b"ab");
        assert_eq!(session.state(), SessionState::Done);
    }

    #[test]
    fn test_log_write_completes_on_signal() {
        let mut h = Harness::new();
        h.log.script([SinkStep::Accept(2), SinkStep::Block]);
        let mut session = h.session(true);
        h.poller.fire_with(Role::ChannelRead, &h.channel.source, b"boot ok");
        h.poller.fire(Role::LogWrite);
        h.poller.fire_with(Role::TerminalInput, &h.input, b"~.");

        session.run().unwrap();

        assert_eq!(h.output.contents(), b"boot ok");
        assert_eq!(h.log.delivered(), b"boot ok");
        assert!(!session.armed().log_write);
    }

    #[test]
    fn test_zero_length_read_is_ignored() {
        let h = Harness::new();
        h.channel.source.push(b"");
        h.input.push(b"~.");
        let mut session = h.session(true);

        session.run().unwrap();

        assert!(h.output.contents().is_empty());
        assert_eq!(h.log.writes_issued(), 0);
    }

    #[test]
    fn test_read_failure_is_fatal() {
        let h = Harness::new();
        h.input.push_error(io::ErrorKind::BrokenPipe);
        let mut session = h.session(false);

        let err = session.run().unwrap_err();

        assert!(matches!(err, Error::Io { stream: "terminal input", .. }));
        assert_eq!(h.channel.sink.writes_issued(), 0);
        assert_eq!(session.state(), SessionState::Done);
    }

    #[test]
    fn test_channel_write_failure_is_fatal() {
        let mut h = Harness::new();
        h.channel.sink.script([SinkStep::Fail]);
        h.input.push(b"data");
        let mut session = h.session(false);

        let err = session.run().unwrap_err();

        assert!(matches!(err, Error::Io { stream: "channel write", .. }));
    }

    #[test]
    fn test_error_path_skips_log_drain() {
        let mut h = Harness::new();
        h.channel.source.push(b"late");
        h.log.script([SinkStep::Block]);
        h.input.push_error(io::ErrorKind::Other);
        let mut session = h.session(true);

        assert!(session.run().is_err());

        assert!(h.log.delivered().is_empty());
    }

    #[test]
    fn test_drain_timeout_still_ends_normally() {
        let mut h = Harness::new();
        h.channel.source.push(b"stuck");
        h.log.script([SinkStep::Block]);
        h.log.stall_waits();
        h.input.push(b"~.");
        let mut session = h.session(true);

        session.run().unwrap();

        assert_eq!(h.output.contents(), b"stuck");
        assert!(h.log.delivered().is_empty());
        assert_eq!(session.state(), SessionState::Done);
    }
}
