//! Stream roles and the non-blocking I/O contracts the engine drives.
//!
//! The engine never touches an OS handle directly. Platform backends
//! implement [`Source`], [`Sink`], [`DrainSink`] and [`Poller`]; the session calls them
//! only from event loop dispatch.
//!
//! Every operation either completes immediately or reports `Pending`.
//! A pending operation finishes later, after the poller reports its
//! role ready, through the matching `complete_*` call.

use std::fmt;
use std::io;
use std::time::Duration;

use super::buffer::Buffer;

/// The closed set of things the event loop waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    TerminalInput,
    ChannelRead,
    ChannelWrite,
    LogWrite,
}

impl Role {
    /// Fixed dispatch order when several roles are ready at once
    pub const ALL: [Role; 4] = [
        Role::TerminalInput,
        Role::ChannelRead,
        Role::ChannelWrite,
        Role::LogWrite,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Role::TerminalInput => "terminal input",
            Role::ChannelRead => "channel read",
            Role::ChannelWrite => "channel write",
            Role::LogWrite => "log write",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The set of roles with outstanding work for one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Armed {
    pub channel_write: bool,
    pub log_write: bool,
}

impl Armed {
    /// Reads are always outstanding; writes only while queued
    pub fn contains(&self, role: Role) -> bool {
        match role {
            Role::TerminalInput | Role::ChannelRead => true,
            Role::ChannelWrite => self.channel_write,
            Role::LogWrite => self.log_write,
        }
    }

    #[cfg(any(windows, test))]
    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        Role::ALL.into_iter().filter(move |role| self.contains(*role))
    }
}

/// Outcome of issuing or completing a read
#[derive(Debug)]
pub enum ReadOutcome {
    /// The read finished; the buffer holds what was read (possibly nothing)
    Ready(Buffer),
    /// The source kept the buffer and will finish the read later
    Pending,
}

/// Outcome of issuing or completing a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(usize),
    Pending,
}

/// A byte source read one buffer at a time.
///
/// At most one read is outstanding. While pending the source owns the
/// buffer it was handed; it gives it back through `complete_read`.
pub trait Source {
    fn start_read(&mut self, buf: Buffer) -> io::Result<ReadOutcome>;

    fn complete_read(&mut self) -> io::Result<ReadOutcome>;
}

/// A byte destination fed from a write queue.
///
/// `bytes` is always the unsent part of the queue head. It stays alive and
/// unchanged until the sink reports it written, so a backend may hand its
/// address to the OS for the duration of a pending write.
pub trait Sink {
    fn start_write(&mut self, bytes: &[u8]) -> io::Result<WriteOutcome>;

    /// Finish the outstanding write after the poller reported this sink
    fn complete_write(&mut self, bytes: &[u8]) -> io::Result<WriteOutcome>;
}

/// A sink that is flushed on exit: the log.
///
/// The channel is never drained, so it only needs [`Sink`].
pub trait DrainSink: Sink {
    /// Block up to `timeout` for the outstanding write. `Pending` means
    /// the time ran out.
    fn wait_write(&mut self, bytes: &[u8], timeout: Duration) -> io::Result<WriteOutcome>;
}

/// The readiness multiplexer
pub trait Poller {
    /// Block until one armed role is ready.
    ///
    /// There is no timeout: any failure, including a timed-out wait, is
    /// returned as an error and ends the session.
    fn wait(&mut self, armed: Armed) -> io::Result<Role>;
}

/// Which failures are part of normal non-blocking I/O
pub fn is_pending(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}
