//! Unix streams
//!
//! The channel is a listening Unix-domain stream socket named by path.
//! Stdin is switched to non-blocking mode for the life of the session and
//! both it and the socket are watched with an edge-triggered `mio` poll,
//! so every read is repeated until it would block.
//!
//! The log is an ordinary file opened for append. Regular files cannot be
//! polled and writes to them never report "would block", so log writes
//! always complete synchronously here.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Stdin, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::Path;
use std::time::Duration;

use mio::net::UnixStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use rustix::event::{PollFd, PollFlags};
use rustix::fs::OFlags;
use rustix::io::Errno;
use tracing::{debug, info};

use crate::core::buffer::Buffer;
use crate::core::error::{Error, Result};
use crate::core::session::{Backend, Streams};
use crate::core::stream::{
    is_pending, Armed, DrainSink, Poller, ReadOutcome, Role, Sink, Source, WriteOutcome,
};

/// Unix stream types
#[derive(Debug)]
pub struct Native;

impl Backend for Native {
    type Input = StdinSource;
    type Channel = SocketChannel;
    type Log = LogFile;
    type Output = TerminalOutput;
    type Poller = MioPoller;
}

/// Open the channel socket, the log, and the terminal streams
pub fn open(channel: &str, log: Option<&Path>) -> Result<Streams<Native>> {
    let mut channel_stream =
        SocketChannel::connect(Path::new(channel)).map_err(|e| Error::setup(channel, e))?;
    info!(channel, "channel connected");

    let log = log
        .map(|path| {
            LogFile::open(path).map_err(|e| Error::setup(path.display().to_string(), e))
        })
        .transpose()?;

    let input = StdinSource::new().map_err(|e| Error::setup("stdin", e))?;
    let poller = MioPoller::new(input.as_raw_fd(), &mut channel_stream)
        .map_err(|e| Error::setup("poll", e))?;

    Ok(Streams {
        input,
        channel: channel_stream,
        log,
        output: TerminalOutput::default(),
        poller,
    })
}

/// Read once into `buf`, parking it if the fd has nothing yet.
///
/// A zero-byte read is end-of-stream for a socket or tty and is an error:
/// nothing further can arrive.
fn read_nonblocking<F>(
    parked: &mut Option<Buffer>,
    mut buf: Buffer,
    what: &str,
    mut read: F,
) -> io::Result<ReadOutcome>
where
    F: FnMut(&mut [u8]) -> io::Result<usize>,
{
    loop {
        match read(buf.fill_area()) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{what} closed"),
                ))
            }
            Ok(n) => {
                buf.set_filled(n);
                return Ok(ReadOutcome::Ready(buf));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_pending(&e) => {
                *parked = Some(buf);
                return Ok(ReadOutcome::Pending);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Block until `fd` is ready for `flags`
fn wait_fd(fd: BorrowedFd<'_>, flags: PollFlags) -> io::Result<()> {
    let mut fds = [PollFd::new(&fd, flags)];
    loop {
        match rustix::event::poll(&mut fds, None) {
            Ok(_) => return Ok(()),
            Err(Errno::INTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Terminal input: stdin in non-blocking mode
pub struct StdinSource {
    stdin: Stdin,
    saved_flags: OFlags,
    parked: Option<Buffer>,
}

impl StdinSource {
    pub fn new() -> io::Result<Self> {
        let stdin = io::stdin();
        let saved_flags = rustix::fs::fcntl_getfl(&stdin)?;
        rustix::fs::fcntl_setfl(&stdin, saved_flags | OFlags::NONBLOCK)?;
        Ok(Self {
            stdin,
            saved_flags,
            parked: None,
        })
    }
}

impl AsRawFd for StdinSource {
    fn as_raw_fd(&self) -> RawFd {
        self.stdin.as_raw_fd()
    }
}

impl Source for StdinSource {
    fn start_read(&mut self, buf: Buffer) -> io::Result<ReadOutcome> {
        // Bypass std's buffered reader: data sitting in its buffer would
        // never wake the poller
        let stdin = &self.stdin;
        read_nonblocking(&mut self.parked, buf, "terminal input", |area| {
            rustix::io::read(stdin, area).map_err(io::Error::from)
        })
    }

    fn complete_read(&mut self) -> io::Result<ReadOutcome> {
        match self.parked.take() {
            Some(buf) => self.start_read(buf),
            None => Ok(ReadOutcome::Pending),
        }
    }
}

impl Drop for StdinSource {
    fn drop(&mut self) {
        // The flag lives on the open file description, shared with the shell
        let _ = rustix::fs::fcntl_setfl(&self.stdin, self.saved_flags);
    }
}

/// The channel: a connected non-blocking Unix stream socket
pub struct SocketChannel {
    stream: UnixStream,
    parked: Option<Buffer>,
}

impl SocketChannel {
    pub fn connect(path: &Path) -> io::Result<Self> {
        let stream = std::os::unix::net::UnixStream::connect(path)?;
        stream.set_nonblocking(true)?;
        Ok(Self::from_std(stream))
    }

    /// Wrap an already non-blocking std socket
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            stream: UnixStream::from_std(stream),
            parked: None,
        }
    }
}

impl Source for SocketChannel {
    fn start_read(&mut self, buf: Buffer) -> io::Result<ReadOutcome> {
        let stream = &mut self.stream;
        read_nonblocking(&mut self.parked, buf, "channel", |area| stream.read(area))
    }

    fn complete_read(&mut self) -> io::Result<ReadOutcome> {
        match self.parked.take() {
            Some(buf) => self.start_read(buf),
            None => Ok(ReadOutcome::Pending),
        }
    }
}

impl Sink for SocketChannel {
    fn start_write(&mut self, bytes: &[u8]) -> io::Result<WriteOutcome> {
        loop {
            match self.stream.write(bytes) {
                Ok(n) => return Ok(WriteOutcome::Written(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_pending(&e) => return Ok(WriteOutcome::Pending),
                Err(e) => return Err(e),
            }
        }
    }

    /// Nothing was handed to the kernel while pending, so retry the write
    fn complete_write(&mut self, bytes: &[u8]) -> io::Result<WriteOutcome> {
        self.start_write(bytes)
    }
}

/// The `-l` log, opened for append
pub struct LogFile {
    file: File,
}

impl LogFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    fn write_now(&mut self, bytes: &[u8]) -> io::Result<WriteOutcome> {
        loop {
            match self.file.write(bytes) {
                Ok(n) => return Ok(WriteOutcome::Written(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Sink for LogFile {
    fn start_write(&mut self, bytes: &[u8]) -> io::Result<WriteOutcome> {
        self.write_now(bytes)
    }

    fn complete_write(&mut self, bytes: &[u8]) -> io::Result<WriteOutcome> {
        self.write_now(bytes)
    }
}

/// File writes never block for long enough to need a bound
impl DrainSink for LogFile {
    fn wait_write(&mut self, bytes: &[u8], _timeout: Duration) -> io::Result<WriteOutcome> {
        self.write_now(bytes)
    }
}

/// Terminal output, written straight to fd 1.
///
/// Stdout usually shares its open file description with stdin, so it is
/// non-blocking too; a full terminal is waited out here instead of
/// surfacing as an error.
pub struct TerminalOutput {
    stdout: io::Stdout,
}

impl Default for TerminalOutput {
    fn default() -> Self {
        Self {
            stdout: io::stdout(),
        }
    }
}

impl Write for TerminalOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match rustix::io::write(&self.stdout, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::INTR) => continue,
                Err(Errno::AGAIN) => {
                    wait_fd(self.stdout.as_fd(), PollFlags::OUT)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

const INPUT: Token = Token(0);
const CHANNEL: Token = Token(1);

/// Edge-triggered readiness over stdin and the channel socket
pub struct MioPoller {
    poll: Poll,
    events: Events,
    ready: VecDeque<Role>,
}

impl MioPoller {
    pub fn new(input_fd: RawFd, channel: &mut SocketChannel) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut SourceFd(&input_fd), INPUT, Interest::READABLE)?;
        poll.registry().register(
            &mut channel.stream,
            CHANNEL,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(Self {
            poll,
            events: Events::with_capacity(8),
            ready: VecDeque::new(),
        })
    }

    fn collect(&mut self) -> io::Result<()> {
        let mut fired = [false; Role::ALL.len()];
        for event in self.events.iter() {
            match event.token() {
                INPUT => fired[0] = true,
                CHANNEL => {
                    if event.is_readable() || event.is_read_closed() || event.is_error() {
                        fired[1] = true;
                    }
                    if event.is_writable() || event.is_write_closed() || event.is_error() {
                        fired[2] = true;
                    }
                }
                token => {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("event for unknown token {}", token.0),
                    ))
                }
            }
        }
        for (role, fired) in Role::ALL.into_iter().zip(fired) {
            if fired && !self.ready.contains(&role) {
                self.ready.push_back(role);
            }
        }
        Ok(())
    }
}

impl Poller for MioPoller {
    fn wait(&mut self, armed: Armed) -> io::Result<Role> {
        loop {
            // An edge for a role with nothing in flight carries no work
            self.ready.retain(|role| armed.contains(*role));
            if let Some(role) = self.ready.pop_front() {
                return Ok(role);
            }

            match self.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            debug!(events = self.events.iter().count(), "poll returned");
            self.collect()?;
        }
    }
}
