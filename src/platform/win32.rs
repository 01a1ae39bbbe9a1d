//! Win32 streams
//!
//! The channel is a named pipe and the log a file, both opened for
//! overlapped I/O. Every read or write gets its own manual-reset event,
//! and the poller waits on the events of whatever is armed plus the
//! console input handle, which is signalled while input records are
//! queued.

use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};
use windows::core::{HSTRING, PCWSTR};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_IO_INCOMPLETE, ERROR_IO_PENDING, GENERIC_READ, GENERIC_WRITE, HANDLE,
    WAIT_OBJECT_0, WAIT_TIMEOUT, WIN32_ERROR,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_OVERLAPPED,
    FILE_SHARE_DELETE, FILE_SHARE_NONE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_ALWAYS,
    OPEN_EXISTING,
};
use windows::Win32::System::Console::{
    GetNumberOfConsoleInputEvents, GetStdHandle, ReadConsoleInputW, INPUT_RECORD, KEY_EVENT,
    STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};
use windows::Win32::System::Threading::{
    CreateEventW, WaitForMultipleObjects, WaitForSingleObject, INFINITE,
};
use windows::Win32::System::IO::{
    CancelIoEx, GetOverlappedResult, OVERLAPPED, OVERLAPPED_0, OVERLAPPED_0_0,
};

use crate::core::buffer::Buffer;
use crate::core::error::{Error, Result};
use crate::core::session::{Backend, Streams};
use crate::core::stream::{
    Armed, DrainSink, Poller, ReadOutcome, Role, Sink, Source, WriteOutcome,
};

/// Win32 stream types
#[derive(Debug)]
pub struct Native;

impl Backend for Native {
    type Input = ConsoleInput;
    type Channel = PipeChannel;
    type Log = LogFile;
    type Output = ConsoleOutput;
    type Poller = EventPoller;
}

/// Open the pipe, the log, and the console streams
pub fn open(channel: &str, log: Option<&Path>) -> Result<Streams<Native>> {
    let pipe = PipeChannel::open(channel).map_err(|e| Error::setup(channel, e))?;
    info!(channel, "channel connected");

    let log = log
        .map(|path| {
            LogFile::open(path).map_err(|e| Error::setup(path.display().to_string(), e))
        })
        .transpose()?;

    let input = ConsoleInput::new().map_err(|e| Error::setup("console input", e))?;
    let output = ConsoleOutput::new().map_err(|e| Error::setup("console output", e))?;
    let poller = EventPoller {
        input: input.handle,
        channel_read: pipe.read.event,
        channel_write: pipe.write.event,
        log_write: log.as_ref().map(|log| log.write.event),
    };

    Ok(Streams {
        input,
        channel: pipe,
        log,
        output,
        poller,
    })
}

fn is_code(err: &windows::core::Error, code: WIN32_ERROR) -> bool {
    err.code() == code.to_hresult()
}

fn wait_millis(timeout: Duration) -> u32 {
    // INFINITE is u32::MAX; stay below it
    timeout.as_millis().min(u128::from(INFINITE - 1)) as u32
}

/// One overlapped operation slot: the OVERLAPPED block and its event.
///
/// The block is boxed so its address stays fixed while the kernel holds it.
struct Overlapped {
    event: HANDLE,
    block: Box<OVERLAPPED>,
    in_flight: bool,
}

impl Overlapped {
    fn new() -> io::Result<Self> {
        let event = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }?;
        Ok(Self {
            event,
            block: Box::default(),
            in_flight: false,
        })
    }

    /// Reset the block for a new operation. `append` targets end of file.
    fn arm(&mut self, append: bool) -> *mut OVERLAPPED {
        let offset = if append { u32::MAX } else { 0 };
        *self.block = OVERLAPPED {
            Anonymous: OVERLAPPED_0 {
                Anonymous: OVERLAPPED_0_0 {
                    Offset: offset,
                    OffsetHigh: offset,
                },
            },
            hEvent: self.event,
            ..Default::default()
        };
        self.in_flight = true;
        &mut *self.block
    }

    /// Turn the result of ReadFile/WriteFile into a transfer count, or
    /// `None` while the operation is still running
    fn issued(
        &mut self,
        handle: HANDLE,
        result: windows::core::Result<()>,
    ) -> io::Result<Option<u32>> {
        match result {
            // Finished inline; the count is still read from the block
            Ok(()) => self.finish(handle, false),
            Err(e) if is_code(&e, ERROR_IO_PENDING) => Ok(None),
            Err(e) => {
                self.in_flight = false;
                Err(e.into())
            }
        }
    }

    fn finish(&mut self, handle: HANDLE, wait: bool) -> io::Result<Option<u32>> {
        let mut transferred = 0u32;
        match unsafe { GetOverlappedResult(handle, &*self.block, &mut transferred, wait) } {
            Ok(()) => {
                self.in_flight = false;
                Ok(Some(transferred))
            }
            Err(e) if is_code(&e, ERROR_IO_INCOMPLETE) => Ok(None),
            Err(e) => {
                self.in_flight = false;
                Err(e.into())
            }
        }
    }

    fn start_write(&mut self, handle: HANDLE, bytes: &[u8], append: bool) -> io::Result<WriteOutcome> {
        let block = self.arm(append);
        let result = unsafe { WriteFile(handle, Some(bytes), None, Some(block)) };
        Ok(to_write_outcome(self.issued(handle, result)?))
    }

    fn complete_write(&mut self, handle: HANDLE) -> io::Result<WriteOutcome> {
        if !self.in_flight {
            return Ok(WriteOutcome::Pending);
        }
        Ok(to_write_outcome(self.finish(handle, false)?))
    }

    fn wait_write(
        &mut self,
        handle: HANDLE,
        bytes: &[u8],
        append: bool,
        timeout: Duration,
    ) -> io::Result<WriteOutcome> {
        if !self.in_flight {
            return self.start_write(handle, bytes, append);
        }
        let waited = unsafe { WaitForSingleObject(self.event, wait_millis(timeout)) };
        if waited == WAIT_TIMEOUT {
            return Ok(WriteOutcome::Pending);
        }
        self.complete_write(handle)
    }

    /// Cancel whatever is in flight and wait for the kernel to let go of
    /// the block and its buffer
    fn cancel(&mut self, handle: HANDLE) {
        if !self.in_flight {
            return;
        }
        unsafe {
            let _ = CancelIoEx(handle, Some(&*self.block as *const OVERLAPPED));
        }
        let _ = self.finish(handle, true);
        self.in_flight = false;
    }
}

impl Drop for Overlapped {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.event);
        }
    }
}

fn to_write_outcome(count: Option<u32>) -> WriteOutcome {
    match count {
        Some(n) => WriteOutcome::Written(n as usize),
        None => WriteOutcome::Pending,
    }
}

/// The channel: an existing named pipe opened read/write
pub struct PipeChannel {
    handle: HANDLE,
    read: Overlapped,
    write: Overlapped,
    parked: Option<Buffer>,
}

impl PipeChannel {
    pub fn open(name: &str) -> io::Result<Self> {
        let handle = unsafe {
            CreateFileW(
                &HSTRING::from(name),
                GENERIC_READ.0 | GENERIC_WRITE.0,
                FILE_SHARE_NONE,
                None,
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                None,
            )
        }?;
        let read = Overlapped::new();
        let write = Overlapped::new();
        match (read, write) {
            (Ok(read), Ok(write)) => Ok(Self {
                handle,
                read,
                write,
                parked: None,
            }),
            (Err(e), _) | (_, Err(e)) => {
                unsafe {
                    let _ = CloseHandle(handle);
                }
                Err(e)
            }
        }
    }

    fn finish_read(&mut self, mut buf: Buffer, count: Option<u32>) -> ReadOutcome {
        match count {
            Some(n) => {
                buf.set_filled(n as usize);
                ReadOutcome::Ready(buf)
            }
            None => {
                self.parked = Some(buf);
                ReadOutcome::Pending
            }
        }
    }
}

impl Source for PipeChannel {
    fn start_read(&mut self, mut buf: Buffer) -> io::Result<ReadOutcome> {
        let block = self.read.arm(false);
        let result = unsafe { ReadFile(self.handle, Some(buf.fill_area()), None, Some(block)) };
        let count = self.read.issued(self.handle, result)?;
        Ok(self.finish_read(buf, count))
    }

    fn complete_read(&mut self) -> io::Result<ReadOutcome> {
        let Some(buf) = self.parked.take() else {
            return Ok(ReadOutcome::Pending);
        };
        let count = self.read.finish(self.handle, false)?;
        Ok(self.finish_read(buf, count))
    }
}

impl Sink for PipeChannel {
    fn start_write(&mut self, bytes: &[u8]) -> io::Result<WriteOutcome> {
        self.write.start_write(self.handle, bytes, false)
    }

    fn complete_write(&mut self, _bytes: &[u8]) -> io::Result<WriteOutcome> {
        self.write.complete_write(self.handle)
    }
}

impl Drop for PipeChannel {
    fn drop(&mut self) {
        self.read.cancel(self.handle);
        self.write.cancel(self.handle);
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

/// The `-l` log, written at end of file
pub struct LogFile {
    handle: HANDLE,
    write: Overlapped,
}

impl LogFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let handle = unsafe {
            CreateFileW(
                &HSTRING::from(path.as_os_str()),
                GENERIC_WRITE.0,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                None,
                OPEN_ALWAYS,
                FILE_ATTRIBUTE_NORMAL | FILE_FLAG_OVERLAPPED,
                None,
            )
        }?;
        match Overlapped::new() {
            Ok(write) => Ok(Self { handle, write }),
            Err(e) => {
                unsafe {
                    let _ = CloseHandle(handle);
                }
                Err(e)
            }
        }
    }
}

impl Sink for LogFile {
    fn start_write(&mut self, bytes: &[u8]) -> io::Result<WriteOutcome> {
        self.write.start_write(self.handle, bytes, true)
    }

    fn complete_write(&mut self, _bytes: &[u8]) -> io::Result<WriteOutcome> {
        self.write.complete_write(self.handle)
    }
}

impl DrainSink for LogFile {
    fn wait_write(&mut self, bytes: &[u8], timeout: Duration) -> io::Result<WriteOutcome> {
        self.write.wait_write(self.handle, bytes, true, timeout)
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        self.write.cancel(self.handle);
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

fn is_high_surrogate(unit: u16) -> bool {
    (0xD800..=0xDBFF).contains(&unit)
}

/// UTF-16 to UTF-8 across console reads.
///
/// A surrogate pair can straddle two reads; a trailing high surrogate is
/// kept back until the next read brings its low half.
#[derive(Debug, Default)]
struct Utf16Decoder {
    high: Option<u16>,
}

impl Utf16Decoder {
    /// Encode `units` into `area`, returning the bytes used. Unpaired
    /// surrogates become U+FFFD.
    fn encode(&mut self, units: &[u16], area: &mut [u8]) -> usize {
        let mut pending: Vec<u16> = self.high.take().into_iter().collect();
        pending.extend_from_slice(units);
        if pending.last().copied().is_some_and(is_high_surrogate) {
            self.high = pending.pop();
        }

        let mut used = 0;
        for ch in char::decode_utf16(pending) {
            let ch = ch.unwrap_or(char::REPLACEMENT_CHARACTER);
            if used + ch.len_utf8() > area.len() {
                break;
            }
            used += ch.encode_utf8(&mut area[used..]).len();
        }
        used
    }
}

/// Console keyboard input.
///
/// Only key-down records carrying a character are kept; everything else
/// (key-up, focus, resize, mouse) is consumed and dropped.
pub struct ConsoleInput {
    handle: HANDLE,
    parked: Option<Buffer>,
    decoder: Utf16Decoder,
}

impl ConsoleInput {
    pub fn new() -> io::Result<Self> {
        let handle = unsafe { GetStdHandle(STD_INPUT_HANDLE) }?;
        Ok(Self {
            handle,
            parked: None,
            decoder: Utf16Decoder::default(),
        })
    }

    fn queued_events(&self) -> io::Result<u32> {
        let mut count = 0u32;
        unsafe { GetNumberOfConsoleInputEvents(self.handle, &mut count) }?;
        Ok(count)
    }

    fn read_keys(&mut self, mut buf: Buffer) -> io::Result<ReadOutcome> {
        // A UTF-16 unit never needs more than three UTF-8 bytes; one byte
        // is spare for a high surrogate carried over from the last read
        let max_records = (buf.capacity().saturating_sub(1) / 3).max(1);
        let mut records = vec![INPUT_RECORD::default(); max_records];
        let mut read = 0u32;
        unsafe { ReadConsoleInputW(self.handle, &mut records, &mut read) }?;

        let mut units = Vec::with_capacity(read as usize);
        for record in &records[..read as usize] {
            if record.EventType != KEY_EVENT as u16 {
                continue;
            }
            let key = unsafe { record.Event.KeyEvent };
            let unit = unsafe { key.uChar.UnicodeChar };
            if key.bKeyDown.as_bool() && unit != 0 {
                units.push(unit);
            }
        }

        let n = self.decoder.encode(&units, buf.fill_area());
        buf.set_filled(n);
        debug!(records = read, bytes = n, "console input");
        Ok(ReadOutcome::Ready(buf))
    }
}

impl Source for ConsoleInput {
    fn start_read(&mut self, buf: Buffer) -> io::Result<ReadOutcome> {
        // ReadConsoleInputW blocks on an empty queue; only read what is there
        if self.queued_events()? == 0 {
            self.parked = Some(buf);
            return Ok(ReadOutcome::Pending);
        }
        self.read_keys(buf)
    }

    fn complete_read(&mut self) -> io::Result<ReadOutcome> {
        match self.parked.take() {
            Some(buf) => self.start_read(buf),
            None => Ok(ReadOutcome::Pending),
        }
    }
}

/// Console output, written synchronously
pub struct ConsoleOutput {
    handle: HANDLE,
}

impl ConsoleOutput {
    pub fn new() -> io::Result<Self> {
        let handle = unsafe { GetStdHandle(STD_OUTPUT_HANDLE) }?;
        Ok(Self { handle })
    }
}

impl Write for ConsoleOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0u32;
        unsafe { WriteFile(self.handle, Some(buf), Some(&mut written), None) }?;
        Ok(written as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Waits on the console input handle and the per-operation events
pub struct EventPoller {
    input: HANDLE,
    channel_read: HANDLE,
    channel_write: HANDLE,
    log_write: Option<HANDLE>,
}

impl EventPoller {
    fn handle(&self, role: Role) -> Option<HANDLE> {
        match role {
            Role::TerminalInput => Some(self.input),
            Role::ChannelRead => Some(self.channel_read),
            Role::ChannelWrite => Some(self.channel_write),
            Role::LogWrite => self.log_write,
        }
    }
}

impl Poller for EventPoller {
    fn wait(&mut self, armed: Armed) -> io::Result<Role> {
        let (roles, handles): (Vec<Role>, Vec<HANDLE>) = armed
            .roles()
            .filter_map(|role| self.handle(role).map(|handle| (role, handle)))
            .unzip();

        // The lowest signalled index wins, which keeps dispatch in role order
        let result = unsafe { WaitForMultipleObjects(&handles, false, INFINITE) };
        let index = result.0.wrapping_sub(WAIT_OBJECT_0.0) as usize;
        match roles.get(index) {
            Some(role) => Ok(*role),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "WaitForMultipleObjects returned {:#x}: {}",
                    result.0,
                    io::Error::last_os_error()
                ),
            )),
        }
    }
}
