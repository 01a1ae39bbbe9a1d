//! OS-facing streams.
//!
//! - **win32**: overlapped named pipe and log handles, console input,
//!   `WaitForMultipleObjects` poller
//! - **posix**: Unix-domain socket channel, non-blocking stdin, `mio` poller
//!
//! Both export `open`, which acquires the channel, then the log, then the
//! terminal streams, and returns them ready for a [`Session`].
//!
//! [`Session`]: crate::core::Session

#[cfg(windows)]
mod win32;
#[cfg(windows)]
pub use win32::open;

#[cfg(unix)]
mod posix;
#[cfg(unix)]
pub use posix::open;
