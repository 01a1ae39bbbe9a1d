//! Session error taxonomy
//!
//! Every error here is fatal. "Would block" and "pending" never surface as
//! errors, and the escape sequence ends a session with `Ok`.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed command line
    #[error("{0}")]
    Usage(String),

    /// Opening the channel or log, or switching the terminal mode
    #[error("{context}: {source}")]
    Setup {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A read or write failed outright
    #[error("{stream} failed: {source}")]
    Io {
        stream: &'static str,
        #[source]
        source: io::Error,
    },

    /// The readiness wait failed or returned something unexpected
    #[error("wait failed: {0}")]
    Wait(#[source] io::Error),
}

impl Error {
    pub fn setup(context: impl Into<String>, source: io::Error) -> Self {
        Error::Setup {
            context: context.into(),
            source,
        }
    }

    pub fn io(stream: &'static str, source: io::Error) -> Self {
        Error::Io { stream, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_os_text() {
        let err = Error::setup(
            r"\\.\pipe\vm",
            io::Error::new(io::ErrorKind::NotFound, "The system cannot find the file specified."),
        );
        assert_eq!(
            err.to_string(),
            r"\\.\pipe\vm: The system cannot find the file specified."
        );

        let err = Error::io("channel read", io::Error::new(io::ErrorKind::BrokenPipe, "pipe ended"));
        assert_eq!(err.to_string(), "channel read failed: pipe ended");
    }
}
