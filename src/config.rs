//! Configuration loading for pipeterm.
//!
//! Settings come from `~/.pipeterm/config.toml` (or the file named with
//! `--config`). Every field is optional:
//!
//! ```toml
//! # Read buffer size in bytes (16..=65536)
//! buffer_size = 64
//!
//! # How long to keep flushing the -l log after ~. before giving up
//! drain_timeout_ms = 2000
//!
//! # Diagnostic tracing filter (RUST_LOG overrides it)
//! log_level = "info"
//!
//! # Where diagnostic tracing goes (default ~/.pipeterm/pipeterm.log)
//! diagnostic_log = "C:/temp/pipeterm.log"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::SessionOptions;

const MIN_BUFFER_SIZE: usize = 16;
const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity of each read buffer
    pub buffer_size: usize,
    /// Bound on the exit-time log drain, in milliseconds
    pub drain_timeout_ms: u64,
    /// Tracing filter directive
    pub log_level: String,
    /// Diagnostic log file
    pub diagnostic_log: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: crate::core::buffer::DEFAULT_CAPACITY,
            drain_timeout_ms: 2000,
            log_level: "info".to_string(),
            diagnostic_log: None,
        }
    }
}

impl Config {
    /// Load from `path`, or the default location when `None`.
    ///
    /// A missing file yields defaults. So does a malformed one; the parse
    /// error is returned alongside so the caller can report it once
    /// logging is up.
    pub fn load(path: Option<&Path>) -> (Self, Option<String>) {
        let Some(path) = path.map(Path::to_path_buf).or_else(Self::default_path) else {
            return (Self::default(), None);
        };
        if !path.exists() {
            return (Self::default(), None);
        }

        match fs::read_to_string(&path) {
            Ok(content) => match Self::parse(&content) {
                Ok(config) => (config, None),
                Err(e) => (
                    Self::default(),
                    Some(format!("{}: {}", path.display(), e)),
                ),
            },
            Err(e) => (
                Self::default(),
                Some(format!("{}: {}", path.display(), e)),
            ),
        }
    }

    /// Parse TOML text, clamping out-of-range values
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Config = toml::from_str(content)?;
        let clamped = config.buffer_size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE);
        if clamped != config.buffer_size {
            warn!(
                requested = config.buffer_size,
                used = clamped,
                "buffer_size out of range"
            );
            config.buffer_size = clamped;
        }
        Ok(config)
    }

    /// Engine tunables
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            buffer_size: self.buffer_size,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }

    /// Diagnostic log location
    pub fn diagnostic_log_path(&self) -> PathBuf {
        self.diagnostic_log.clone().unwrap_or_else(|| {
            Self::config_dir()
                .map(|dir| dir.join("pipeterm.log"))
                .unwrap_or_else(|| PathBuf::from("pipeterm.log"))
        })
    }

    fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    fn config_dir() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".pipeterm"))
    }
}

/// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}
