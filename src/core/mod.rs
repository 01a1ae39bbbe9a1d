//! The forwarding engine.
//!
//! Everything in here is platform independent; the OS-facing streams live
//! in [`crate::platform`].
//!
//! - **buffer**: owned fixed-capacity byte buffers
//! - **queue**: per-destination FIFO write queues with partial completion
//! - **escape**: the line-start `~.` detector
//! - **stream**: roles and the Source/Sink/DrainSink/Poller contracts
//! - **pipeline**: read pipelines and post-read routing
//! - **session**: the event loop and session lifecycle
//!
//! # Data flow
//!
//! ```text
//! terminal input ──► EscapeDetector ──► channel WriteQueue ──► channel
//! channel ──► terminal output (synchronous)
//!                 └─► log WriteQueue ──► log file
//! ```

pub mod buffer;
pub mod error;
pub mod escape;
pub mod pipeline;
pub mod queue;
pub mod session;
pub mod stream;

#[cfg(test)]
pub mod testing;

pub use error::{Error, Result};
pub use session::{Session, SessionOptions};
