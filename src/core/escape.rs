//! Local escape sequence detection
//!
//! Watches the keystroke stream for `~.` typed at the start of a line.
//! Only carriage return ends a line: that is what a terminal in raw mode
//! sends for Enter.

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeState {
    /// Somewhere in the middle of a line
    Init,
    /// At the start of a line
    Newline,
    /// Saw `~` at the start of a line
    Tilde,
}

/// Result of scanning one read's worth of input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Scan {
    /// A `~` held back from the previous read turned out to be ordinary
    /// input and must be sent ahead of this read's bytes
    pub release_tilde: bool,
    /// Number of leading bytes of this read to forward
    pub forward: usize,
    /// The escape sequence was typed
    pub escaped: bool,
}

/// Line-start `~.` recognizer
///
/// State persists across reads, so a `~` at the end of one read and a `.`
/// at the start of the next still match. A trailing `~` that might begin
/// the escape is withheld from [`Scan::forward`] until the next byte
/// settles it.
#[derive(Debug, Clone)]
pub struct EscapeDetector {
    state: EscapeState,
}

impl Default for EscapeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl EscapeDetector {
    pub fn new() -> Self {
        Self {
            state: EscapeState::Newline,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> EscapeState {
        self.state
    }

    /// Feed one byte. Returns true when it completes the escape sequence.
    pub fn feed(&mut self, byte: u8) -> bool {
        let matched = self.state == EscapeState::Tilde && byte == b'.';
        self.state = match (self.state, byte) {
            _ if matched => EscapeState::Newline,
            (EscapeState::Newline, b'~') => EscapeState::Tilde,
            (_, b'\r') => EscapeState::Newline,
            _ => EscapeState::Init,
        };
        matched
    }

    /// Scan a freshly read chunk of input
    pub fn scan(&mut self, bytes: &[u8]) -> Scan {
        if bytes.is_empty() {
            return Scan::default();
        }

        let held = self.state == EscapeState::Tilde;
        for (i, &byte) in bytes.iter().enumerate() {
            if self.feed(byte) {
                // The `~` is the previous byte, or the held one when i == 0
                return Scan {
                    release_tilde: held && i > 0,
                    forward: i.saturating_sub(1),
                    escaped: true,
                };
            }
        }

        let forward = if self.state == EscapeState::Tilde {
            bytes.len() - 1
        } else {
            bytes.len()
        };
        Scan {
            release_tilde: held,
            forward,
            escaped: false,
        }
    }
}
