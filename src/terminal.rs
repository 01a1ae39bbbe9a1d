//! Local terminal mode
//!
//! While a session runs the terminal passes every keystroke through
//! untouched: no echo, no line editing, no signal keys. [`TerminalMode`]
//! saves the original mode, switches it, and puts it back either through
//! [`TerminalMode::restore`] or when dropped.

use std::io;

use tracing::{debug, warn};

/// Saved terminal state; restores it on drop
pub struct TerminalMode {
    saved: Option<imp::Saved>,
}

impl TerminalMode {
    /// Capture the current mode and switch to pass-through
    pub fn enter() -> io::Result<Self> {
        let saved = imp::enter()?;
        debug!("terminal in raw mode");
        Ok(Self { saved: Some(saved) })
    }

    /// Put the original mode back. Later calls do nothing.
    pub fn restore(&mut self) -> io::Result<()> {
        match self.saved.take() {
            Some(saved) => {
                imp::restore(saved)?;
                debug!("terminal mode restored");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for TerminalMode {
    fn drop(&mut self) {
        if let Err(err) = self.restore() {
            warn!(%err, "failed to restore terminal mode");
        }
    }
}

#[cfg(windows)]
mod imp {
    use std::io;

    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Console::{
        GetConsoleMode, GetStdHandle, SetConsoleMode, CONSOLE_MODE, DISABLE_NEWLINE_AUTO_RETURN,
        ENABLE_ECHO_INPUT, ENABLE_EXTENDED_FLAGS, ENABLE_LINE_INPUT, ENABLE_MOUSE_INPUT,
        ENABLE_PROCESSED_INPUT, ENABLE_VIRTUAL_TERMINAL_INPUT,
        ENABLE_VIRTUAL_TERMINAL_PROCESSING, ENABLE_WINDOW_INPUT, ENABLE_WRAP_AT_EOL_OUTPUT,
        STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
    };

    pub struct Saved {
        input: HANDLE,
        input_mode: CONSOLE_MODE,
        output: HANDLE,
        output_mode: CONSOLE_MODE,
    }

    /// Keys arrive as VT sequences, one record per key, with nothing
    /// interpreted by the console
    pub fn raw_input_mode(mode: CONSOLE_MODE) -> CONSOLE_MODE {
        let cleared = ENABLE_ECHO_INPUT
            | ENABLE_LINE_INPUT
            | ENABLE_PROCESSED_INPUT
            | ENABLE_MOUSE_INPUT
            | ENABLE_WINDOW_INPUT;
        CONSOLE_MODE((mode.0 & !cleared.0) | ENABLE_VIRTUAL_TERMINAL_INPUT.0 | ENABLE_EXTENDED_FLAGS.0)
    }

    /// Escape sequences from the channel are rendered, not printed
    pub fn vt_output_mode(mode: CONSOLE_MODE) -> CONSOLE_MODE {
        mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING
            | DISABLE_NEWLINE_AUTO_RETURN
            | ENABLE_WRAP_AT_EOL_OUTPUT
    }

    fn get_mode(handle: HANDLE) -> io::Result<CONSOLE_MODE> {
        let mut mode = CONSOLE_MODE(0);
        unsafe { GetConsoleMode(handle, &mut mode) }?;
        Ok(mode)
    }

    pub fn enter() -> io::Result<Saved> {
        let input = unsafe { GetStdHandle(STD_INPUT_HANDLE) }?;
        let output = unsafe { GetStdHandle(STD_OUTPUT_HANDLE) }?;
        let saved = Saved {
            input,
            input_mode: get_mode(input)?,
            output,
            output_mode: get_mode(output)?,
        };

        unsafe { SetConsoleMode(input, raw_input_mode(saved.input_mode)) }?;
        if let Err(e) = unsafe { SetConsoleMode(output, vt_output_mode(saved.output_mode)) } {
            let _ = unsafe { SetConsoleMode(input, saved.input_mode) };
            return Err(e.into());
        }
        Ok(saved)
    }

    pub fn restore(saved: Saved) -> io::Result<()> {
        let input = unsafe { SetConsoleMode(saved.input, saved.input_mode) };
        let output = unsafe { SetConsoleMode(saved.output, saved.output_mode) };
        input?;
        output?;
        Ok(())
    }
}

#[cfg(unix)]
mod imp {
    use std::io::{self, IsTerminal};

    use crossterm::terminal;

    pub struct Saved;

    pub fn enter() -> io::Result<Saved> {
        if !io::stdin().is_terminal() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "standard input is not a terminal",
            ));
        }
        terminal::enable_raw_mode()?;
        Ok(Saved)
    }

    pub fn restore(_saved: Saved) -> io::Result<()> {
        terminal::disable_raw_mode()
    }
}
