//! pipeterm - attach the local terminal to a console channel
//!
//! pipeterm connects to an existing bidirectional endpoint (a Windows named
//! pipe such as a Hyper-V VM's COM port, or a Unix-domain socket) and
//! shuttles bytes both ways: keystrokes go to the channel, channel output
//! goes to the terminal and optionally to a log file.
//!
//! # Quick Start
//!
//! ```text
//! pipeterm \\.\pipe\vm-com1                 # attach to a VM console
//! pipeterm -l boot.log \\.\pipe\vm-com1     # ...and keep a copy of its output
//! pipeterm /run/qemu/serial0.sock           # Unix socket console
//! ```
//!
//! Type `~.` at the start of a line to detach.

mod config;
mod core;
mod platform;
mod terminal;

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::core::{Error, Session};
use crate::terminal::TerminalMode;

/// Command line
#[derive(Parser, Debug)]
#[command(
    name = "pipeterm",
    version,
    about = "Attach the terminal to a named pipe or socket console",
    after_help = "Type ~. at the start of a line to detach."
)]
struct Cli {
    /// Append everything received from the channel to LOGFILE
    #[arg(short = 'l', long = "log", value_name = "LOGFILE")]
    log: Option<PathBuf>,

    /// Configuration file [default: ~/.pipeterm/config.toml]
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Named pipe (\\.\pipe\NAME) or Unix socket path
    #[arg(value_name = "CHANNEL")]
    channel: String,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version
        Err(e) if !e.use_stderr() => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => return finish(None, Err(Error::Usage(e.render().to_string()))),
    };

    let (config, problem) = Config::load(cli.config.as_deref());

    // The terminal carries channel traffic, so diagnostics go to a file
    if let Err(e) = init_logging(&config) {
        eprintln!("pipeterm: diagnostic log disabled: {e:#}");
    }
    if let Some(problem) = problem {
        warn!(%problem, "ignoring configuration file");
    }
    info!(channel = %cli.channel, log = ?cli.log, ?config, "pipeterm starting");

    let (terminal, result) = run(&cli, &config);
    finish(terminal, result)
}

/// Install the file subscriber
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let path = config.diagnostic_log_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .with_context(|| format!("invalid log_level {:?}", config.log_level))?,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("installing tracing subscriber")?;
    Ok(())
}

/// Acquire the channel, log and terminal, then run the session.
///
/// The terminal guard is handed back rather than dropped here so that
/// [`finish`] restores it on every path before reporting.
fn run(cli: &Cli, config: &Config) -> (Option<TerminalMode>, core::Result<()>) {
    let streams = match platform::open(&cli.channel, cli.log.as_deref()) {
        Ok(streams) => streams,
        Err(err) => return (None, Err(err)),
    };

    let terminal = match TerminalMode::enter() {
        Ok(terminal) => terminal,
        Err(e) => return (None, Err(Error::setup("terminal mode", e))),
    };

    let mut session = Session::new(streams, config.session_options());
    let result = session.run();
    // Cancels in-flight I/O and closes the channel and log
    drop(session);

    (Some(terminal), result)
}

/// The one teardown path: restore the terminal, report, pick the exit code
fn finish(terminal: Option<TerminalMode>, result: core::Result<()>) -> ExitCode {
    if let Some(mut terminal) = terminal {
        if let Err(err) = terminal.restore() {
            warn!(%err, "failed to restore terminal mode");
        }
    }

    match result {
        Ok(()) => {
            info!("detached");
            ExitCode::SUCCESS
        }
        Err(Error::Usage(text)) => {
            eprint!("{text}");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(%err, "exiting");
            eprintln!("pipeterm: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_log_and_channel() {
        let cli = Cli::try_parse_from(["pipeterm", "-l", "boot.log", r"\\.\pipe\vm"]).unwrap();
        assert_eq!(cli.log, Some(PathBuf::from("boot.log")));
        assert_eq!(cli.channel, r"\\.\pipe\vm");
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_requires_channel() {
        let err = Cli::try_parse_from(["pipeterm", "-l", "boot.log"]).unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn test_cli_help_is_not_an_error() {
        let err = Cli::try_parse_from(["pipeterm", "--help"]).unwrap_err();
        assert!(!err.use_stderr());
    }
}
