//! Tracing setup for simulation runs.
//!
//! Console output follows the level chosen on the command line (or
//! `RUST_LOG`), while every event down to TRACE goes to a per-run log file so
//! a finished simulation can be inspected block by block.

use std::fs::{File, create_dir_all};
use std::io;
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File name of the trace log, overwritten on every run.
pub const LOG_FILE_NAME: &str = "swarmsim-last-run.log";

/// Creates `logs_dir` (default `./logs`) and truncates the run log inside it.
///
/// # Errors
/// - `io::Error` - The directory cannot be created or the file cannot be opened
pub fn open_run_log(logs_dir: Option<&Path>) -> io::Result<(PathBuf, File)> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_path)?;

    let log_file_path = logs_path.join(LOG_FILE_NAME);
    let log_file = File::create(&log_file_path)?;
    Ok((log_file_path, log_file))
}

/// Installs the global subscriber: console at `console_level`, file at TRACE.
///
/// Returns the path of the run log.
///
/// # Errors
/// - `io::Error` - The run log cannot be opened, or a global subscriber is
///   already installed
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> io::Result<PathBuf> {
    let (log_file_path, log_file) = open_run_log(logs_dir)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(io::Error::other)?;

    tracing::info!(
        "Tracing initialized: console={}, trace_file={}",
        console_level,
        log_file_path.display()
    );

    Ok(log_file_path)
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warnings and errors, including unreachable peers
    Warn,
    /// Lifecycle events: registration, seed promotion, baseline resets
    Info,
    /// Per-block negotiation and transfer events
    Debug,
    /// Everything
    Trace,
}

impl CliLogLevel {
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_tracing_level().as_str().to_lowercase())
    }
}
