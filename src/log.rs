//! Structured logging for debugging wavefront.
//!
//! Log levels:
//! - ERROR: Failures that end a task or the run
//! - WARN: Recoverable conditions (soft gate failures, stale runs, merge conflicts)
//! - INFO: Run, wave and task lifecycle
//! - DEBUG: Subprocess, git and scheduler detail
//! - TRACE: Very detailed traces (prompts, subprocess output)
//!
//! Debug mode can be enabled with `--debug` flag or `WAVEFRONT_DEBUG=1` env var.
//! `WAVEFRONT_LOG` takes an `EnvFilter` directive and wins over both.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Env var holding an explicit filter directive.
pub const LOG_ENV: &str = "WAVEFRONT_LOG";
/// Env var enabling debug level.
pub const DEBUG_ENV: &str = "WAVEFRONT_DEBUG";

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Initialize logging to ~/.wavefront/wavefront.log
///
/// The log file is truncated on startup. Warnings and errors are mirrored to
/// stderr. Calling this more than once is harmless.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr.with_max_level(Level::WARN));

    let file_layer = open_log_file().map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(Mutex::new(file))
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "wavefront=debug,info"
    } else {
        "info"
    }
}

fn open_log_file() -> Option<std::fs::File> {
    let dir = dirs::home_dir()?.join(".wavefront");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("wavefront.log");
    // Truncate file on startup
    let file = std::fs::File::create(&path).ok()?;
    LOG_PATH.set(path).ok();
    Some(file)
}

/// Path of the active log file, if one could be opened.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}
