use clap::ValueEnum;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Full filter override, e.g. `BIOME_LOG_FILTER=biome::client=trace,warn`.
pub const FILTER_ENV: &str = "BIOME_LOG_FILTER";
/// Lets socket and image crates log below `info` at trace level.
pub const DEPENDENCY_TRACE_ENV: &str = "BIOME_TRACE_DEPS";

/// Crates that flood the log at trace level during a stream.
const CHATTY_CRATES: &[&str] = &["tokio_tungstenite", "tungstenite", "mio", "image", "png"];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Filter directives for this level. Debug and trace only widen our own
    /// targets; everything else stays at `info`.
    pub fn directives(self, dependency_traces: bool) -> String {
        let ours = |level: &str| format!("info,biome={level},biome_client_core={level}");
        match self {
            LogLevel::Error => "error".into(),
            LogLevel::Warn => "warn".into(),
            LogLevel::Info => "info".into(),
            LogLevel::Debug => ours("debug"),
            LogLevel::Trace if dependency_traces => "trace".into(),
            LogLevel::Trace => CHATTY_CRATES
                .iter()
                .fold(ours("trace"), |acc, &krate| acc + "," + krate + "=info"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file; stderr when absent.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum LogInitError {
    #[error("cannot open log file {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("a global logger is already installed")]
    AlreadyInstalled,
}

/// Keeps the background writer flushing. Drop it last.
#[must_use = "logs stop being written once the handle is dropped"]
pub struct LogHandle {
    _flush: WorkerGuard,
}

/// Installs the global subscriber, creating the log file's directory when needed.
pub fn init(config: &LogConfig) -> Result<LogHandle, LogInitError> {
    let filter = match std::env::var(FILTER_ENV) {
        Ok(custom) => EnvFilter::new(custom),
        Err(_) => EnvFilter::new(config.level.directives(super::flag(DEPENDENCY_TRACE_ENV))),
    };

    let (writer, flush) = match &config.file {
        Some(path) => {
            let open = || {
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                OpenOptions::new().create(true).append(true).open(path)
            };
            let file = open().map_err(|source| LogInitError::Open {
                path: path.clone(),
                source,
            })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(config.file.is_none())
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_names(config.level == LogLevel::Trace)
        .try_init()
        .map_err(|_| LogInitError::AlreadyInstalled)?;

    Ok(LogHandle { _flush: flush })
}
