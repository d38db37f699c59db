use clap::{Args, Parser, ValueEnum, builder::BoolishValueParser};
use directories::BaseDirs;
use std::path::PathBuf;

use crate::config::{AppConfig, EngineMode};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "biome",
    about = "Stream a generated world from a local or remote engine",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[arg(
        value_name = "ENDPOINT",
        help = "Connect immediately to host[:port] or a ws:// URL"
    )]
    pub endpoint: Option<String>,

    #[arg(
        long,
        env = "BIOME_CONFIG",
        value_name = "PATH",
        help = "Settings file (defaults to <config dir>/biome/config.json)"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        value_enum,
        help = "Run the engine locally or connect to a remote server"
    )]
    pub mode: Option<ModeArg>,

    #[arg(
        long,
        value_name = "PORT",
        help = "Port for the local engine (standalone mode)"
    )]
    pub port: Option<u16>,

    #[arg(
        long,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        value_name = "BOOL",
        help = "Use wss:// for bare host:port endpoints"
    )]
    pub ssl: Option<bool>,

    #[arg(
        long,
        value_name = "FACTOR",
        help = "Mouse sensitivity multiplier"
    )]
    pub sensitivity: Option<f64>,

    #[arg(
        long = "engine-dir",
        env = "BIOME_ENGINE_DIR",
        value_name = "DIR",
        help = "Directory containing server.py and its .venv"
    )]
    pub engine_dir: Option<PathBuf>,

    #[arg(
        long = "seeds-dir",
        env = "BIOME_SEEDS_DIR",
        value_name = "DIR",
        help = "Directory of seed images offered by the prompt"
    )]
    pub seeds_dir: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Standalone,
    Server,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "BIOME_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "BIOME_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    /// Logs go to a file unless one is named: stderr belongs to the
    /// full-screen UI while it runs.
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone().or_else(default_log_file),
        }
    }
}

/// `<local data dir>/biome/biome.log`.
pub fn default_log_file() -> Option<PathBuf> {
    BaseDirs::new().map(|base| base.data_local_dir().join("biome").join(LOG_FILE_NAME))
}

const LOG_FILE_NAME: &str = "biome.log";

impl Cli {
    /// Command-line flags win over the settings file.
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(mode) = self.mode {
            config.features.engine_mode = match mode {
                ModeArg::Standalone => EngineMode::Standalone,
                ModeArg::Server => EngineMode::Server,
            };
        }
        if let Some(port) = self.port {
            config.gpu_server.port = port;
        }
        if let Some(ssl) = self.ssl {
            config.gpu_server.use_ssl = ssl;
        }
        if let Some(sensitivity) = self.sensitivity {
            config.controls.mouse_sensitivity = sensitivity;
        }
        if let Some(dir) = &self.engine_dir {
            config.engine_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.seeds_dir {
            config.seeds_dir = Some(dir.clone());
        }
    }
}
