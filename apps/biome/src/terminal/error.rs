use crate::config::ConfigError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("no engine directory configured; pass --engine-dir")]
    MissingEngineDir,
    #[error("session task failed: {0}")]
    Session(String),
}
