//! Lifecycle of the locally hosted world engine.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod process;

pub use process::{EngineCommand, ProcessEngineGateway};

/// Port the standalone engine listens on unless configured otherwise.
pub const STANDALONE_PORT: u16 = 7987;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub dependencies_ready: bool,
    pub server_running: bool,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Engine dependencies are not installed. Please run setup first.")]
    DependenciesMissing,
    #[error("server is already running on port {0}")]
    AlreadyRunning(u16),
    #[error("failed to start server: {0}")]
    Spawn(String),
    #[error("server process exited immediately with {status}\n\nLast log output:\n{log_tail}")]
    ExitedEarly { status: String, log_tail: String },
    #[error("server did not report ready within {0} seconds")]
    ReadyTimeout(u64),
    #[error("no server is currently running")]
    NotRunning,
    #[error("engine I/O error: {0}")]
    Io(String),
}

/// Status and control of the local engine process.
///
/// `subscribe_ready` must be called before `start`: the ready signal is a
/// broadcast and is not replayed to late subscribers.
#[async_trait]
pub trait EngineGateway: Send + Sync {
    async fn status(&self) -> EngineStatus;
    async fn start(&self, port: u16) -> Result<(), EngineError>;
    async fn stop(&self) -> Result<(), EngineError>;
    fn subscribe_ready(&self) -> broadcast::Receiver<()>;

    async fn is_port_in_use(&self, port: u16) -> bool {
        port_in_use(port)
    }
}

/// Whether something already listens on `127.0.0.1:port`.
pub fn port_in_use(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_err()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_port_is_reported_in_use() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_in_use(port));
        drop(listener);
        assert!(!port_in_use(port));
    }

    #[test]
    fn early_exit_message_carries_log_tail() {
        let err = EngineError::ExitedEarly {
            status: "exit code 1".into(),
            log_tail: "ModuleNotFoundError: torch".into(),
        };
        let text = err.to_string();
        assert!(text.starts_with("server process exited immediately with exit code 1"));
        assert!(text.ends_with("ModuleNotFoundError: torch"));
    }
}
