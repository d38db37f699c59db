//! Session orchestration: one attempt at a time from submit to teardown.

use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::engine::{EngineError, STANDALONE_PORT};
use crate::portal::{DEFAULT_TEARDOWN_DELAY, PortalState};

pub mod events;
pub mod orchestrator;

pub use events::{
    AttemptId, Command, EngineEvent, HostRequest, InputEvent, SessionEvent, SurfaceAttachment,
    TimerKind,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig, SessionHandle, SessionParts};

/// Longest error text shown to the user; the full text stays in the context.
pub const ERROR_DISPLAY_LIMIT: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    StartingEngine,
    ConnectingSocket,
    AwaitingFirstFrame,
    AwaitingReadySignal,
    Streaming,
    ConnectionLost,
    ShuttingDown,
}

/// Whether the user is driving the engine, and if not, why.
///
/// Pause and the settings menu are the same state seen from two sides, so
/// they are one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FocusMode {
    #[default]
    Active,
    /// Pointer capture or window focus was lost.
    Paused,
    /// The user opened the menu.
    Menu,
}

impl FocusMode {
    pub fn is_paused(self) -> bool {
        self != FocusMode::Active
    }

    pub fn settings_open(self) -> bool {
        self != FocusMode::Active
    }
}

/// Policy delays for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub first_frame_timeout: Duration,
    pub engine_ready_timeout: Duration,
    pub warmup_grace: Duration,
    pub input_error_display: Duration,
    pub teardown_delay: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            first_frame_timeout: Duration::from_secs(60),
            engine_ready_timeout: Duration::from_secs(120),
            warmup_grace: Duration::from_secs(2),
            input_error_display: Duration::from_secs(3),
            teardown_delay: DEFAULT_TEARDOWN_DELAY,
        }
    }
}

/// Why the last attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("No frames received from {endpoint} within {secs} seconds")]
    FirstFrameTimeout { endpoint: String, secs: u64 },
}

impl SessionError {
    /// Single-line text safe to put on screen.
    pub fn display_text(&self) -> String {
        sanitize_for_display(&self.to_string(), ERROR_DISPLAY_LIMIT)
    }
}

/// Flattens control characters to spaces, collapses runs of whitespace and
/// cuts the text to `limit` characters with a trailing ellipsis.
pub fn sanitize_for_display(text: &str, limit: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let collapsed = flat.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= limit {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(limit.saturating_sub(1)).collect();
    cut.truncate(cut.trim_end().len());
    cut.push('…');
    cut
}

/// Read-only view of the orchestrator, republished after every event.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub phase: Phase,
    pub portal: PortalState,
    pub endpoint: Option<String>,
    pub standalone: bool,
    pub focus: FocusMode,
    pub paused_at: Option<Instant>,
    pub connection_lost: bool,
    pub last_error: Option<SessionError>,
    pub mouse_sensitivity: f64,
    pub server_status: Option<String>,
    pub server_ready: bool,
    pub input_enabled: bool,
    pub input_error: Option<String>,
    pub fps: u32,
}

impl SessionContext {
    pub fn new(standalone: bool, mouse_sensitivity: f64) -> Self {
        Self {
            phase: Phase::Idle,
            portal: PortalState::Cold,
            endpoint: None,
            standalone,
            focus: FocusMode::Active,
            paused_at: None,
            connection_lost: false,
            last_error: None,
            mouse_sensitivity,
            server_status: None,
            server_ready: false,
            input_enabled: false,
            input_error: None,
            fps: 0,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.focus.is_paused()
    }

    pub fn settings_open(&self) -> bool {
        self.focus.settings_open()
    }

    /// Text for the status line, error first.
    pub fn headline(&self) -> String {
        if let Some(error) = &self.input_error {
            return sanitize_for_display(error, ERROR_DISPLAY_LIMIT);
        }
        if self.connection_lost {
            return "Connection lost. Press Enter to return.".to_string();
        }
        if let Some(error) = &self.last_error {
            return error.display_text();
        }
        match self.phase {
            Phase::Idle => "Enter an endpoint to connect.".to_string(),
            Phase::StartingEngine => "Starting local engine...".to_string(),
            Phase::ConnectingSocket => "Connecting...".to_string(),
            Phase::ShuttingDown => "Disconnecting...".to_string(),
            _ if self.focus == FocusMode::Menu => "Menu open. Esc to resume.".to_string(),
            _ if self.is_paused() => "Paused. Click to resume.".to_string(),
            _ => self
                .server_status
                .clone()
                .unwrap_or_else(|| "Waiting for the engine...".to_string()),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let standalone = config.features.engine_mode.is_standalone();
        Self {
            standalone,
            standalone_port: if standalone {
                config.gpu_server.port
            } else {
                STANDALONE_PORT
            },
            secure: config.gpu_server.use_ssl,
            mouse_sensitivity: config.controls.mouse_sensitivity,
            timings: SessionTimings::default(),
        }
    }
}
