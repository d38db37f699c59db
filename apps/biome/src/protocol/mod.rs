//! JSON wire protocol spoken with the world engine over its `/ws` socket.
//!
//! Every message is a text frame holding one object tagged by `type`.

pub mod endpoint;

pub use endpoint::{
    EndpointError, WS_PATH, normalize_endpoint, normalize_endpoint_with, validate_endpoint,
};

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Status code the server sends once it accepts control input.
pub const STATUS_READY: &str = "ready";

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Control {
        buttons: Vec<String>,
        mouse_dx: i32,
        mouse_dy: i32,
    },
    Pause,
    Resume,
    Prompt {
        prompt: String,
    },
    PromptWithSeed {
        prompt: String,
        seed_url: String,
    },
    Reset,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Control { .. } => "control",
            ClientMessage::Pause => "pause",
            ClientMessage::Resume => "resume",
            ClientMessage::Prompt { .. } => "prompt",
            ClientMessage::PromptWithSeed { .. } => "prompt_with_seed",
            ClientMessage::Reset => "reset",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Server → client messages. Types this client does not know decode to
/// [`ServerMessage::Unknown`] and are ignored by the caller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        code: String,
    },
    Frame {
        data: String,
        frame_id: u64,
        #[serde(default)]
        gen_ms: Option<f64>,
    },
    Stats {
        #[serde(default)]
        gentime: Option<f64>,
        #[serde(default)]
        frame: Option<u64>,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Opaque warm-up status token reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerStatusCode(String);

impl ServerStatusCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_ready(&self) -> bool {
        self.0 == STATUS_READY
    }

    pub fn display_text(&self) -> Cow<'_, str> {
        status_display_text(&self.0)
    }
}

impl fmt::Display for ServerStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human readable text for a server status code; unknown codes pass through.
pub fn status_display_text(code: &str) -> Cow<'_, str> {
    match code {
        "warmup" | "warming-up" => Cow::Borrowed("Warming up engine..."),
        "init" | "initializing" => Cow::Borrowed("Initializing engine..."),
        "loading" => Cow::Borrowed("Loading world..."),
        "ready" => Cow::Borrowed("Ready"),
        "reset" | "resetting" => Cow::Borrowed("Resetting world..."),
        other => Cow::Borrowed(other),
    }
}
