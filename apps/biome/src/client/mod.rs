//! Protocol client: one socket to the world engine, typed events out.
//!
//! The client never reads from the socket itself. The link task reports
//! [`SocketSignal`]s through the [`SignalSink`] given at construction and the
//! owner feeds them back through [`ProtocolClient::handle_signal`], so every
//! state change happens on the owner's task.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::frame::Frame;
use crate::protocol::{
    ClientMessage, EndpointError, ServerMessage, ServerStatusCode, normalize_endpoint_with,
    validate_endpoint,
};
use crate::telemetry::{PerfGuard, Probe};
use crate::transport::{Connector, LinkId, SocketSignal, spawn_link};

/// Socket signal tagged with the link that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSignal {
    pub link: LinkId,
    pub signal: SocketSignal,
}

pub type SignalSink = Arc<dyn Fn(LinkSignal) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// What a signal meant, after the client applied it to its own state.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Opened,
    Status {
        code: ServerStatusCode,
        became_ready: bool,
    },
    Frame(Frame),
    Stats,
    RemoteError(String),
    SocketError(String),
    Closed {
        previous: ConnectionState,
    },
}

pub struct ProtocolClient {
    connector: Arc<dyn Connector>,
    sink: SignalSink,
    secure: bool,
    link: LinkId,
    state: ConnectionState,
    url: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    ready: bool,
    status: Option<ServerStatusCode>,
    frame: Option<Frame>,
    last_error: Option<String>,
    last_generation_ms: Option<f64>,
    last_frame_id: Option<u64>,
}

impl ProtocolClient {
    pub fn new(connector: Arc<dyn Connector>, sink: SignalSink) -> Self {
        Self {
            connector,
            sink,
            secure: false,
            link: 0,
            state: ConnectionState::Disconnected,
            url: None,
            outbound: None,
            ready: false,
            status: None,
            frame: None,
            last_error: None,
            last_generation_ms: None,
            last_frame_id: None,
        }
    }

    /// Bare `host:port` endpoints get `wss://` instead of `ws://`.
    pub fn with_secure_default(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Opens a link to `endpoint`. Returns `Ok(false)` when a link is
    /// already connecting or connected.
    pub fn connect(&mut self, endpoint: &str) -> Result<bool, EndpointError> {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            trace!(target: "biome::client", state = ?self.state, "connect ignored");
            return Ok(false);
        }
        let url = normalize_endpoint_with(&validate_endpoint(endpoint)?, self.secure);
        self.reset_derived();
        self.link += 1;
        let link = self.link;
        debug!(target: "biome::client", link, url = %url, "connecting");

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = self.sink.clone();
        spawn_link(self.connector.clone(), url.clone(), rx, move |signal| {
            sink(LinkSignal { link, signal })
        });
        self.outbound = Some(tx);
        self.url = Some(url);
        self.state = ConnectionState::Connecting;
        Ok(true)
    }

    /// Applies a link signal. Signals from links replaced by a later
    /// `connect` or `disconnect` are dropped.
    pub fn handle_signal(&mut self, signal: LinkSignal) -> Option<ClientEvent> {
        if signal.link != self.link || self.outbound.is_none() {
            trace!(target: "biome::client", link = signal.link, current = self.link, "stale link signal");
            return None;
        }
        match signal.signal {
            SocketSignal::Opened => {
                self.state = ConnectionState::Connected;
                debug!(target: "biome::client", link = self.link, "connected");
                Some(ClientEvent::Opened)
            }
            SocketSignal::Text(text) => self.handle_text(&text),
            SocketSignal::Error(reason) => {
                warn!(target: "biome::client", link = self.link, error = %reason, "socket error");
                self.state = ConnectionState::Error;
                self.last_error = Some(reason.clone());
                Some(ClientEvent::SocketError(reason))
            }
            SocketSignal::Closed => {
                let previous = self.state;
                debug!(target: "biome::client", link = self.link, ?previous, "socket closed");
                self.outbound = None;
                self.reset_derived();
                self.state = ConnectionState::Disconnected;
                Some(ClientEvent::Closed { previous })
            }
        }
    }

    fn handle_text(&mut self, text: &str) -> Option<ClientEvent> {
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(target: "biome::client", error = %err, "dropping malformed message");
                return None;
            }
        };
        match message {
            ServerMessage::Status { code } => {
                let code = ServerStatusCode::new(code);
                let became_ready = code.is_ready() && !self.ready;
                if became_ready {
                    self.ready = true;
                }
                debug!(target: "biome::client", code = %code, became_ready, "server status");
                self.status = Some(code.clone());
                Some(ClientEvent::Status { code, became_ready })
            }
            ServerMessage::Frame {
                data,
                frame_id,
                gen_ms,
            } => {
                let payload = {
                    let _guard = PerfGuard::new(Probe::FrameBase64);
                    match BASE64.decode(data.as_bytes()) {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            debug!(target: "biome::client", frame_id, error = %err, "dropping frame with bad payload");
                            return None;
                        }
                    }
                };
                let frame = Frame {
                    payload: Bytes::from(payload),
                    sequence_id: frame_id,
                    generation_time_ms: gen_ms,
                };
                self.last_frame_id = Some(frame_id);
                if gen_ms.is_some() {
                    self.last_generation_ms = gen_ms;
                }
                self.frame = Some(frame.clone());
                Some(ClientEvent::Frame(frame))
            }
            ServerMessage::Stats { gentime, frame } => {
                if gentime.is_some() {
                    self.last_generation_ms = gentime;
                }
                if frame.is_some() {
                    self.last_frame_id = frame;
                }
                Some(ClientEvent::Stats)
            }
            ServerMessage::Error { message } => {
                warn!(target: "biome::client", error = %message, "server reported error");
                self.state = ConnectionState::Error;
                self.last_error = Some(message.clone());
                Some(ClientEvent::RemoteError(message))
            }
            ServerMessage::Unknown => {
                trace!(target: "biome::client", "ignoring unknown message type");
                None
            }
        }
    }

    fn send(&self, message: ClientMessage) -> bool {
        if self.state != ConnectionState::Connected {
            trace!(target: "biome::client", kind = message.kind(), state = ?self.state, "send skipped, socket not open");
            return false;
        }
        let Some(outbound) = self.outbound.as_ref() else {
            return false;
        };
        let text = match message.to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(target: "biome::client", kind = message.kind(), error = %err, "failed to encode message");
                return false;
            }
        };
        outbound.send(text).is_ok()
    }

    pub fn send_control(&self, buttons: Vec<String>, mouse_dx: i32, mouse_dy: i32) -> bool {
        self.send(ClientMessage::Control {
            buttons,
            mouse_dx,
            mouse_dy,
        })
    }

    /// Sends `pause` when `paused`, `resume` otherwise.
    pub fn send_pause(&self, paused: bool) -> bool {
        self.send(if paused {
            ClientMessage::Pause
        } else {
            ClientMessage::Resume
        })
    }

    pub fn send_prompt(&self, prompt: impl Into<String>) -> bool {
        self.send(ClientMessage::Prompt {
            prompt: prompt.into(),
        })
    }

    pub fn send_prompt_with_seed(&self, prompt: impl Into<String>, seed_url: impl Into<String>) -> bool {
        self.send(ClientMessage::PromptWithSeed {
            prompt: prompt.into(),
            seed_url: seed_url.into(),
        })
    }

    pub fn reset(&self) -> bool {
        self.send(ClientMessage::Reset)
    }

    /// Closes the current link, if any, and resets all derived state.
    pub fn disconnect(&mut self) {
        if self.outbound.take().is_some() {
            debug!(target: "biome::client", link = self.link, "disconnecting");
            // Later signals from the closed link are stale.
            self.link += 1;
        }
        self.reset_derived();
        self.state = ConnectionState::Disconnected;
    }

    fn reset_derived(&mut self) {
        self.ready = false;
        self.status = None;
        self.frame = None;
        self.last_error = None;
        self.last_generation_ms = None;
        self.last_frame_id = None;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn status(&self) -> Option<&ServerStatusCode> {
        self.status.as_ref()
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_generation_ms(&self) -> Option<f64> {
        self.last_generation_ms
    }

    pub fn last_frame_id(&self) -> Option<u64> {
        self.last_frame_id
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn link(&self) -> LinkId {
        self.link
    }
}
