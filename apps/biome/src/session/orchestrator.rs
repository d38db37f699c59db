use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::events::{
    AttemptId, Command, EngineEvent, HostRequest, InputEvent, SessionEvent, TimerKind,
};
use super::{FocusMode, Phase, SessionContext, SessionError, SessionTimings};
use crate::client::{ClientEvent, ConnectionState, ProtocolClient};
use crate::engine::{EngineError, EngineGateway, STANDALONE_PORT};
use crate::frame::{DecodedFrame, FrameError, FramePipeline, PresentationSurface};
use crate::input::{DispatchLoop, InputCapture, KeyOutcome, ReservedAction, scale_delta};
use crate::portal::{PortalState, PortalStateMachine};
use crate::protocol::validate_endpoint;
use crate::telemetry::{PerfGuard, Probe};
use crate::transport::Connector;

/// How often the frame rate is republished while the portal is hot.
const FRAME_RATE_REFRESH: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub standalone: bool,
    /// Port a locally managed engine is started on.
    pub standalone_port: u16,
    /// Bare endpoints use `wss://`.
    pub secure: bool,
    pub mouse_sensitivity: f64,
    pub timings: SessionTimings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            standalone: false,
            standalone_port: STANDALONE_PORT,
            secure: false,
            mouse_sensitivity: 1.0,
            timings: SessionTimings::default(),
        }
    }
}

/// Posts events to a running orchestrator.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    /// Returns `false` once the orchestrator has stopped.
    pub fn send(&self, event: impl Into<SessionEvent>) -> bool {
        self.tx.send(event.into()).is_ok()
    }

    pub fn submit(&self, endpoint: impl Into<String>) -> bool {
        self.send(Command::Submit(endpoint.into()))
    }

    pub fn logout(&self) -> bool {
        self.send(Command::Logout)
    }

    pub fn dismiss_connection_lost(&self) -> bool {
        self.send(Command::DismissConnectionLost)
    }

    pub fn input(&self, input: InputEvent) -> bool {
        self.send(input)
    }

    pub fn attach_surface(&self, surface: Box<dyn PresentationSurface>) -> bool {
        self.send(Command::AttachSurface(super::SurfaceAttachment(surface)))
    }

    pub fn shutdown(&self) -> bool {
        self.send(Command::Shutdown)
    }
}

/// Channels handed back alongside a new orchestrator.
pub struct SessionParts {
    pub handle: SessionHandle,
    pub host_requests: mpsc::UnboundedReceiver<HostRequest>,
    pub context: watch::Receiver<SessionContext>,
}

/// Owns every piece of session state and is the only thing that changes it.
///
/// Sockets, timers, the engine, the dispatch loop and frame decoders all run
/// elsewhere and report back as [`SessionEvent`]s on one channel, which
/// [`Orchestrator::run`] consumes in order.
pub struct Orchestrator {
    config: OrchestratorConfig,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    host_tx: mpsc::UnboundedSender<HostRequest>,
    context_tx: watch::Sender<SessionContext>,
    ctx: SessionContext,
    portal: PortalStateMachine,
    client: ProtocolClient,
    capture: InputCapture,
    dispatch: DispatchLoop,
    frames: FramePipeline,
    engine: Arc<dyn EngineGateway>,
    attempt: AttemptId,
    timers: Vec<(TimerKind, JoinHandle<()>)>,
    ready_forwarder: Option<JoinHandle<()>>,
    engine_port: u16,
    engine_started_here: bool,
    frames_received: u64,
    failure_latched: bool,
    input_error_seq: u64,
    running: bool,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        connector: Arc<dyn Connector>,
        engine: Arc<dyn EngineGateway>,
    ) -> (Self, SessionParts) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (host_tx, host_requests) = mpsc::unbounded_channel();
        let ctx = SessionContext::new(config.standalone, config.mouse_sensitivity);
        let (context_tx, context) = watch::channel(ctx.clone());

        let link_tx = events_tx.clone();
        let client = ProtocolClient::new(
            connector,
            Arc::new(move |signal| {
                let _ = link_tx.send(SessionEvent::Link(signal));
            }),
        )
        .with_secure_default(config.secure);

        let tick_tx = events_tx.clone();
        let dispatch = DispatchLoop::new(Arc::new(move |generation| {
            let _ = tick_tx.send(SessionEvent::InputTick { generation });
        }));

        let decode_tx = events_tx.clone();
        let frames = FramePipeline::new(Arc::new(move |attempt, result| {
            let _ = decode_tx.send(SessionEvent::FrameDecoded { attempt, result });
        }));

        if config.standalone {
            info!(target: "biome::session", port = config.standalone_port, "standalone engine mode");
        }

        let orchestrator = Self {
            portal: PortalStateMachine::with_teardown_delay(config.timings.teardown_delay),
            engine_port: config.standalone_port,
            config,
            events_tx: events_tx.clone(),
            events_rx,
            host_tx,
            context_tx,
            ctx,
            client,
            capture: InputCapture::new(),
            dispatch,
            frames,
            engine,
            attempt: 0,
            timers: Vec::new(),
            ready_forwarder: None,
            engine_started_here: false,
            frames_received: 0,
            failure_latched: false,
            input_error_seq: 0,
            running: true,
        };
        let parts = SessionParts {
            handle: SessionHandle { tx: events_tx },
            host_requests,
            context,
        };
        (orchestrator, parts)
    }

    /// Portal transitions as `(new, previous)` pairs, in order.
    pub fn subscribe_portal(&mut self) -> mpsc::UnboundedReceiver<(PortalState, PortalState)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.portal.on_state_change(move |next, previous| {
            let _ = tx.send((next, previous));
        });
        rx
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    pub fn session_handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.events_tx.clone(),
        }
    }

    /// Processes events until [`Command::Shutdown`].
    pub async fn run(mut self) {
        debug!(target: "biome::session", "orchestrator running");
        while self.running {
            if !self.step().await {
                break;
            }
        }
        debug!(target: "biome::session", "orchestrator stopped");
    }

    /// Waits for and handles one event. Returns `false` when no more can come.
    pub async fn step(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => {
                self.handle(event).await;
                true
            }
            None => false,
        }
    }

    /// Applies one event, then republishes the context.
    pub async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Command(command) => self.on_command(command).await,
            SessionEvent::Input(input) => self.on_input(input),
            SessionEvent::Link(signal) => {
                if let Some(event) = self.client.handle_signal(signal) {
                    self.on_client_event(event).await;
                }
            }
            SessionEvent::Engine { attempt, event } => self.on_engine(attempt, event).await,
            SessionEvent::Timer { attempt, kind } => self.on_timer(attempt, kind).await,
            SessionEvent::InputTick { generation } => self.on_tick(generation),
            SessionEvent::FrameDecoded { attempt, result } => self.on_decoded(attempt, result),
            SessionEvent::ClearInputError { seq } => {
                if seq == self.input_error_seq {
                    self.ctx.input_error = None;
                }
            }
        }
        self.publish();
    }

    fn publish(&mut self) {
        self.ctx.portal = self.portal.state();
        self.ctx.server_ready = self.client.is_ready();
        self.ctx.fps = self.frames.fps(Instant::now());
        self.context_tx.send_replace(self.ctx.clone());
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Submit(endpoint) => self.submit(&endpoint).await,
            Command::Logout => {
                info!(target: "biome::session", "logout");
                self.teardown(None).await;
            }
            Command::DismissConnectionLost => {
                if self.ctx.connection_lost {
                    self.teardown(None).await;
                }
            }
            Command::ToggleMenu => self.toggle_menu(),
            Command::Reset => {
                if !self.client.reset() {
                    self.show_input_error("Not connected.");
                }
            }
            Command::SendPrompt(prompt) => {
                if !self.client.send_prompt(prompt) {
                    self.show_input_error("Not connected.");
                }
            }
            Command::SendPromptWithSeed { prompt, seed_url } => {
                if !self.client.send_prompt_with_seed(prompt, seed_url) {
                    self.show_input_error("Not connected.");
                }
            }
            Command::SetMouseSensitivity(value) => {
                if value.is_finite() && value > 0.0 {
                    self.ctx.mouse_sensitivity = value;
                }
            }
            Command::AttachSurface(surface) => {
                self.frames.register_surface(surface.0);
                self.try_advance();
            }
            Command::DetachSurface => {
                self.frames.unregister_surface();
            }
            Command::Shutdown => {
                if self.ctx.phase != Phase::Idle || self.portal.state() != PortalState::Cold {
                    self.teardown(None).await;
                }
                self.running = false;
            }
        }
    }

    async fn submit(&mut self, endpoint: &str) {
        if self.ctx.phase != Phase::Idle {
            debug!(target: "biome::session", phase = ?self.ctx.phase, "submit ignored, attempt in progress");
            return;
        }
        let endpoint = match validate_endpoint(endpoint) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.show_input_error(&err.to_string());
                return;
            }
        };

        self.attempt += 1;
        self.failure_latched = false;
        self.frames_received = 0;
        self.ctx.endpoint = Some(endpoint.clone());
        self.ctx.last_error = None;
        self.ctx.input_error = None;
        self.ctx.connection_lost = false;
        self.ctx.server_status = None;
        info!(target: "biome::session", attempt = self.attempt, endpoint = %endpoint, standalone = self.config.standalone, "session attempt");

        if let Err(err) = self.portal.transition_to(PortalState::Warm) {
            warn!(target: "biome::session", error = %err, "portal refused warm");
            return;
        }

        if self.config.standalone {
            self.ctx.phase = Phase::StartingEngine;
            let engine = self.engine.clone();
            let tx = self.events_tx.clone();
            let attempt = self.attempt;
            tokio::spawn(async move {
                let status = engine.status().await;
                let port_in_use = !status.server_running && engine.is_port_in_use(status.port).await;
                let _ = tx.send(SessionEvent::Engine {
                    attempt,
                    event: EngineEvent::Status {
                        status,
                        port_in_use,
                    },
                });
            });
        } else {
            self.begin_connect(&endpoint).await;
        }
    }

    async fn begin_connect(&mut self, endpoint: &str) {
        self.ctx.phase = Phase::ConnectingSocket;
        match self.client.connect(endpoint) {
            Ok(true) => {
                self.arm_timer(TimerKind::FirstFrame, self.config.timings.first_frame_timeout);
            }
            Ok(false) => {
                debug!(target: "biome::session", "socket already connecting");
            }
            Err(err) => {
                self.fail(SessionError::ConnectionFailed(err.to_string())).await;
            }
        }
    }

    async fn on_engine(&mut self, attempt: AttemptId, event: EngineEvent) {
        if attempt != self.attempt {
            if let EngineEvent::Started(Ok(())) = event {
                // A server we started for an abandoned attempt must not linger.
                info!(target: "biome::session", attempt, "stopping engine started by a stale attempt");
                let engine = self.engine.clone();
                tokio::spawn(async move {
                    if let Err(err) = engine.stop().await {
                        debug!(target: "biome::session", error = %err, "stale engine stop");
                    }
                });
            } else {
                trace!(target: "biome::session", attempt, current = self.attempt, "stale engine event");
            }
            return;
        }

        match event {
            EngineEvent::Status {
                status,
                port_in_use,
            } => {
                if self.ctx.phase != Phase::StartingEngine {
                    return;
                }
                debug!(target: "biome::session", ?status, port_in_use, "engine status");
                if !status.dependencies_ready {
                    self.fail(SessionError::Engine(EngineError::DependenciesMissing)).await;
                    return;
                }
                if status.server_running || port_in_use {
                    self.engine_port = status.port;
                    let endpoint = local_endpoint(self.engine_port);
                    self.begin_connect(&endpoint).await;
                    return;
                }
                self.start_engine();
            }
            EngineEvent::Started(Ok(())) => {
                info!(target: "biome::session", port = self.engine_port, "engine process started");
                self.engine_started_here = true;
            }
            EngineEvent::Started(Err(err)) => {
                self.fail(SessionError::Engine(err)).await;
            }
            EngineEvent::Ready => {
                if self.ctx.phase != Phase::StartingEngine {
                    return;
                }
                info!(target: "biome::session", "engine ready, waiting out warm-up grace");
                self.cancel_ready_wait();
                self.arm_timer(TimerKind::WarmupGrace, self.config.timings.warmup_grace);
            }
        }
    }

    fn start_engine(&mut self) {
        let port = self.config.standalone_port;
        self.engine_port = port;
        let attempt = self.attempt;

        // Subscribe before starting so the ready line cannot be missed.
        let mut ready = self.engine.subscribe_ready();
        let tx = self.events_tx.clone();
        self.ready_forwarder = Some(tokio::spawn(async move {
            loop {
                match ready.recv().await {
                    Ok(()) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        let _ = tx.send(SessionEvent::Engine {
                            attempt,
                            event: EngineEvent::Ready,
                        });
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
        self.arm_timer(TimerKind::EngineReady, self.config.timings.engine_ready_timeout);

        let engine = self.engine.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = engine.start(port).await;
            let _ = tx.send(SessionEvent::Engine {
                attempt,
                event: EngineEvent::Started(result),
            });
        });
        info!(target: "biome::session", port, "starting local engine");
    }

    fn cancel_ready_wait(&mut self) {
        if let Some(forwarder) = self.ready_forwarder.take() {
            forwarder.abort();
        }
        self.cancel_timer(TimerKind::EngineReady);
    }

    async fn on_timer(&mut self, attempt: AttemptId, kind: TimerKind) {
        if attempt != self.attempt {
            trace!(target: "biome::session", attempt, ?kind, "stale timer");
            return;
        }
        self.timers.retain(|(existing, _)| *existing != kind);
        match kind {
            TimerKind::FirstFrame => {
                if self.frames_received > 0 || self.portal.state() != PortalState::Warm {
                    return;
                }
                let secs = self.config.timings.first_frame_timeout.as_secs();
                let endpoint = self
                    .client
                    .url()
                    .map(str::to_string)
                    .or_else(|| self.ctx.endpoint.clone())
                    .unwrap_or_default();
                warn!(target: "biome::session", secs, endpoint = %endpoint, "no frame before timeout");
                self.fail(SessionError::FirstFrameTimeout { endpoint, secs }).await;
            }
            TimerKind::EngineReady => {
                if self.ctx.phase != Phase::StartingEngine {
                    return;
                }
                self.cancel_ready_wait();
                let secs = self.config.timings.engine_ready_timeout.as_secs();
                self.fail(SessionError::Engine(EngineError::ReadyTimeout(secs))).await;
            }
            TimerKind::WarmupGrace => {
                if self.ctx.phase != Phase::StartingEngine {
                    return;
                }
                let endpoint = local_endpoint(self.engine_port);
                self.begin_connect(&endpoint).await;
            }
            TimerKind::FrameRate => {
                if matches!(self.portal.state(), PortalState::Hot | PortalState::Streaming)
                    && !self.ctx.connection_lost
                {
                    self.arm_timer(TimerKind::FrameRate, FRAME_RATE_REFRESH);
                }
            }
        }
    }

    fn arm_timer(&mut self, kind: TimerKind, after: Duration) {
        self.cancel_timer(kind);
        let attempt = self.attempt;
        let tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(SessionEvent::Timer { attempt, kind });
        });
        self.timers.push((kind, task));
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        self.timers.retain(|(existing, task)| {
            if *existing == kind {
                task.abort();
                false
            } else {
                true
            }
        });
    }

    fn cancel_all_timers(&mut self) {
        for (_, task) in self.timers.drain(..) {
            task.abort();
        }
    }

    async fn on_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Opened => {
                if self.ctx.phase == Phase::ConnectingSocket {
                    self.ctx.phase = Phase::AwaitingFirstFrame;
                }
            }
            ClientEvent::Status { code, became_ready } => {
                self.ctx.server_status = Some(code.display_text().into_owned());
                if became_ready {
                    info!(target: "biome::session", "server ready");
                }
                self.try_advance();
            }
            ClientEvent::Frame(frame) => {
                self.frames_received += 1;
                if self.frames_received == 1 {
                    debug!(target: "biome::session", seq = frame.sequence_id, "first frame");
                    self.cancel_timer(TimerKind::FirstFrame);
                }
                self.frames.submit(&frame, self.attempt);
                self.try_advance();
            }
            ClientEvent::Stats => {}
            ClientEvent::RemoteError(message) => self.on_link_failure(message).await,
            ClientEvent::SocketError(reason) => self.on_link_failure(reason).await,
            ClientEvent::Closed { previous } => {
                let reason = match previous {
                    ConnectionState::Connecting => "could not reach the server",
                    _ => "the server closed the connection",
                };
                self.on_link_failure(reason.to_string()).await;
            }
        }
    }

    /// Error and close usually arrive back to back; only the first counts.
    async fn on_link_failure(&mut self, reason: String) {
        if self.failure_latched || self.ctx.phase == Phase::Idle {
            trace!(target: "biome::session", reason = %reason, "link failure already handled");
            return;
        }
        self.failure_latched = true;
        match self.portal.state() {
            PortalState::Hot | PortalState::Streaming => {
                warn!(target: "biome::session", reason = %reason, "connection lost");
                self.ctx.connection_lost = true;
                self.ctx.last_error = Some(SessionError::ConnectionLost(reason));
                self.ctx.phase = Phase::ConnectionLost;
                self.cancel_all_timers();
                self.update_input_enabled();
            }
            PortalState::Warm => {
                self.fail(SessionError::ConnectionFailed(reason)).await;
            }
            PortalState::Cold => {}
        }
    }

    fn try_advance(&mut self) {
        if self.ctx.connection_lost {
            return;
        }
        if self.portal.state() == PortalState::Warm
            && self.frames_received > 0
            && self.frames.has_surface()
            && self.portal.transition_to(PortalState::Hot).unwrap_or(false)
        {
            self.ctx.phase = Phase::AwaitingReadySignal;
            self.arm_timer(TimerKind::FrameRate, FRAME_RATE_REFRESH);
        }
        if self.portal.state() == PortalState::Hot
            && self.portal.is_connected()
            && self.client.is_ready()
            && self.portal.transition_to(PortalState::Streaming).unwrap_or(false)
        {
            info!(target: "biome::session", "streaming");
            self.ctx.phase = Phase::Streaming;
            self.ctx.focus = FocusMode::Active;
            self.ctx.paused_at = None;
            self.request_host(HostRequest::CapturePointer);
        }
        self.update_input_enabled();
    }

    fn update_input_enabled(&mut self) {
        let enabled = self.portal.state() == PortalState::Streaming
            && self.client.is_ready()
            && !self.ctx.focus.is_paused()
            && !self.ctx.focus.settings_open()
            && !self.ctx.connection_lost;
        if self.dispatch.set_enabled(enabled) {
            debug!(target: "biome::session", enabled, "input dispatch");
        }
        self.capture.set_dispatch_enabled(enabled);
        self.ctx.input_enabled = enabled;
    }

    fn on_tick(&mut self, generation: u64) {
        if !self.dispatch.accepts(generation) || !self.ctx.input_enabled {
            return;
        }
        let _guard = PerfGuard::new(Probe::ControlDispatch);
        let snapshot = self.capture.take_snapshot();
        let sensitivity = self.ctx.mouse_sensitivity;
        self.client.send_control(
            snapshot.button_names(),
            scale_delta(snapshot.mouse_dx, sensitivity),
            scale_delta(snapshot.mouse_dy, sensitivity),
        );
    }

    fn on_input(&mut self, input: InputEvent) {
        match input {
            InputEvent::KeyDown(key) => match self.capture.key_down(key) {
                KeyOutcome::Consumed(Some(ReservedAction::Reset)) => {
                    debug!(target: "biome::session", "reset requested");
                    self.client.reset();
                }
                KeyOutcome::Consumed(Some(ReservedAction::ToggleMenu)) => self.toggle_menu(),
                _ => {}
            },
            InputEvent::KeyUp(key) => {
                self.capture.key_up(key);
            }
            InputEvent::MouseDown(button) => self.capture.mouse_down(button),
            InputEvent::MouseUp(button) => self.capture.mouse_up(button),
            InputEvent::MouseMotion { dx, dy } => {
                self.capture.mouse_motion(dx, dy);
            }
            InputEvent::PointerCaptureChanged(captured) => {
                self.capture.set_pointer_captured(captured);
                if self.portal.state() != PortalState::Streaming || self.ctx.connection_lost {
                    return;
                }
                if captured {
                    self.set_focus(FocusMode::Active);
                } else if self.ctx.focus == FocusMode::Active {
                    self.set_focus(FocusMode::Paused);
                }
            }
            InputEvent::FocusLost => {
                self.capture.focus_lost();
                if self.portal.state() == PortalState::Streaming
                    && !self.ctx.connection_lost
                    && self.ctx.focus == FocusMode::Active
                {
                    self.set_focus(FocusMode::Paused);
                }
            }
            InputEvent::FocusGained => {}
        }
    }

    fn toggle_menu(&mut self) {
        if self.portal.state() != PortalState::Streaming || self.ctx.connection_lost {
            trace!(target: "biome::session", "menu toggle outside streaming");
            return;
        }
        match self.ctx.focus {
            FocusMode::Active => {
                self.set_focus(FocusMode::Menu);
                self.request_host(HostRequest::ReleasePointer);
            }
            FocusMode::Paused | FocusMode::Menu => {
                self.set_focus(FocusMode::Active);
                self.request_host(HostRequest::CapturePointer);
            }
        }
    }

    /// Changes focus, telling the server once per pause/resume edge.
    fn set_focus(&mut self, focus: FocusMode) {
        let previous = self.ctx.focus;
        if previous == focus {
            return;
        }
        self.ctx.focus = focus;
        if previous.is_paused() != focus.is_paused() {
            let paused = focus.is_paused();
            self.ctx.paused_at = paused.then(Instant::now);
            if !self.client.send_pause(paused) {
                debug!(target: "biome::session", paused, "pause state not sent, socket closed");
            }
            info!(target: "biome::session", ?focus, "focus changed");
        }
        if focus.is_paused() {
            self.capture.clear();
        }
        self.update_input_enabled();
    }

    fn on_decoded(&mut self, attempt: AttemptId, result: Result<DecodedFrame, FrameError>) {
        if attempt != self.attempt || self.portal.state() == PortalState::Cold {
            trace!(target: "biome::session", attempt, current = self.attempt, "stale decode");
            return;
        }
        match result {
            Ok(frame) => {
                self.frames.present(&frame, Instant::now());
            }
            Err(err) => debug!(target: "biome::session", error = %err, "frame dropped"),
        }
    }

    fn show_input_error(&mut self, message: &str) {
        self.input_error_seq += 1;
        self.ctx.input_error = Some(message.to_string());
        let seq = self.input_error_seq;
        let after = self.config.timings.input_error_display;
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(SessionEvent::ClearInputError { seq });
        });
    }

    fn request_host(&self, request: HostRequest) {
        trace!(target: "biome::session", ?request, "host request");
        let _ = self.host_tx.send(request);
    }

    async fn fail(&mut self, error: SessionError) {
        warn!(target: "biome::session", error = %error, "session attempt failed");
        self.teardown(Some(error)).await;
    }

    /// The one way out of an attempt. Stops a locally started engine,
    /// closes the socket, releases the pointer and clears transient flags
    /// before the portal settles in `Cold`.
    async fn teardown(&mut self, error: Option<SessionError>) {
        self.ctx.phase = Phase::ShuttingDown;
        self.publish();

        // Everything still in flight for this attempt is now stale.
        self.attempt += 1;
        self.failure_latched = false;
        self.cancel_all_timers();
        if let Some(forwarder) = self.ready_forwarder.take() {
            forwarder.abort();
        }

        self.dispatch.set_enabled(false);
        self.capture.set_dispatch_enabled(false);
        self.capture.clear();

        if self.engine_started_here {
            self.engine_started_here = false;
            match self.engine.stop().await {
                Ok(()) => info!(target: "biome::session", "local engine stopped"),
                Err(err) => warn!(target: "biome::session", error = %err, "failed to stop local engine"),
            }
        }

        self.client.disconnect();
        self.capture.set_pointer_captured(false);
        self.request_host(HostRequest::ReleasePointer);

        self.ctx.focus = FocusMode::Active;
        self.ctx.paused_at = None;
        self.ctx.connection_lost = false;
        self.ctx.server_status = None;
        self.ctx.input_enabled = false;
        self.ctx.last_error = error;
        self.frames_received = 0;
        self.frames.reset_stats();

        self.portal.shutdown().await;
        self.ctx.phase = Phase::Idle;
        debug!(target: "biome::session", "teardown complete");
    }
}

fn local_endpoint(port: u16) -> String {
    format!("localhost:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineStatus;
    use crate::transport::MockConnector;
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    struct NoEngine;

    #[async_trait]
    impl EngineGateway for NoEngine {
        async fn status(&self) -> EngineStatus {
            EngineStatus {
                dependencies_ready: false,
                server_running: false,
                port: STANDALONE_PORT,
            }
        }

        async fn start(&self, _port: u16) -> Result<(), EngineError> {
            Err(EngineError::DependenciesMissing)
        }

        async fn stop(&self) -> Result<(), EngineError> {
            Err(EngineError::NotRunning)
        }

        fn subscribe_ready(&self) -> broadcast::Receiver<()> {
            broadcast::channel(1).1
        }

        async fn is_port_in_use(&self, _port: u16) -> bool {
            false
        }
    }

    fn remote() -> (Orchestrator, SessionParts, Arc<MockConnector>) {
        let (connector, _peers) = MockConnector::new();
        let (orchestrator, parts) = Orchestrator::new(
            OrchestratorConfig::default(),
            connector.clone(),
            Arc::new(NoEngine),
        );
        (orchestrator, parts, connector)
    }

    #[test_timeout::paused_tokio_test(10)]
    async fn invalid_endpoint_shows_error_then_clears() {
        let (mut orch, parts, connector) = remote();
        parts.handle.submit("   ");
        assert!(orch.step().await);
        assert_eq!(orch.context().phase, Phase::Idle);
        assert!(orch.context().input_error.is_some());
        assert_eq!(parts.context.borrow().input_error, orch.context().input_error);

        assert!(orch.step().await);
        assert_eq!(orch.context().input_error, None);
        assert_eq!(connector.connect_attempts(), 0);
    }

    #[test_timeout::paused_tokio_test(10)]
    async fn second_submit_during_attempt_is_ignored() {
        let (mut orch, parts, _connector) = remote();
        let mut portal = orch.subscribe_portal();
        parts.handle.submit("localhost:7987");
        parts.handle.submit("other:1");
        orch.step().await;
        orch.step().await;
        assert_eq!(orch.context().phase, Phase::ConnectingSocket);
        assert_eq!(orch.context().endpoint.as_deref(), Some("localhost:7987"));
        assert_eq!(
            orch.client().url(),
            Some("ws://localhost:7987/ws")
        );
        assert_eq!(
            portal.try_recv().ok(),
            Some((PortalState::Warm, PortalState::Cold))
        );
        assert!(portal.try_recv().is_err());
    }

    #[test_timeout::paused_tokio_test(10)]
    async fn menu_toggle_outside_streaming_is_ignored() {
        let (mut orch, mut parts, _connector) = remote();
        parts.handle.send(Command::ToggleMenu);
        orch.step().await;
        assert_eq!(orch.context().focus, FocusMode::Active);
        assert!(parts.host_requests.try_recv().is_err());
    }

    #[derive(Default)]
    struct BlitCounter(Arc<std::sync::atomic::AtomicUsize>);

    impl PresentationSurface for BlitCounter {
        fn resize(&mut self, _width: u32, _height: u32) {}

        fn blit(&mut self, _frame: &DecodedFrame) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn decoded(sequence_id: u64) -> Result<DecodedFrame, FrameError> {
        Ok(DecodedFrame {
            sequence_id,
            image: image::RgbaImage::new(2, 2),
        })
    }

    #[test_timeout::paused_tokio_test(10)]
    async fn decodes_from_an_earlier_attempt_are_not_presented() {
        let (mut orch, parts, _connector) = remote();
        let surface = BlitCounter::default();
        let blits = surface.0.clone();
        parts.handle.attach_surface(Box::new(surface));
        orch.step().await;

        parts.handle.submit("localhost:7987");
        orch.step().await;
        assert_eq!(orch.portal.state(), PortalState::Warm);
        let current = orch.attempt;

        orch.handle(SessionEvent::FrameDecoded {
            attempt: current - 1,
            result: decoded(1),
        })
        .await;
        assert_eq!(blits.load(std::sync::atomic::Ordering::SeqCst), 0);

        orch.handle(SessionEvent::FrameDecoded {
            attempt: current,
            result: decoded(2),
        })
        .await;
        assert_eq!(blits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test_timeout::paused_tokio_test(10)]
    async fn shutdown_from_idle_stops_without_teardown() {
        let (orch, mut parts, _connector) = remote();
        parts.handle.shutdown();
        orch.run().await;
        assert!(parts.host_requests.try_recv().is_err());
        assert!(!parts.handle.submit("localhost:1"));
    }
}
