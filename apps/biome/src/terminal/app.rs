use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::event::{
    DisableFocusChange, DisableMouseCapture, EnableFocusChange, EnableMouseCapture, Event,
    EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers, KeyboardEnhancementFlags,
    MouseEvent, MouseEventKind, PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
};
use crossterm::style::Print;
use crossterm::terminal::{
    self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode,
    enable_raw_mode,
};
use crossterm::{execute, queue};
use futures::StreamExt;
use std::io::{self, Stdout, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::engine::{EngineCommand, EngineGateway, ProcessEngineGateway};
use crate::portal::PortalState;
use crate::seeds::{SEEDS_DIR_NAME, SeedLibrary};
use crate::session::{
    Command, FocusMode, HostRequest, InputEvent, Orchestrator, OrchestratorConfig, Phase,
    SessionContext, SessionHandle,
};
use crate::terminal::cli::Cli;
use crate::terminal::error::CliError;
use crate::terminal::keys::{HeldKeys, MouseTracker, map_key};
use crate::terminal::surface::{SurfaceView, draw_picture, terminal_surface};
use crate::transport::WebSocketConnector;

const REDRAW_PERIOD: Duration = Duration::from_millis(33);
const STATUS_ROWS: u16 = 2;
const SENSITIVITY_STEP: f64 = 0.1;
const MIN_SENSITIVITY: f64 = 0.1;

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::default_path()?,
    };
    let mut config = AppConfig::load(&config_path)?;
    cli.apply_overrides(&mut config);
    info!(
        target: "biome::terminal",
        path = %config_path.display(),
        mode = ?config.features.engine_mode,
        "settings loaded"
    );

    let seeds = config.resolved_seeds_dir().map(SeedLibrary::new);
    if let Some(library) = &seeds {
        install_bundled_seeds(library);
    }

    let engine = build_engine(&config)?;
    let (orchestrator, parts) = Orchestrator::new(
        OrchestratorConfig::from_app_config(&config),
        Arc::new(WebSocketConnector::new()),
        engine,
    );
    let handle = parts.handle.clone();
    let session = tokio::spawn(orchestrator.run());

    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| config.gpu_server.endpoint());
    let outcome = {
        let mut screen = Screen::enter()?;
        let (cols, rows) = screen.size;
        let (surface, view) = terminal_surface(cols, rows.saturating_sub(STATUS_ROWS));
        handle.attach_surface(Box::new(surface));
        if cli.endpoint.is_some() {
            handle.submit(endpoint.clone());
        }
        let mut ui = TerminalUi::new(
            handle.clone(),
            parts.host_requests,
            parts.context,
            view,
            endpoint,
            screen.enhanced_keys,
        )
        .with_seeds(seeds);
        ui.run(&mut screen).await
    };

    handle.shutdown();
    session
        .await
        .map_err(|err| CliError::Session(err.to_string()))?;
    outcome
}

fn build_engine(config: &AppConfig) -> Result<Arc<dyn EngineGateway>, CliError> {
    let standalone = config.features.engine_mode.is_standalone();
    let engine_dir = match config.resolved_engine_dir() {
        Some(dir) => dir,
        None if standalone => return Err(CliError::MissingEngineDir),
        None => PathBuf::new(),
    };
    let mut command = EngineCommand::uv(engine_dir);
    command.hf_token = config.huggingface_token();
    debug!(target: "biome::terminal", engine_dir = %command.engine_dir.display(), "engine command");
    Ok(Arc::new(
        ProcessEngineGateway::new(command).with_default_port(config.gpu_server.port),
    ))
}

/// Seeds shipped next to the executable are copied in once.
fn install_bundled_seeds(library: &SeedLibrary) {
    let bundled = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(SEEDS_DIR_NAME)));
    let Some(bundled) = bundled else {
        return;
    };
    if let Err(err) = library.initialize(&bundled) {
        warn!(target: "biome::terminal", error = %err, dir = %library.dir().display(), "seed library unavailable");
    }
}

/// Raw mode and the alternate screen for as long as it lives.
struct Screen {
    out: Stdout,
    size: (u16, u16),
    mouse_captured: bool,
    enhanced_keys: bool,
}

impl Screen {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        let mut out = io::stdout();
        execute!(out, EnterAlternateScreen, Hide, EnableFocusChange, Clear(ClearType::All))?;
        let enhanced_keys = terminal::supports_keyboard_enhancement().unwrap_or(false);
        if enhanced_keys {
            execute!(
                out,
                PushKeyboardEnhancementFlags(
                    KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES
                        | KeyboardEnhancementFlags::REPORT_EVENT_TYPES
                )
            )?;
        }
        let size = terminal::size()?;
        debug!(target: "biome::terminal", enhanced_keys, cols = size.0, rows = size.1, "terminal ready");
        Ok(Self {
            out,
            size,
            mouse_captured: false,
            enhanced_keys,
        })
    }

    fn set_mouse_capture(&mut self, captured: bool) -> io::Result<()> {
        if self.mouse_captured == captured {
            return Ok(());
        }
        if captured {
            execute!(self.out, EnableMouseCapture)?;
        } else {
            execute!(self.out, DisableMouseCapture)?;
        }
        self.mouse_captured = captured;
        Ok(())
    }
}

impl Drop for Screen {
    fn drop(&mut self) {
        if self.enhanced_keys {
            let _ = execute!(self.out, PopKeyboardEnhancementFlags);
        }
        if self.mouse_captured {
            let _ = execute!(self.out, DisableMouseCapture);
        }
        let _ = execute!(self.out, DisableFocusChange, Show, LeaveAlternateScreen);
        let _ = disable_raw_mode();
    }
}

struct TerminalUi {
    handle: SessionHandle,
    host_requests: mpsc::UnboundedReceiver<HostRequest>,
    context: watch::Receiver<SessionContext>,
    view: SurfaceView,
    held: HeldKeys,
    mouse: MouseTracker,
    endpoint: String,
    prompt: Option<PromptDraft>,
    seeds: Option<SeedLibrary>,
    seed_names: Vec<String>,
    notice: Option<String>,
    pointer_captured: bool,
    last_phase: Phase,
    dirty: bool,
    quit: bool,
}

impl TerminalUi {
    fn new(
        handle: SessionHandle,
        host_requests: mpsc::UnboundedReceiver<HostRequest>,
        context: watch::Receiver<SessionContext>,
        view: SurfaceView,
        endpoint: String,
        release_events: bool,
    ) -> Self {
        Self {
            handle,
            host_requests,
            context,
            view,
            held: HeldKeys::new(release_events),
            mouse: MouseTracker::default(),
            endpoint,
            prompt: None,
            seeds: None,
            seed_names: Vec::new(),
            notice: None,
            pointer_captured: false,
            last_phase: Phase::Idle,
            dirty: true,
            quit: false,
        }
    }

    fn with_seeds(mut self, seeds: Option<SeedLibrary>) -> Self {
        self.seeds = seeds;
        self
    }

    async fn run(&mut self, screen: &mut Screen) -> Result<(), CliError> {
        let mut events = EventStream::new();
        let mut redraw = tokio::time::interval(REDRAW_PERIOD);
        redraw.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !self.quit {
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(event)) => self.on_terminal_event(event, screen)?,
                    Some(Err(err)) => return Err(err.into()),
                    None => break,
                },
                Some(request) = self.host_requests.recv() => self.on_host_request(request, screen)?,
                changed = self.context.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.dirty = true;
                }
                _ = redraw.tick() => {
                    for event in self.held.expire(Instant::now()) {
                        self.handle.input(event);
                    }
                    self.draw(screen)?;
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> SessionContext {
        self.context.borrow().clone()
    }

    fn on_terminal_event(&mut self, event: Event, screen: &mut Screen) -> Result<(), CliError> {
        match event {
            Event::Key(key) => self.on_key(key),
            Event::Mouse(mouse) => self.on_mouse(mouse),
            Event::FocusLost => {
                self.pointer_captured = false;
                self.mouse.reset();
                self.release_keys();
                self.handle.input(InputEvent::FocusLost);
            }
            Event::FocusGained => {
                self.handle.input(InputEvent::FocusGained);
            }
            Event::Resize(cols, rows) => {
                screen.size = (cols, rows);
                self.view.set_viewport(cols, rows.saturating_sub(STATUS_ROWS));
                execute!(screen.out, Clear(ClearType::All))?;
                self.dirty = true;
            }
            Event::Paste(text) => {
                if self.snapshot().phase == Phase::Idle {
                    self.endpoint.push_str(text.trim());
                    self.dirty = true;
                }
            }
        }
        Ok(())
    }

    fn on_key(&mut self, key: KeyEvent) {
        let pressed = key.kind != KeyEventKind::Release;
        if pressed
            && key.modifiers.contains(KeyModifiers::CONTROL)
            && key.code == KeyCode::Char('c')
        {
            info!(target: "biome::terminal", "quit requested");
            self.quit = true;
            return;
        }

        let ctx = self.snapshot();
        if ctx.connection_lost {
            if pressed && key.code == KeyCode::Enter {
                self.handle.dismiss_connection_lost();
            }
            return;
        }

        match ctx.phase {
            Phase::Idle if pressed => self.edit_endpoint(key.code),
            Phase::Streaming => self.on_streaming_key(key, &ctx),
            Phase::StartingEngine
            | Phase::ConnectingSocket
            | Phase::AwaitingFirstFrame
            | Phase::AwaitingReadySignal
                if pressed && key.code == KeyCode::Esc =>
            {
                self.handle.logout();
            }
            _ => {}
        }
    }

    fn edit_endpoint(&mut self, code: KeyCode) {
        match code {
            KeyCode::Char(c) => self.endpoint.push(c),
            KeyCode::Backspace => {
                self.endpoint.pop();
            }
            KeyCode::Enter => {
                self.handle.submit(self.endpoint.clone());
            }
            KeyCode::Esc => self.quit = true,
            _ => return,
        }
        self.dirty = true;
    }

    fn on_streaming_key(&mut self, key: KeyEvent, ctx: &SessionContext) {
        let pressed = key.kind != KeyEventKind::Release;
        if let Some(draft) = self.prompt.as_mut() {
            if !pressed {
                return;
            }
            match key.code {
                KeyCode::Char(c) => draft.text.push(c),
                KeyCode::Backspace => {
                    draft.text.pop();
                }
                KeyCode::Tab => draft.cycle_seed(&self.seed_names),
                KeyCode::Enter => {
                    if let Some(draft) = self.prompt.take() {
                        self.submit_prompt(draft);
                    }
                }
                KeyCode::Esc => self.prompt = None,
                _ => {}
            }
            self.dirty = true;
            return;
        }

        match ctx.focus {
            FocusMode::Menu if pressed => match key.code {
                KeyCode::Char('q') => {
                    self.handle.logout();
                }
                KeyCode::Char('/') => self.open_prompt(false),
                KeyCode::Char('s') => self.open_prompt(true),
                KeyCode::Char('+') | KeyCode::Char('=') => {
                    self.adjust_sensitivity(ctx.mouse_sensitivity + SENSITIVITY_STEP)
                }
                KeyCode::Char('-') => {
                    self.adjust_sensitivity(ctx.mouse_sensitivity - SENSITIVITY_STEP)
                }
                KeyCode::Esc => {
                    self.handle.send(Command::ToggleMenu);
                }
                _ => {}
            },
            FocusMode::Paused if pressed && key.code == KeyCode::Esc => {
                self.handle.send(Command::ToggleMenu);
            }
            FocusMode::Active => {
                let Some(mapped) = map_key(key.code) else {
                    return;
                };
                for event in self.held.on_key(mapped, key.kind, Instant::now()) {
                    self.handle.input(event);
                }
            }
            _ => {}
        }
    }

    /// Opens the prompt line. With `with_seed`, the first seed starts selected.
    fn open_prompt(&mut self, with_seed: bool) {
        self.notice = None;
        self.seed_names = match self.seeds.as_ref().map(SeedLibrary::list) {
            Some(Ok(names)) => names,
            Some(Err(err)) => {
                warn!(target: "biome::terminal", error = %err, "cannot list seeds");
                Vec::new()
            }
            None => Vec::new(),
        };
        let mut draft = PromptDraft::default();
        if with_seed {
            if self.seed_names.is_empty() {
                self.notice = Some("No seed images found.".into());
                self.dirty = true;
                return;
            }
            draft.cycle_seed(&self.seed_names);
        }
        self.prompt = Some(draft);
        self.dirty = true;
    }

    fn submit_prompt(&mut self, draft: PromptDraft) {
        let prompt = draft.text.trim().to_string();
        if prompt.is_empty() {
            return;
        }
        let command = match (draft.seed, &self.seeds) {
            (Some(name), Some(library)) => match library.data_url(&name) {
                Ok(seed_url) => {
                    info!(target: "biome::terminal", seed = %name, "prompt with seed");
                    Command::SendPromptWithSeed { prompt, seed_url }
                }
                Err(err) => {
                    warn!(target: "biome::terminal", seed = %name, error = %err, "seed unreadable");
                    self.notice = Some(err.to_string());
                    return;
                }
            },
            _ => Command::SendPrompt(prompt),
        };
        self.handle.send(command);
    }

    fn adjust_sensitivity(&mut self, value: f64) {
        let value = (value.max(MIN_SENSITIVITY) * 10.0).round() / 10.0;
        self.handle.send(Command::SetMouseSensitivity(value));
    }

    fn on_mouse(&mut self, mouse: MouseEvent) {
        let ctx = self.snapshot();
        if ctx.phase != Phase::Streaming || ctx.connection_lost {
            return;
        }
        if !self.pointer_captured {
            if matches!(mouse.kind, MouseEventKind::Down(_)) && ctx.focus == FocusMode::Paused {
                self.pointer_captured = true;
                self.mouse.reset();
                self.handle.input(InputEvent::PointerCaptureChanged(true));
            }
            return;
        }
        for event in self.mouse.on_mouse(mouse) {
            self.handle.input(event);
        }
    }

    fn on_host_request(&mut self, request: HostRequest, screen: &mut Screen) -> Result<(), CliError> {
        debug!(target: "biome::terminal", ?request, "host request");
        match request {
            HostRequest::CapturePointer => {
                screen.set_mouse_capture(true)?;
                self.pointer_captured = true;
                self.mouse.reset();
                self.handle.input(InputEvent::PointerCaptureChanged(true));
            }
            HostRequest::ReleasePointer => {
                if let Err(err) = screen.set_mouse_capture(false) {
                    warn!(target: "biome::terminal", error = %err, "failed to release mouse");
                }
                self.pointer_captured = false;
                self.release_keys();
                self.handle.input(InputEvent::PointerCaptureChanged(false));
            }
        }
        Ok(())
    }

    fn release_keys(&mut self) {
        for event in self.held.release_all() {
            self.handle.input(event);
        }
    }

    fn draw(&mut self, screen: &mut Screen) -> io::Result<()> {
        let ctx = self.snapshot();
        if ctx.phase != self.last_phase {
            if ctx.phase == Phase::Idle {
                self.view.clear();
                self.prompt = None;
                self.notice = None;
                queue!(screen.out, Clear(ClearType::All))?;
            }
            self.last_phase = ctx.phase;
            self.dirty = true;
        }

        let mut drew_picture = false;
        if ctx.portal != PortalState::Cold {
            if let Some(picture) = self.view.take_picture() {
                draw_picture(&mut screen.out, &picture)?;
                drew_picture = true;
            }
        }
        if !(self.dirty || drew_picture) {
            return Ok(());
        }

        let (cols, rows) = screen.size;
        let lines = status_lines(
            &ctx,
            &self.endpoint,
            self.prompt.as_ref(),
            self.notice.as_deref(),
        );
        let first_row = rows.saturating_sub(STATUS_ROWS);
        for (offset, line) in lines.iter().enumerate() {
            let row = first_row + offset as u16;
            let text: String = line.chars().take(usize::from(cols)).collect();
            queue!(
                screen.out,
                MoveTo(0, row),
                Clear(ClearType::CurrentLine),
                Print(text)
            )?;
        }
        screen.out.flush()?;
        self.dirty = false;
        Ok(())
    }
}

/// Prompt being typed in the menu, optionally restarting from a seed image.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct PromptDraft {
    text: String,
    seed: Option<String>,
}

impl PromptDraft {
    /// Steps to the next seed, and back to none after the last.
    fn cycle_seed(&mut self, seeds: &[String]) {
        self.seed = match &self.seed {
            None => seeds.first().cloned(),
            Some(current) => seeds
                .iter()
                .skip_while(|name| *name != current)
                .nth(1)
                .cloned(),
        };
    }
}

/// Headline plus one line of controls or details for the current phase.
fn status_lines(
    ctx: &SessionContext,
    endpoint: &str,
    prompt: Option<&PromptDraft>,
    notice: Option<&str>,
) -> [String; 2] {
    let headline = ctx.headline();
    let detail = if ctx.connection_lost {
        "Enter: back to start | Ctrl+C: quit".to_string()
    } else {
        match ctx.phase {
            Phase::Idle => {
                let mode = if ctx.standalone { "local engine" } else { "server" };
                format!("Endpoint ({mode}): {endpoint}_")
            }
            Phase::Streaming => match (prompt, ctx.focus) {
                (Some(PromptDraft { text, seed: None }), _) => format!("Prompt: {text}_"),
                (Some(PromptDraft { text, seed: Some(seed) }), _) => {
                    format!("Prompt [{seed}, Tab: next]: {text}_")
                }
                (None, FocusMode::Menu) => {
                    let help = format!(
                        "q: logout | /: prompt | s: seed | +/-: sensitivity ({:.1}) | Esc: resume",
                        ctx.mouse_sensitivity
                    );
                    match notice {
                        Some(notice) => format!("{notice} | {help}"),
                        None => help,
                    }
                }
                (None, _) => format!(
                    "{} | {} fps | sensitivity {:.1} | Esc: menu",
                    ctx.portal, ctx.fps, ctx.mouse_sensitivity
                ),
            },
            Phase::ShuttingDown => String::new(),
            _ => format!(
                "{} | {} | Esc: cancel",
                ctx.portal,
                ctx.endpoint.as_deref().unwrap_or(endpoint)
            ),
        }
    };
    [headline, detail]
}
