#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use biome_client_core::engine::{EngineError, EngineGateway, EngineStatus, STANDALONE_PORT};
use biome_client_core::frame::{DecodedFrame, PresentationSurface};
use biome_client_core::session::SessionContext;
use image::{DynamicImage, ImageOutputFormat, Rgba, RgbaImage};
use serde_json::{Value, json};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone)]
struct FakeState {
    dependencies_ready: bool,
    running: bool,
    port_in_use: bool,
    ready_on_start: bool,
    start_error: Option<EngineError>,
    start_ports: Vec<u16>,
    stops: usize,
}

/// In-memory engine gateway.
pub struct FakeEngine {
    state: Mutex<FakeState>,
    ready: broadcast::Sender<()>,
}

impl FakeEngine {
    /// Dependencies installed, nothing running; starting reports ready.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                dependencies_ready: true,
                running: false,
                port_in_use: false,
                ready_on_start: true,
                start_error: None,
                start_ports: Vec::new(),
                stops: 0,
            }),
            ready: broadcast::channel(4).0,
        })
    }

    pub fn without_dependencies() -> Arc<Self> {
        let engine = Self::new();
        engine.update(|state| state.dependencies_ready = false);
        engine
    }

    pub fn already_running() -> Arc<Self> {
        let engine = Self::new();
        engine.update(|state| state.running = true);
        engine
    }

    pub fn never_ready() -> Arc<Self> {
        let engine = Self::new();
        engine.update(|state| state.ready_on_start = false);
        engine
    }

    pub fn failing(error: EngineError) -> Arc<Self> {
        let engine = Self::new();
        engine.update(|state| state.start_error = Some(error));
        engine
    }

    pub fn start_ports(&self) -> Vec<u16> {
        self.snapshot().start_ports
    }

    pub fn stops(&self) -> usize {
        self.snapshot().stops
    }

    pub fn is_running(&self) -> bool {
        self.snapshot().running
    }

    fn update(&self, f: impl FnOnce(&mut FakeState)) {
        let mut state = self.state.lock().unwrap();
        f(&mut state);
    }

    fn snapshot(&self) -> FakeState {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineGateway for FakeEngine {
    async fn status(&self) -> EngineStatus {
        let state = self.snapshot();
        EngineStatus {
            dependencies_ready: state.dependencies_ready,
            server_running: state.running,
            port: STANDALONE_PORT,
        }
    }

    async fn start(&self, port: u16) -> Result<(), EngineError> {
        let ready_on_start = {
            let mut state = self.state.lock().unwrap();
            state.start_ports.push(port);
            if let Some(err) = state.start_error.clone() {
                return Err(err);
            }
            state.running = true;
            state.ready_on_start
        };
        if ready_on_start {
            let _ = self.ready.send(());
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.stops += 1;
        if !state.running {
            return Err(EngineError::NotRunning);
        }
        state.running = false;
        Ok(())
    }

    fn subscribe_ready(&self) -> broadcast::Receiver<()> {
        self.ready.subscribe()
    }

    async fn is_port_in_use(&self, _port: u16) -> bool {
        self.snapshot().port_in_use
    }
}

/// Surface that counts what it is asked to draw.
#[derive(Clone, Default)]
pub struct CountingSurface {
    pub blits: Arc<AtomicUsize>,
    pub resizes: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl CountingSurface {
    pub fn blits(&self) -> usize {
        self.blits.load(Ordering::SeqCst)
    }
}

impl PresentationSurface for CountingSurface {
    fn resize(&mut self, width: u32, height: u32) {
        self.resizes.lock().unwrap().push((width, height));
    }

    fn blit(&mut self, _frame: &DecodedFrame) {
        self.blits.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn png_base64(width: u32, height: u32) -> String {
    let image = RgbaImage::from_pixel(width, height, Rgba([30, 120, 60, 255]));
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image)
        .write_to(&mut bytes, ImageOutputFormat::Png)
        .unwrap();
    BASE64.encode(bytes.into_inner())
}

pub fn frame_message(frame_id: u64) -> Value {
    json!({
        "type": "frame",
        "data": png_base64(8, 4),
        "frame_id": frame_id,
        "gen_ms": 41.5,
    })
}

pub fn status_message(code: &str) -> Value {
    json!({"type": "status", "code": code})
}

/// Waits until the published context satisfies `predicate`.
pub async fn wait_for(
    context: &mut watch::Receiver<SessionContext>,
    predicate: impl FnMut(&SessionContext) -> bool,
) -> SessionContext {
    context
        .wait_for(predicate)
        .await
        .expect("orchestrator stopped")
        .clone()
}

/// Message types, in order.
pub fn kinds(messages: &[Value]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|message| message["type"].as_str().map(str::to_string))
        .collect()
}
