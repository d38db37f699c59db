mod support;

use biome_client_core::engine::EngineError;
use biome_client_core::input::Key;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use biome_client_core::portal::PortalState;
use biome_client_core::seeds::SeedLibrary;
use biome_client_core::session::{
    Command, HostRequest, InputEvent, Orchestrator, OrchestratorConfig, Phase, SessionContext,
    SessionError, SessionHandle,
};
use biome_client_core::transport::{MockConnector, MockPeer};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{
    CountingSurface, FakeEngine, frame_message, kinds, png_base64, status_message, wait_for,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

struct Harness {
    handle: SessionHandle,
    context: watch::Receiver<SessionContext>,
    host_requests: mpsc::UnboundedReceiver<HostRequest>,
    portal: mpsc::UnboundedReceiver<(PortalState, PortalState)>,
    peers: mpsc::UnboundedReceiver<MockPeer>,
    connector: Arc<MockConnector>,
    engine: Arc<FakeEngine>,
    surface: CountingSurface,
    task: JoinHandle<()>,
}

fn launch(standalone: bool, engine: Arc<FakeEngine>) -> Harness {
    let (connector, peers) = MockConnector::new();
    let config = OrchestratorConfig {
        standalone,
        ..OrchestratorConfig::default()
    };
    let (mut orchestrator, parts) = Orchestrator::new(config, connector.clone(), engine.clone());
    let portal = orchestrator.subscribe_portal();
    let task = tokio::spawn(orchestrator.run());
    Harness {
        handle: parts.handle,
        context: parts.context,
        host_requests: parts.host_requests,
        portal,
        peers,
        connector,
        engine,
        surface: CountingSurface::default(),
        task,
    }
}

fn drain_portal(harness: &mut Harness) -> Vec<(PortalState, PortalState)> {
    let mut seen = Vec::new();
    while let Ok(change) = harness.portal.try_recv() {
        seen.push(change);
    }
    seen
}

fn drain_host(harness: &mut Harness) -> Vec<HostRequest> {
    let mut seen = Vec::new();
    while let Ok(request) = harness.host_requests.try_recv() {
        seen.push(request);
    }
    seen
}

async fn reach_streaming(harness: &mut Harness) -> MockPeer {
    harness
        .handle
        .attach_surface(Box::new(harness.surface.clone()));
    harness.handle.submit("localhost:7987");
    let peer = harness.peers.recv().await.unwrap();
    wait_for(&mut harness.context, |ctx| {
        ctx.phase == Phase::AwaitingFirstFrame
    })
    .await;

    peer.send_json(&status_message("warmup"));
    peer.send_json(&frame_message(1));
    let ctx = wait_for(&mut harness.context, |ctx| ctx.portal == PortalState::Hot).await;
    assert_eq!(ctx.phase, Phase::AwaitingReadySignal);
    assert_eq!(ctx.server_status.as_deref(), Some("Warming up engine..."));
    assert!(!ctx.input_enabled);

    peer.send_json(&status_message("ready"));
    let ctx = wait_for(&mut harness.context, |ctx| ctx.phase == Phase::Streaming).await;
    assert_eq!(ctx.portal, PortalState::Streaming);
    assert!(ctx.input_enabled);
    assert_eq!(
        harness.host_requests.recv().await,
        Some(HostRequest::CapturePointer)
    );
    harness
        .handle
        .input(InputEvent::PointerCaptureChanged(true));
    peer
}

#[test_timeout::paused_tokio_test(30)]
async fn remote_submit_warms_portal_and_opens_socket() {
    let mut harness = launch(false, FakeEngine::new());
    harness.handle.submit("localhost:7987");

    let peer = harness.peers.recv().await.unwrap();
    assert_eq!(peer.url, "ws://localhost:7987/ws");
    let ctx = wait_for(&mut harness.context, |ctx| {
        ctx.phase == Phase::AwaitingFirstFrame
    })
    .await;
    assert_eq!(ctx.portal, PortalState::Warm);
    assert_eq!(ctx.endpoint.as_deref(), Some("localhost:7987"));
    assert_eq!(
        drain_portal(&mut harness),
        vec![(PortalState::Warm, PortalState::Cold)]
    );
    assert!(harness.engine.start_ports().is_empty());
}

#[test_timeout::paused_tokio_test(30)]
async fn no_frame_within_a_minute_returns_to_cold() {
    let mut harness = launch(false, FakeEngine::new());
    let started = Instant::now();
    harness.handle.submit("localhost:7987");
    let _peer = harness.peers.recv().await.unwrap();

    let ctx = wait_for(&mut harness.context, |ctx| {
        ctx.phase == Phase::Idle && ctx.last_error.is_some()
    })
    .await;
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(ctx.portal, PortalState::Cold);
    let error = ctx.last_error.unwrap();
    assert!(matches!(
        error,
        SessionError::FirstFrameTimeout { secs: 60, .. }
    ));
    assert!(error.display_text().contains("ws://localhost:7987/ws"));
    assert_eq!(
        drain_portal(&mut harness),
        vec![
            (PortalState::Warm, PortalState::Cold),
            (PortalState::Cold, PortalState::Warm)
        ]
    );
    assert!(drain_host(&mut harness).contains(&HostRequest::ReleasePointer));
}

#[test_timeout::paused_tokio_test(30)]
async fn missing_engine_dependencies_fail_without_connecting() {
    let mut harness = launch(true, FakeEngine::without_dependencies());
    harness.handle.submit("localhost:7987");

    let ctx = wait_for(&mut harness.context, |ctx| {
        ctx.phase == Phase::Idle && ctx.last_error.is_some()
    })
    .await;
    assert_eq!(ctx.portal, PortalState::Cold);
    assert_eq!(
        ctx.last_error,
        Some(SessionError::Engine(EngineError::DependenciesMissing))
    );
    assert!(ctx.headline().contains("run setup"));
    assert_eq!(harness.connector.connect_attempts(), 0);
    assert!(harness.engine.start_ports().is_empty());
    assert_eq!(harness.engine.stops(), 0);
}

#[test_timeout::paused_tokio_test(30)]
async fn standalone_start_waits_for_ready_and_grace_period() {
    let mut harness = launch(true, FakeEngine::new());
    let started = Instant::now();
    harness.handle.submit("localhost:7987");

    let ctx = wait_for(&mut harness.context, |ctx| {
        ctx.phase == Phase::StartingEngine
    })
    .await;
    assert_eq!(ctx.portal, PortalState::Warm);

    let peer = harness.peers.recv().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(peer.url, "ws://localhost:7987/ws");
    assert_eq!(harness.engine.start_ports(), vec![7987]);
    assert_eq!(harness.connector.connect_attempts(), 1);
}

#[test_timeout::paused_tokio_test(30)]
async fn running_engine_is_reused() {
    let mut harness = launch(true, FakeEngine::already_running());
    harness.handle.submit("localhost:7987");
    let peer = harness.peers.recv().await.unwrap();
    assert_eq!(peer.url, "ws://localhost:7987/ws");
    assert!(harness.engine.start_ports().is_empty());

    harness.handle.logout();
    wait_for(&mut harness.context, |ctx| {
        ctx.phase == Phase::Idle && ctx.portal == PortalState::Cold && ctx.endpoint.is_some()
    })
    .await;
    assert_eq!(harness.engine.stops(), 0, "engine we did not start keeps running");
    assert!(harness.engine.is_running());
}

#[test_timeout::paused_tokio_test(30)]
async fn engine_start_failure_is_reported() {
    let mut harness = launch(
        true,
        FakeEngine::failing(EngineError::ExitedEarly {
            status: "exit code 1".into(),
            log_tail: "ImportError: torch".into(),
        }),
    );
    harness.handle.submit("localhost:7987");
    let ctx = wait_for(&mut harness.context, |ctx| {
        ctx.phase == Phase::Idle && ctx.last_error.is_some()
    })
    .await;
    let text = ctx.last_error.unwrap().display_text();
    assert!(text.contains("exit code 1"));
    assert!(text.contains("ImportError: torch"));
    assert!(!text.contains('\n'));
    assert_eq!(harness.connector.connect_attempts(), 0);
}

#[test_timeout::paused_tokio_test(30)]
async fn engine_that_never_reports_ready_times_out() {
    let mut harness = launch(true, FakeEngine::never_ready());
    let started = Instant::now();
    harness.handle.submit("localhost:7987");
    let ctx = wait_for(&mut harness.context, |ctx| {
        ctx.phase == Phase::Idle && ctx.last_error.is_some()
    })
    .await;
    assert!(started.elapsed() >= Duration::from_secs(120));
    assert_eq!(
        ctx.last_error,
        Some(SessionError::Engine(EngineError::ReadyTimeout(120)))
    );
    assert_eq!(harness.engine.stops(), 1);
    assert_eq!(harness.connector.connect_attempts(), 0);
}

#[test_timeout::paused_tokio_test(30)]
async fn logout_during_engine_start_cancels_everything() {
    let mut harness = launch(true, FakeEngine::never_ready());
    harness.handle.submit("localhost:7987");
    wait_for(&mut harness.context, |ctx| {
        ctx.phase == Phase::StartingEngine
    })
    .await;
    sleep(Duration::from_millis(10)).await;

    harness.handle.logout();
    let ctx = wait_for(&mut harness.context, |ctx| ctx.phase == Phase::Idle).await;
    assert_eq!(ctx.portal, PortalState::Cold);
    assert_eq!(ctx.last_error, None);
    assert_eq!(harness.engine.stops(), 1);

    sleep(Duration::from_secs(300)).await;
    assert_eq!(harness.connector.connect_attempts(), 0);
    let ctx = harness.context.borrow().clone();
    assert_eq!(ctx.last_error, None, "stale timers are ignored");
    assert_eq!(ctx.portal, PortalState::Cold);
}

#[test_timeout::paused_tokio_test(30)]
async fn streaming_drop_keeps_portal_until_dismissed() {
    let mut harness = launch(true, FakeEngine::new());
    let mut peer = reach_streaming(&mut harness).await;

    peer.close();
    let ctx = wait_for(&mut harness.context, |ctx| ctx.connection_lost).await;
    assert_eq!(ctx.phase, Phase::ConnectionLost);
    assert_eq!(ctx.portal, PortalState::Streaming);
    assert!(!ctx.input_enabled);
    assert!(matches!(
        ctx.last_error,
        Some(SessionError::ConnectionLost(_))
    ));
    assert_eq!(harness.engine.stops(), 0);

    sleep(Duration::from_secs(120)).await;
    assert!(harness.context.borrow().connection_lost, "waits for the user");

    harness.handle.dismiss_connection_lost();
    let ctx = wait_for(&mut harness.context, |ctx| ctx.phase == Phase::Idle).await;
    assert_eq!(ctx.portal, PortalState::Cold);
    assert!(!ctx.connection_lost);
    assert_eq!(ctx.last_error, None);
    assert_eq!(harness.engine.stops(), 1);
    assert!(!harness.engine.is_running());
    assert!(drain_host(&mut harness).contains(&HostRequest::ReleasePointer));
    assert!(harness.surface.blits() >= 1);
    assert_eq!(
        drain_portal(&mut harness),
        vec![
            (PortalState::Warm, PortalState::Cold),
            (PortalState::Hot, PortalState::Warm),
            (PortalState::Streaming, PortalState::Hot),
            (PortalState::Cold, PortalState::Streaming),
        ]
    );
}

#[test_timeout::paused_tokio_test(30)]
async fn pointer_capture_loss_pauses_once_and_halts_dispatch() {
    let mut harness = launch(false, FakeEngine::new());
    let mut peer = reach_streaming(&mut harness).await;

    sleep(Duration::from_millis(100)).await;
    let sent = kinds(&peer.drain());
    assert!(
        sent.iter().filter(|kind| *kind == "control").count() >= 4,
        "control ticks while streaming: {sent:?}"
    );

    harness
        .handle
        .input(InputEvent::PointerCaptureChanged(false));
    harness.handle.input(InputEvent::FocusLost);
    harness
        .handle
        .input(InputEvent::PointerCaptureChanged(false));
    let ctx = wait_for(&mut harness.context, |ctx| ctx.is_paused()).await;
    assert!(ctx.settings_open());
    assert!(!ctx.input_enabled);
    assert!(ctx.paused_at.is_some());

    sleep(Duration::from_millis(500)).await;
    let sent = kinds(&peer.drain());
    assert_eq!(sent.iter().filter(|kind| *kind == "pause").count(), 1);
    let pause_at = sent.iter().position(|kind| kind == "pause").unwrap();
    assert!(
        !sent[pause_at..].iter().any(|kind| kind == "control"),
        "no control after pause: {sent:?}"
    );

    harness.handle.send(Command::ToggleMenu);
    let ctx = wait_for(&mut harness.context, |ctx| !ctx.is_paused()).await;
    assert!(ctx.input_enabled);
    assert_eq!(
        harness.host_requests.recv().await,
        Some(HostRequest::CapturePointer)
    );
    sleep(Duration::from_millis(100)).await;
    let sent = kinds(&peer.drain());
    assert_eq!(sent.first().map(String::as_str), Some("resume"));
    assert!(sent.iter().skip(1).all(|kind| kind == "control"));
}

#[test_timeout::paused_tokio_test(30)]
async fn held_keys_and_mouse_reach_control_messages() {
    let mut harness = launch(false, FakeEngine::new());
    let mut peer = reach_streaming(&mut harness).await;
    peer.drain();

    harness.handle.input(InputEvent::KeyDown(Key::Char('w')));
    harness
        .handle
        .input(InputEvent::MouseMotion { dx: 3.0, dy: -2.0 });
    let control = loop {
        let message = peer.recv_json().await.unwrap();
        if message["type"] == "control" && message["buttons"] == json!(["W"]) {
            break message;
        }
    };
    assert_eq!(control["mouse_dx"], json!(3));
    assert_eq!(control["mouse_dy"], json!(-2));

    harness.handle.input(InputEvent::KeyDown(Key::Char('u')));
    harness.handle.input(InputEvent::KeyUp(Key::Char('w')));
    sleep(Duration::from_millis(100)).await;
    let sent = peer.drain();
    assert!(kinds(&sent).contains(&"reset".to_string()));
    assert!(
        sent.iter()
            .filter(|message| message["type"] == "control")
            .all(|message| message["buttons"] != json!(["U"])),
        "reserved key is never a button"
    );
}

#[test_timeout::paused_tokio_test(30)]
async fn server_error_before_first_frame_fails_the_attempt() {
    let mut harness = launch(false, FakeEngine::new());
    harness.handle.submit("localhost:7987");
    let peer = harness.peers.recv().await.unwrap();
    wait_for(&mut harness.context, |ctx| {
        ctx.phase == Phase::AwaitingFirstFrame
    })
    .await;

    peer.send_json(&json!({"type": "error", "message": "model failed to load"}));
    let ctx = wait_for(&mut harness.context, |ctx| {
        ctx.phase == Phase::Idle && ctx.last_error.is_some()
    })
    .await;
    assert_eq!(ctx.portal, PortalState::Cold);
    assert_eq!(
        ctx.last_error,
        Some(SessionError::ConnectionFailed("model failed to load".into()))
    );

    // A fresh attempt works after a failure.
    harness.handle.submit("localhost:7987");
    let peer = harness.peers.recv().await.unwrap();
    assert_eq!(peer.url, "ws://localhost:7987/ws");
    let ctx = wait_for(&mut harness.context, |ctx| ctx.phase != Phase::Idle).await;
    assert_eq!(ctx.last_error, None);
}

#[test_timeout::paused_tokio_test(30)]
async fn shutdown_tears_down_and_stops_the_loop() {
    let mut harness = launch(true, FakeEngine::new());
    let _peer = reach_streaming(&mut harness).await;

    harness.handle.shutdown();
    (&mut harness.task).await.unwrap();
    assert_eq!(harness.engine.stops(), 1);
    assert!(!harness.handle.submit("localhost:7987"));
    assert_eq!(harness.context.borrow().portal, PortalState::Cold);
}

#[test_timeout::paused_tokio_test(60)]
async fn frame_rate_falls_to_zero_when_frames_stop() {
    let mut harness = launch(false, FakeEngine::new());
    let peer = reach_streaming(&mut harness).await;

    for frame_id in 2..80 {
        peer.send_json(&frame_message(frame_id));
        sleep(Duration::from_millis(20)).await;
    }
    let ctx = wait_for(&mut harness.context, |ctx| ctx.fps > 0).await;
    assert!(ctx.fps <= 60, "{} fps", ctx.fps);

    let stalled = Instant::now();
    let ctx = wait_for(&mut harness.context, |ctx| ctx.fps == 0).await;
    assert!(stalled.elapsed() >= Duration::from_millis(500));
    assert_eq!(ctx.phase, Phase::Streaming);
    assert!(harness.surface.blits() > 1);
}

#[test_timeout::paused_tokio_test(30)]
async fn seed_from_the_library_reaches_the_server_as_data_url() {
    let dir = tempfile::TempDir::new().unwrap();
    let library = SeedLibrary::new(dir.path().join("seeds"));
    std::fs::create_dir_all(library.dir()).unwrap();
    let png = BASE64.decode(png_base64(4, 4)).unwrap();
    std::fs::write(library.dir().join("meadow.png"), &png).unwrap();
    assert_eq!(library.list().unwrap(), vec!["meadow.png"]);

    let mut harness = launch(false, FakeEngine::new());
    let mut peer = reach_streaming(&mut harness).await;
    peer.drain();

    let seed_url = library.data_url("meadow.png").unwrap();
    harness.handle.send(Command::SendPromptWithSeed {
        prompt: "a misty meadow".into(),
        seed_url: seed_url.clone(),
    });
    let message = loop {
        let message = peer.recv_json().await.unwrap();
        if message["type"] == "prompt_with_seed" {
            break message;
        }
    };
    assert_eq!(message["prompt"], json!("a misty meadow"));
    assert_eq!(message["seed_url"], json!(seed_url));
    let encoded = seed_url.strip_prefix("data:image/png;base64,").unwrap();
    assert_eq!(BASE64.decode(encoded).unwrap(), png);
    assert_eq!(harness.context.borrow().phase, Phase::Streaming);
}
