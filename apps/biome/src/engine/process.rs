use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EngineError, EngineGateway, EngineStatus, STANDALONE_PORT};

/// Lines that mean the engine accepts connections.
const READY_MARKERS: &[&str] = &["SERVER READY", "Uvicorn running on"];
const LOG_FILE_NAME: &str = "server.log";
const LOG_TAIL_LINES: usize = 30;
const EARLY_EXIT_WINDOW: Duration = Duration::from_millis(500);
const PORT_PLACEHOLDER: &str = "{port}";
const TOKEN_VARS: &[&str] = &["HF_TOKEN", "HUGGING_FACE_HUB_TOKEN"];
/// How long the engine gets to exit after SIGTERM before the group is killed.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// How to launch the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub engine_dir: PathBuf,
    pub program: String,
    /// Arguments; `{port}` is replaced with the requested port.
    pub args: Vec<String>,
    /// Paths under `engine_dir` that must exist before the engine can start.
    pub required: Vec<PathBuf>,
    /// Passed to the child as both `HF_TOKEN` and `HUGGING_FACE_HUB_TOKEN`.
    pub hf_token: Option<String>,
}

impl EngineCommand {
    /// `uv run python -u server.py --port {port}` inside `engine_dir`.
    pub fn uv(engine_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine_dir: engine_dir.into(),
            program: "uv".to_string(),
            args: ["run", "python", "-u", "server.py", "--port", PORT_PLACEHOLDER]
                .into_iter()
                .map(String::from)
                .collect(),
            required: vec![PathBuf::from(".venv"), PathBuf::from("server.py")],
            hf_token: None,
        }
    }

    fn args_for(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }

    fn dependencies_ready(&self) -> bool {
        self.engine_dir.is_dir()
            && self
                .required
                .iter()
                .all(|path| self.engine_dir.join(path).exists())
    }

    /// Token from the command itself, falling back to the environment.
    fn resolved_token(&self) -> Option<String> {
        self.hf_token
            .clone()
            .filter(|token| !token.is_empty())
            .or_else(|| {
                TOKEN_VARS
                    .iter()
                    .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
            })
    }

    pub fn log_path(&self) -> PathBuf {
        self.engine_dir.join(LOG_FILE_NAME)
    }
}

struct RunningServer {
    child: Child,
    port: u16,
    pumps: Vec<JoinHandle<()>>,
    /// The launcher leads its own process group; the interpreter it runs
    /// and anything that spawns are members.
    group: ProcessGroup,
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.group.kill();
    }
}

/// Process group created for one engine launch.
#[derive(Debug, Clone, Copy)]
struct ProcessGroup(Option<u32>);

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self(child.id())
    }

    #[cfg(unix)]
    fn signal(self, signal: nix::sys::signal::Signal) {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(id) = self.0.and_then(|id| i32::try_from(id).ok()) else {
            return;
        };
        match killpg(Pid::from_raw(id), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(target: "biome::engine", group = id, %signal, error = %err, "failed to signal engine group"),
        }
    }

    fn terminate(self) {
        #[cfg(unix)]
        self.signal(nix::sys::signal::Signal::SIGTERM);
    }

    fn kill(self) {
        #[cfg(unix)]
        self.signal(nix::sys::signal::Signal::SIGKILL);
    }
}

type LogTail = Arc<StdMutex<VecDeque<String>>>;

/// Runs the engine as a child process, teeing its output into `server.log`
/// and the tracing log.
pub struct ProcessEngineGateway {
    command: EngineCommand,
    default_port: u16,
    ready_tx: broadcast::Sender<()>,
    running: Mutex<Option<RunningServer>>,
    early_exit_window: Duration,
}

impl ProcessEngineGateway {
    pub fn new(command: EngineCommand) -> Self {
        let (ready_tx, _) = broadcast::channel(4);
        Self {
            command,
            default_port: STANDALONE_PORT,
            ready_tx,
            running: Mutex::new(None),
            early_exit_window: EARLY_EXIT_WINDOW,
        }
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn with_early_exit_window(mut self, window: Duration) -> Self {
        self.early_exit_window = window;
        self
    }

    pub fn command(&self) -> &EngineCommand {
        &self.command
    }

    fn spawn_pump<R>(&self, reader: R, stream: &'static str, log: Arc<Mutex<Option<File>>>, tail: LogTail) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let ready_tx = self.ready_tx.clone();
        tokio::spawn(forward_engine_lines(BufReader::new(reader), stream, log, tail, ready_tx))
    }
}

#[async_trait]
impl EngineGateway for ProcessEngineGateway {
    async fn status(&self) -> EngineStatus {
        let mut running = self.running.lock().await;
        let poll = running
            .as_mut()
            .map(|server| (server.port, server.child.try_wait()));
        let (server_running, port) = match poll {
            Some((port, Ok(None))) => (true, port),
            Some((_, Ok(Some(status)))) => {
                info!(target: "biome::engine", status = %describe_exit_status(status), "engine exited");
                running.take();
                (false, self.default_port)
            }
            Some((_, Err(err))) => {
                warn!(target: "biome::engine", error = %err, "could not poll engine process");
                running.take();
                (false, self.default_port)
            }
            None => (false, self.default_port),
        };
        EngineStatus {
            dependencies_ready: self.command.dependencies_ready(),
            server_running,
            port,
        }
    }

    async fn start(&self, port: u16) -> Result<(), EngineError> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref() {
            return Err(EngineError::AlreadyRunning(server.port));
        }
        if !self.command.dependencies_ready() {
            return Err(EngineError::DependenciesMissing);
        }

        let args = self.command.args_for(port);
        info!(
            target: "biome::engine",
            port,
            dir = %self.command.engine_dir.display(),
            program = %self.command.program,
            "starting engine"
        );
        let mut cmd = Command::new(&self.command.program);
        cmd.current_dir(&self.command.engine_dir)
            .args(&args)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        match self.command.resolved_token() {
            Some(token) => {
                for var in TOKEN_VARS {
                    cmd.env(var, &token);
                }
            }
            None => warn!(target: "biome::engine", "no HuggingFace token configured"),
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| EngineError::Spawn(err.to_string()))?;
        let group = ProcessGroup::of(&child);
        debug!(target: "biome::engine", pid = ?child.id(), "engine spawned");

        let log = open_log(&self.command.log_path()).await;
        let log = Arc::new(Mutex::new(log));
        let tail: LogTail = Arc::new(StdMutex::new(VecDeque::with_capacity(LOG_TAIL_LINES)));
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(self.spawn_pump(stdout, "stdout", log.clone(), tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(self.spawn_pump(stderr, "stderr", log, tail.clone()));
        }

        tokio::time::sleep(self.early_exit_window).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                group.kill();
                // The pipes close with the process; let the pumps drain.
                for pump in pumps {
                    let _ = tokio::time::timeout(Duration::from_millis(200), pump).await;
                }
                let log_tail = tail
                    .lock()
                    .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
                    .unwrap_or_default();
                let status = describe_exit_status(status);
                warn!(target: "biome::engine", %status, "engine exited during startup");
                Err(EngineError::ExitedEarly { status, log_tail })
            }
            Ok(None) => {
                *running = Some(RunningServer { child, port, pumps, group });
                Ok(())
            }
            Err(err) => {
                warn!(target: "biome::engine", error = %err, "could not poll engine process");
                *running = Some(RunningServer { child, port, pumps, group });
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<(), EngineError> {
        let Some(mut server) = self.running.lock().await.take() else {
            return Err(EngineError::NotRunning);
        };
        info!(target: "biome::engine", port = server.port, pid = ?server.child.id(), "stopping engine");
        server.group.terminate();
        #[cfg(not(unix))]
        if let Err(err) = server.child.start_kill() {
            warn!(target: "biome::engine", error = %err, "failed to signal engine");
        }
        let exited = match tokio::time::timeout(STOP_GRACE, server.child.wait()).await {
            Ok(exited) => exited,
            Err(_) => {
                warn!(target: "biome::engine", "engine ignored SIGTERM; killing");
                server.group.kill();
                let _ = server.child.start_kill();
                server.child.wait().await
            }
        };
        match exited {
            Ok(status) => debug!(target: "biome::engine", status = %describe_exit_status(status), "engine stopped"),
            Err(err) => warn!(target: "biome::engine", error = %err, "failed to await engine"),
        }
        // Members that outlived the launcher are killed when `server` drops.
        for pump in server.pumps.drain(..) {
            pump.abort();
        }
        Ok(())
    }

    fn subscribe_ready(&self) -> broadcast::Receiver<()> {
        self.ready_tx.subscribe()
    }
}

async fn open_log(path: &Path) -> Option<File> {
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(target: "biome::engine", path = %path.display(), error = %err, "cannot open engine log");
            None
        }
    }
}

async fn forward_engine_lines<R>(
    mut reader: BufReader<R>,
    stream: &'static str,
    log: Arc<Mutex<Option<File>>>,
    tail: LogTail,
    ready_tx: broadcast::Sender<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']);
                info!(target: "biome::engine::server", stream, message = trimmed);
                if let Some(file) = log.lock().await.as_mut() {
                    let _ = file.write_all(trimmed.as_bytes()).await;
                    let _ = file.write_all(b"\n").await;
                    let _ = file.flush().await;
                }
                if let Ok(mut lines) = tail.lock() {
                    if lines.len() == LOG_TAIL_LINES {
                        lines.pop_front();
                    }
                    lines.push_back(trimmed.to_string());
                }
                if READY_MARKERS.iter().any(|marker| trimmed.contains(marker)) {
                    info!(target: "biome::engine", "engine reported ready");
                    let _ = ready_tx.send(());
                }
            }
            Err(err) => {
                warn!(target: "biome::engine", stream, error = %err, "failed to read engine output");
                break;
            }
        }
    }
}

fn describe_exit_status(status: std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }

    "unknown status".to_string()
}
