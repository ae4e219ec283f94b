//! Worker supervisor - owns the worker subprocess and its readiness state machine.
//!
//! States: ABSENT -> SPAWNING -> READY, and SPAWNING/READY -> ABSENT when the
//! worker exits or errors. Flow:
//! 1. First invocation with no worker: materialize the binary, spawn it with
//!    `execute --signal <host pid>`, queue the invocation
//! 2. Readiness notification (SIGUSR2 from the worker): SPAWNING -> READY,
//!    flush the queued invocations to the forwarder
//! 3. READY: invocations go straight to the forwarder
//! 4. Worker exit/error: count it, emit a metric, respawn immediately, or
//!    request process exit once the respawn budget is spent
//!
//! All state lives in one actor task, so transitions never interleave.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::forwarder::Forwarder;
use crate::invocation::{Invocation, InvokeError, InvokeResult};
use crate::materializer::BinaryMaterializer;
use crate::metrics::{MetricEmitter, MetricName};
use crate::state::{SupervisorSnapshot, WorkerState};
use crate::worker_log::relay_output;

/// Terminations tolerated before the host gives up. The counter is compared
/// after incrementing, so the initial worker plus this many respawns may die
/// before exit is requested.
pub const MAXIMUM_RESPAWN_COUNT: u32 = 5;

/// Bound on waiting for the last termination metric before exit.
const FINAL_METRIC_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub binary_path: PathBuf,
    /// PID the worker signals once its listener is bound.
    pub signal_pid: u32,
    /// Directory appended to the worker's `PATH`.
    pub extra_path: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError>;
}

/// Launches the Sparta binary as `<binary> execute --signal <pid>`.
pub struct BinarySpawner;

impl WorkerSpawner for BinarySpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
        let mut command = Command::new(&config.binary_path);
        command
            .arg("execute")
            .arg("--signal")
            .arg(config.signal_pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = config.extra_path {
            command.env("PATH", path_with(dir));
        }

        Ok(command.spawn()?)
    }
}

fn path_with(dir: &Path) -> OsString {
    let mut paths: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default();
    paths.push(dir.to_path_buf());
    std::env::join_paths(paths).unwrap_or_else(|_| dir.as_os_str().to_owned())
}

/// Process-level exit, used for unrecoverable supervision failures.
pub trait ProcessExit: Send + Sync {
    fn exit(&self, code: i32);
}

/// Exits the host process.
pub struct TerminateProcess;

impl ProcessExit for TerminateProcess {
    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

#[derive(Debug, Clone)]
pub enum TerminationReason {
    Exited(std::process::ExitStatus),
    Error(String),
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(status) => write!(f, "exit: {}", status),
            Self::Error(e) => write!(f, "error: {}", e),
        }
    }
}

pub struct SupervisorConfig {
    pub materializer: BinaryMaterializer,
    pub forwarder: Forwarder,
    pub metrics: MetricEmitter,
    pub spawner: Arc<dyn WorkerSpawner>,
    pub exit: Arc<dyn ProcessExit>,
    pub max_respawn_count: u32,
    pub signal_pid: u32,
    pub extra_path: Option<PathBuf>,
    pub shutdown_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(
        materializer: BinaryMaterializer,
        forwarder: Forwarder,
        metrics: MetricEmitter,
    ) -> Self {
        Self {
            materializer,
            forwarder,
            metrics,
            spawner: Arc::new(BinarySpawner),
            exit: Arc::new(TerminateProcess),
            max_respawn_count: MAXIMUM_RESPAWN_COUNT,
            signal_pid: std::process::id(),
            extra_path: None,
            shutdown_grace: Duration::from_secs(2),
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_exit(mut self, exit: Arc<dyn ProcessExit>) -> Self {
        self.exit = exit;
        self
    }

    pub fn with_max_respawn_count(mut self, n: u32) -> Self {
        self.max_respawn_count = n;
        self
    }

    pub fn with_signal_pid(mut self, pid: u32) -> Self {
        self.signal_pid = pid;
        self
    }

    pub fn with_extra_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extra_path = Some(dir.into());
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

pub(crate) enum SupervisorCommand {
    Invoke(Invocation),
    NotifyReady,
    Snapshot(oneshot::Sender<SupervisorSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

enum WorkerEvent {
    Terminated {
        generation: u64,
        reason: TerminationReason,
    },
}

/// Cloneable handle to the supervisor task.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<SupervisorCommand>,
}

impl SupervisorHandle {
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<SupervisorCommand>) -> Self {
        Self { tx }
    }

    /// Submit an invocation and wait for its completion.
    ///
    /// There is no timeout: if the worker never signals readiness, this
    /// never resolves.
    pub async fn invoke(
        &self,
        path: &str,
        event: serde_json::Value,
        context: serde_json::Value,
    ) -> InvokeResult {
        let (invocation, rx) = Invocation::new(path, event, context);
        // On send failure the invocation (and its completion) is dropped,
        // which closes `rx`.
        let _ = self.tx.send(SupervisorCommand::Invoke(invocation));
        rx.await.unwrap_or(Err(InvokeError::Unavailable))
    }

    /// Deliver a readiness notification. Returns false if the supervisor is gone.
    pub fn notify_ready(&self) -> bool {
        self.tx.send(SupervisorCommand::NotifyReady).is_ok()
    }

    pub async fn snapshot(&self) -> Option<SupervisorSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(SupervisorCommand::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    /// Terminate the worker and stop the supervisor.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(SupervisorCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Start the supervisor and forwarding tasks.
pub fn start_supervisor(config: SupervisorConfig) -> SupervisorHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (forward_tx, forward_rx) = mpsc::unbounded_channel();

    tokio::spawn(run_forward_loop(config.forwarder.clone(), forward_rx));

    let supervisor = Supervisor {
        materializer: config.materializer,
        metrics: config.metrics,
        spawner: config.spawner,
        exit: config.exit,
        max_respawn_count: config.max_respawn_count,
        signal_pid: config.signal_pid,
        extra_path: config.extra_path,
        shutdown_grace: config.shutdown_grace,
        slot: WorkerSlot::Absent,
        pending: VecDeque::new(),
        respawn_count: 0,
        generation: 0,
        live_generation: None,
        halt_reason: None,
        event_tx,
        forward_tx,
    };
    tokio::spawn(supervisor.run(command_rx, event_rx));

    SupervisorHandle { tx: command_tx }
}

/// Forwards one invocation at a time, in submission order.
async fn run_forward_loop(forwarder: Forwarder, mut rx: mpsc::UnboundedReceiver<Invocation>) {
    while let Some(invocation) = rx.recv().await {
        let Invocation {
            path,
            event,
            context,
            completion,
        } = invocation;

        let result = forwarder
            .forward(&path, event, context)
            .await
            .map_err(InvokeError::from);
        if let Err(ref e) = result {
            tracing::debug!(%path, error = %e, "Invocation completed with error");
        }
        completion.done(result);
    }
    tracing::debug!("Forward loop exiting");
}

struct LiveWorker {
    generation: u64,
    pid: Option<u32>,
    kill_tx: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

impl LiveWorker {
    async fn terminate(self) {
        let _ = self.kill_tx.send(());
        if let Err(e) = self.monitor.await {
            tracing::warn!(error = %e, "Worker monitor task failed");
        }
    }
}

enum WorkerSlot {
    Absent,
    Spawning(LiveWorker),
    Ready(LiveWorker),
    Halted,
}

impl WorkerSlot {
    fn state(&self) -> WorkerState {
        match self {
            Self::Absent => WorkerState::Absent,
            Self::Spawning(_) => WorkerState::Spawning,
            Self::Ready(_) => WorkerState::Ready,
            Self::Halted => WorkerState::Halted,
        }
    }

    fn worker(&self) -> Option<&LiveWorker> {
        match self {
            Self::Spawning(w) | Self::Ready(w) => Some(w),
            Self::Absent | Self::Halted => None,
        }
    }
}

struct Supervisor {
    materializer: BinaryMaterializer,
    metrics: MetricEmitter,
    spawner: Arc<dyn WorkerSpawner>,
    exit: Arc<dyn ProcessExit>,
    max_respawn_count: u32,
    signal_pid: u32,
    extra_path: Option<PathBuf>,
    shutdown_grace: Duration,

    slot: WorkerSlot,
    pending: VecDeque<Invocation>,
    /// Observed terminations; never reset.
    respawn_count: u32,
    generation: u64,
    /// Generation whose termination has not been handled yet.
    live_generation: Option<u64>,
    halt_reason: Option<String>,

    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    forward_tx: mpsc::UnboundedSender<Invocation>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SupervisorCommand>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SupervisorCommand::Invoke(invocation)) => {
                        self.handle_invoke(invocation).await;
                    }
                    Some(SupervisorCommand::NotifyReady) => self.handle_ready(),
                    Some(SupervisorCommand::Snapshot(tx)) => {
                        let _ = tx.send(self.snapshot());
                    }
                    Some(SupervisorCommand::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },

                Some(event) = events.recv() => match event {
                    WorkerEvent::Terminated { generation, reason } => {
                        self.handle_termination(generation, reason).await;
                    }
                },
            }
        }

        tracing::info!("Supervisor exiting");
    }

    fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            state: self.slot.state(),
            respawn_count: self.respawn_count,
            pending: self.pending.len(),
            worker_pid: self.slot.worker().and_then(|w| w.pid),
        }
    }

    async fn handle_invoke(&mut self, invocation: Invocation) {
        match self.slot {
            WorkerSlot::Ready(_) => {
                self.metrics.emit(MetricName::Reused);
                self.dispatch(invocation);
            }
            WorkerSlot::Spawning(_) => {
                tracing::debug!(
                    pending = self.pending.len() + 1,
                    "Worker not ready yet, queueing invocation"
                );
                self.pending.push_back(invocation);
            }
            WorkerSlot::Absent => {
                self.pending.push_back(invocation);
                self.ensure_worker_running().await;
            }
            WorkerSlot::Halted => {
                let reason = self.halt_reason.clone().unwrap_or_default();
                invocation.done(Err(InvokeError::Halted(reason)));
            }
        }
    }

    fn dispatch(&self, invocation: Invocation) {
        if let Err(mpsc::error::SendError(invocation)) = self.forward_tx.send(invocation) {
            tracing::error!("Forward loop gone, failing invocation");
            invocation.done(Err(InvokeError::Unavailable));
        }
    }

    /// ABSENT -> SPAWNING. No-op in any other state.
    async fn ensure_worker_running(&mut self) {
        if !matches!(self.slot, WorkerSlot::Absent) {
            return;
        }

        let binary_path = match self.materializer.ensure().await {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(error = %e, "Worker binary unavailable");
                self.halt(format!("worker binary unavailable: {}", e));
                return;
            }
        };

        let spawn_config = WorkerSpawnConfig {
            binary_path,
            signal_pid: self.signal_pid,
            extra_path: self.extra_path.clone(),
        };

        // Spawn failures count as terminations and are retried in place
        // until a spawn succeeds or the budget is spent.
        loop {
            self.generation += 1;
            let generation = self.generation;

            tracing::info!(
                binary = %spawn_config.binary_path.display(),
                generation,
                "Launching worker with args: execute --signal {}",
                self.signal_pid
            );

            match self.spawner.spawn(&spawn_config) {
                Ok(child) => {
                    self.live_generation = Some(generation);
                    let worker = self.watch(child, generation);
                    tracing::info!(pid = ?worker.pid, "Waiting for readiness signal");
                    self.slot = WorkerSlot::Spawning(worker);
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to spawn worker");
                    let reason = TerminationReason::Error(e.to_string());
                    if self
                        .record_termination(generation, WorkerState::Spawning, reason)
                        .await
                    {
                        return;
                    }
                }
            }
        }
    }

    fn watch(&self, mut child: Child, generation: u64) -> LiveWorker {
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            relay_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            relay_output(stderr, "stderr");
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let events = self.event_tx.clone();
        let grace = self.shutdown_grace;

        let monitor = tokio::spawn(async move {
            // A dropped kill sender also resolves `kill_rx`, so losing the
            // handle terminates the worker.
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };

            match exited {
                Some(status) => {
                    let reason = match status {
                        Ok(status) => TerminationReason::Exited(status),
                        Err(e) => TerminationReason::Error(e.to_string()),
                    };
                    let _ = events.send(WorkerEvent::Terminated { generation, reason });
                }
                None => terminate_child(&mut child, grace).await,
            }
        });

        LiveWorker {
            generation,
            pid,
            kill_tx,
            monitor,
        }
    }

    /// SPAWNING -> READY, once per spawn.
    fn handle_ready(&mut self) {
        match std::mem::replace(&mut self.slot, WorkerSlot::Absent) {
            WorkerSlot::Spawning(worker) => {
                tracing::info!(pid = ?worker.pid, generation = worker.generation, "Worker ready");
                self.slot = WorkerSlot::Ready(worker);

                let mut metric = MetricName::Created;
                while let Some(invocation) = self.pending.pop_front() {
                    self.metrics.emit(metric);
                    metric = MetricName::Reused;
                    self.dispatch(invocation);
                }
            }
            other => {
                tracing::debug!(state = %other.state(), "Ignoring readiness signal");
                self.slot = other;
            }
        }
    }

    async fn handle_termination(&mut self, generation: u64, reason: TerminationReason) {
        if self.live_generation != Some(generation) {
            tracing::debug!(generation, "Ignoring termination of stale worker");
            return;
        }
        self.live_generation = None;

        let previous = std::mem::replace(&mut self.slot, WorkerSlot::Absent);
        let state = previous.state();
        drop(previous);

        if self.record_termination(generation, state, reason).await {
            return;
        }

        // Queued invocations carry over to the new worker.
        self.ensure_worker_running().await;
    }

    /// Count one termination and emit its metric. Returns true if the
    /// respawn budget is spent and the supervisor halted.
    async fn record_termination(
        &mut self,
        generation: u64,
        state: WorkerState,
        reason: TerminationReason,
    ) -> bool {
        self.respawn_count = self.respawn_count.saturating_add(1);

        tracing::error!(
            generation,
            respawn_count = self.respawn_count,
            %state,
            %reason,
            "Worker terminated"
        );

        let posted = self.metrics.emit(MetricName::Terminated);

        if self.respawn_count <= self.max_respawn_count {
            return false;
        }

        tracing::error!(
            respawn_count = self.respawn_count,
            max_respawn_count = self.max_respawn_count,
            "Worker respawn budget exhausted"
        );
        // Exit only once the last datapoint is out.
        if tokio::time::timeout(FINAL_METRIC_TIMEOUT, posted).await.is_err() {
            tracing::warn!("Timed out posting final termination metric");
        }
        self.halt(format!(
            "worker terminated {} times (maximum respawn count {})",
            self.respawn_count, self.max_respawn_count
        ));
        true
    }

    fn halt(&mut self, reason: String) {
        self.slot = WorkerSlot::Halted;
        for invocation in self.pending.drain(..) {
            invocation.done(Err(InvokeError::Halted(reason.clone())));
        }
        self.halt_reason = Some(reason);
        self.exit.exit(1);
    }

    async fn shutdown(&mut self) {
        let slot = std::mem::replace(&mut self.slot, WorkerSlot::Absent);
        self.live_generation = None;

        match slot {
            WorkerSlot::Spawning(worker) | WorkerSlot::Ready(worker) => {
                tracing::info!(pid = ?worker.pid, "Terminating worker");
                worker.terminate().await;
            }
            WorkerSlot::Halted => self.slot = WorkerSlot::Halted,
            WorkerSlot::Absent => {}
        }

        for invocation in self.pending.drain(..) {
            invocation.done(Err(InvokeError::Unavailable));
        }
    }
}

/// SIGTERM, then SIGKILL after `grace`.
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => {
                    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                        return;
                    }
                    tracing::warn!(pid, "Worker ignored SIGTERM, killing");
                }
                Err(e) => tracing::debug!(pid, error = %e, "Failed to send SIGTERM"),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill worker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_support::RecordingSink;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Runs `sh -c <script>`; scripts are picked by spawn index, the last
    /// one repeating.
    struct ScriptSpawner {
        scripts: Vec<&'static str>,
        spawned: AtomicUsize,
    }

    impl ScriptSpawner {
        fn new(scripts: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                scripts: scripts.to_vec(),
                spawned: AtomicUsize::new(0),
            })
        }

        fn spawned(&self) -> usize {
            self.spawned.load(Ordering::SeqCst)
        }
    }

    impl WorkerSpawner for ScriptSpawner {
        fn spawn(&self, _config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
            let index = self.spawned.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts[index.min(self.scripts.len() - 1)];
            let child = Command::new("sh")
                .arg("-c")
                .arg(script)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            Ok(child)
        }
    }

    struct FailingSpawner {
        attempts: AtomicUsize,
    }

    impl WorkerSpawner for FailingSpawner {
        fn spawn(&self, _config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SpawnError::Other("no such binary".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingExit {
        codes: Mutex<Vec<i32>>,
        notify: Notify,
    }

    impl RecordingExit {
        fn codes(&self) -> Vec<i32> {
            self.codes.lock().unwrap().clone()
        }

        async fn wait(&self) {
            tokio::time::timeout(Duration::from_secs(10), self.notify.notified())
                .await
                .expect("exit was never requested");
        }
    }

    impl ProcessExit for RecordingExit {
        fn exit(&self, code: i32) {
            self.codes.lock().unwrap().push(code);
            self.notify.notify_one();
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        sink: Arc<RecordingSink>,
        exit: Arc<RecordingExit>,
        handle: SupervisorHandle,
    }

    fn start(spawner: Arc<dyn WorkerSpawner>, worker_url: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Sparta.lambda.amd64");
        std::fs::write(&source, b"binary").unwrap();
        let materializer = BinaryMaterializer::new(source, dir.path().join("worker"));
        start_with_materializer(dir, materializer, spawner, worker_url)
    }

    fn start_with_materializer(
        dir: tempfile::TempDir,
        materializer: BinaryMaterializer,
        spawner: Arc<dyn WorkerSpawner>,
        worker_url: &str,
    ) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let exit = Arc::new(RecordingExit::default());
        let config = SupervisorConfig::new(
            materializer,
            Forwarder::new(worker_url),
            MetricEmitter::new("TestService", sink.clone()),
        )
        .with_spawner(spawner)
        .with_exit(exit.clone())
        .with_shutdown_grace(Duration::from_millis(500));

        Harness {
            _dir: dir,
            sink,
            exit,
            handle: start_supervisor(config),
        }
    }

    async fn wait_for<F>(handle: &SupervisorHandle, predicate: F) -> SupervisorSnapshot
    where
        F: Fn(&SupervisorSnapshot) -> bool,
    {
        for _ in 0..500 {
            let snapshot = handle.snapshot().await.unwrap();
            if predicate(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("supervisor never reached expected state");
    }

    async fn ok_worker(expected_calls: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
            .expect(expected_calls)
            .mount(&server)
            .await;
        server
    }

    fn spawn_invoke(handle: &SupervisorHandle) -> JoinHandle<InvokeResult> {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .invoke("/", json!({"body": "{\"n\":1}"}), json!({"awsRequestId": "r"}))
                .await
        })
    }

    #[tokio::test]
    async fn starts_absent() {
        let spawner = ScriptSpawner::new(&["sleep 30"]);
        let harness = start(spawner.clone(), "http://127.0.0.1:9");

        let snapshot = harness.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, WorkerState::Absent);
        assert_eq!(snapshot.respawn_count, 0);
        assert_eq!(spawner.spawned(), 0);
    }

    #[tokio::test]
    async fn invocation_waits_for_readiness_then_forwards() {
        let server = ok_worker(2).await;
        let spawner = ScriptSpawner::new(&["sleep 30"]);
        let harness = start(spawner.clone(), &server.uri());

        let first = spawn_invoke(&harness.handle);
        let snapshot = wait_for(&harness.handle, |s| s.state == WorkerState::Spawning).await;
        assert_eq!(snapshot.pending, 1);
        assert!(snapshot.worker_pid.is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!first.is_finished());

        assert!(harness.handle.notify_ready());
        assert_eq!(first.await.unwrap().unwrap(), json!({"ok": true}));

        // Ready worker: straight to the forwarder, no new spawn.
        let second = spawn_invoke(&harness.handle);
        assert_eq!(second.await.unwrap().unwrap(), json!({"ok": true}));
        assert_eq!(spawner.spawned(), 1);

        let snapshot = harness.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, WorkerState::Ready);
        assert_eq!(snapshot.pending, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            harness.sink.names(),
            vec![MetricName::Created, MetricName::Reused]
        );

        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_readiness_forwards_pending_once() {
        let server = ok_worker(1).await;
        let harness = start(ScriptSpawner::new(&["sleep 30"]), &server.uri());

        let invocation = spawn_invoke(&harness.handle);
        wait_for(&harness.handle, |s| s.state == WorkerState::Spawning).await;

        assert!(harness.handle.notify_ready());
        assert!(harness.handle.notify_ready());

        assert_eq!(invocation.await.unwrap().unwrap(), json!({"ok": true}));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = harness.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, WorkerState::Ready);
        let created = harness
            .sink
            .names()
            .into_iter()
            .filter(|n| *n == MetricName::Created)
            .count();
        assert_eq!(created, 1);

        harness.handle.shutdown().await;
        // MockServer verifies `expect(1)` on drop.
    }

    #[tokio::test]
    async fn queued_invocations_flush_in_order_on_readiness() {
        let server = ok_worker(3).await;
        let harness = start(ScriptSpawner::new(&["sleep 30"]), &server.uri());

        let first = spawn_invoke(&harness.handle);
        wait_for(&harness.handle, |s| s.state == WorkerState::Spawning).await;
        let second = spawn_invoke(&harness.handle);
        let third = spawn_invoke(&harness.handle);
        wait_for(&harness.handle, |s| s.pending == 3).await;

        harness.handle.notify_ready();
        for task in [first, second, third] {
            assert_eq!(task.await.unwrap().unwrap(), json!({"ok": true}));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let names = harness.sink.names();
        assert_eq!(names.iter().filter(|n| **n == MetricName::Created).count(), 1);
        assert_eq!(names.iter().filter(|n| **n == MetricName::Reused).count(), 2);
        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn never_ready_worker_leaves_invocation_pending() {
        let spawner = ScriptSpawner::new(&["sleep 30"]);
        let harness = start(spawner.clone(), "http://127.0.0.1:9");

        let invocation = spawn_invoke(&harness.handle);
        let outcome = tokio::time::timeout(Duration::from_millis(300), invocation).await;
        assert!(outcome.is_err(), "invocation completed without readiness");

        let snapshot = harness.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, WorkerState::Spawning);
        assert_eq!(snapshot.pending, 1);
        assert_eq!(snapshot.respawn_count, 0);
        assert!(harness.exit.codes().is_empty());
        assert_eq!(spawner.spawned(), 1);

        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn crash_loop_requests_exit_after_budget() {
        let spawner = ScriptSpawner::new(&["exit 3"]);
        let harness = start(spawner.clone(), "http://127.0.0.1:9");

        let invocation = spawn_invoke(&harness.handle);
        harness.exit.wait().await;

        assert_eq!(harness.exit.codes(), vec![1]);
        // Initial worker plus MAXIMUM_RESPAWN_COUNT respawns.
        assert_eq!(spawner.spawned(), 6);

        let snapshot = harness.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, WorkerState::Halted);
        assert_eq!(snapshot.respawn_count, 6);
        assert_eq!(snapshot.pending, 0);

        let result = invocation.await.unwrap();
        assert!(matches!(result, Err(InvokeError::Halted(_))));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(spawner.spawned(), 6);
        assert_eq!(harness.exit.codes(), vec![1]);

        let terminated = harness
            .sink
            .names()
            .into_iter()
            .filter(|n| *n == MetricName::Terminated)
            .count();
        assert_eq!(terminated, 6);

        // Later invocations fail fast instead of spawning.
        let late = harness.handle.invoke("/", json!({}), json!({})).await;
        assert!(matches!(late, Err(InvokeError::Halted(_))));
        assert_eq!(spawner.spawned(), 6);
    }

    #[tokio::test]
    async fn pending_invocation_survives_worker_crash() {
        let server = ok_worker(1).await;
        let spawner = ScriptSpawner::new(&["exit 1", "sleep 30"]);
        let harness = start(spawner.clone(), &server.uri());

        let invocation = spawn_invoke(&harness.handle);
        let snapshot = wait_for(&harness.handle, |s| {
            s.respawn_count == 1 && s.state == WorkerState::Spawning
        })
        .await;
        assert_eq!(snapshot.pending, 1);
        assert_eq!(spawner.spawned(), 2);

        harness.handle.notify_ready();
        assert_eq!(invocation.await.unwrap().unwrap(), json!({"ok": true}));
        assert!(harness.exit.codes().is_empty());

        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn ready_worker_exit_triggers_respawn() {
        let server = ok_worker(1).await;
        let spawner = ScriptSpawner::new(&["sleep 1", "sleep 30"]);
        let harness = start(spawner.clone(), &server.uri());

        let invocation = spawn_invoke(&harness.handle);
        wait_for(&harness.handle, |s| s.state == WorkerState::Spawning).await;
        harness.handle.notify_ready();
        invocation.await.unwrap().unwrap();

        // First worker exits on its own; the wake path spawns a fresh one.
        let snapshot = wait_for(&harness.handle, |s| s.respawn_count == 1).await;
        assert_eq!(snapshot.state, WorkerState::Spawning);
        assert_eq!(spawner.spawned(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.sink.names().contains(&MetricName::Terminated));

        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_failure_counts_as_termination() {
        let spawner = Arc::new(FailingSpawner {
            attempts: AtomicUsize::new(0),
        });
        let harness = start(spawner.clone(), "http://127.0.0.1:9");

        let invocation = spawn_invoke(&harness.handle);
        harness.exit.wait().await;

        assert_eq!(spawner.attempts.load(Ordering::SeqCst), 6);
        let snapshot = harness.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.respawn_count, 6);
        assert!(matches!(invocation.await.unwrap(), Err(InvokeError::Halted(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_invocations_count_every_failed_spawn() {
        let spawner = Arc::new(FailingSpawner {
            attempts: AtomicUsize::new(0),
        });
        let harness = start(spawner.clone(), "http://127.0.0.1:9");

        let invocations: Vec<_> = (0..30).map(|_| spawn_invoke(&harness.handle)).collect();
        for invocation in invocations {
            assert!(matches!(invocation.await.unwrap(), Err(InvokeError::Halted(_))));
        }

        let snapshot = harness.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, WorkerState::Halted);
        assert_eq!(snapshot.respawn_count, 6);
        assert_eq!(spawner.attempts.load(Ordering::SeqCst), 6);
        assert_eq!(harness.exit.codes(), vec![1]);
    }

    /// Records a datapoint only after a delay.
    #[derive(Default)]
    struct SlowSink {
        posted: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl crate::metrics::MetricsSink for SlowSink {
        async fn put_counter(
            &self,
            _namespace: &str,
            _name: MetricName,
        ) -> Result<(), crate::metrics::MetricsError> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.posted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Captures how many datapoints were posted when exit was requested.
    struct PostedAtExit {
        sink: Arc<SlowSink>,
        posted: Mutex<Option<usize>>,
        notify: Notify,
    }

    impl ProcessExit for PostedAtExit {
        fn exit(&self, _code: i32) {
            *self.posted.lock().unwrap() = Some(self.sink.posted.load(Ordering::SeqCst));
            self.notify.notify_one();
        }
    }

    #[tokio::test]
    async fn final_termination_metric_posts_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Sparta.lambda.amd64");
        std::fs::write(&source, b"binary").unwrap();

        let sink = Arc::new(SlowSink::default());
        let exit = Arc::new(PostedAtExit {
            sink: sink.clone(),
            posted: Mutex::new(None),
            notify: Notify::new(),
        });
        let config = SupervisorConfig::new(
            BinaryMaterializer::new(source, dir.path().join("worker")),
            Forwarder::new("http://127.0.0.1:9"),
            MetricEmitter::new("TestService", sink.clone()),
        )
        .with_spawner(Arc::new(FailingSpawner {
            attempts: AtomicUsize::new(0),
        }))
        .with_exit(exit.clone())
        .with_max_respawn_count(0);
        let handle = start_supervisor(config);

        let invocation = spawn_invoke(&handle);
        tokio::time::timeout(Duration::from_secs(10), exit.notify.notified())
            .await
            .expect("exit was never requested");

        assert_eq!(*exit.posted.lock().unwrap(), Some(1));
        assert!(matches!(invocation.await.unwrap(), Err(InvokeError::Halted(_))));
    }

    #[tokio::test]
    async fn missing_binary_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let materializer =
            BinaryMaterializer::new(dir.path().join("missing"), dir.path().join("worker"));
        let spawner = ScriptSpawner::new(&["sleep 30"]);
        let harness =
            start_with_materializer(dir, materializer, spawner.clone(), "http://127.0.0.1:9");

        let result = harness.handle.invoke("/", json!({}), json!({})).await;

        assert!(matches!(result, Err(InvokeError::Halted(_))));
        assert_eq!(harness.exit.codes(), vec![1]);
        assert_eq!(spawner.spawned(), 0);
        let snapshot = harness.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, WorkerState::Halted);
        assert_eq!(snapshot.respawn_count, 0);
    }

    #[tokio::test]
    async fn unreachable_ready_worker_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let harness = start(ScriptSpawner::new(&["sleep 30"]), &url);

        let invocation = spawn_invoke(&harness.handle);
        wait_for(&harness.handle, |s| s.state == WorkerState::Spawning).await;
        harness.handle.notify_ready();

        let result = invocation.await.unwrap();
        assert!(matches!(
            result,
            Err(InvokeError::Forward(crate::forwarder::ForwardError::Transport(_)))
        ));

        // Supervision state is untouched by transport errors.
        let snapshot = harness.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, WorkerState::Ready);
        assert_eq!(snapshot.respawn_count, 0);

        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_terminates_worker_and_releases_pending() {
        let harness = start(ScriptSpawner::new(&["sleep 30"]), "http://127.0.0.1:9");

        let invocation = spawn_invoke(&harness.handle);
        let snapshot = wait_for(&harness.handle, |s| s.state == WorkerState::Spawning).await;
        let pid = snapshot.worker_pid.unwrap();

        harness.handle.shutdown().await;

        assert!(matches!(invocation.await.unwrap(), Err(InvokeError::Unavailable)));
        assert!(harness.handle.snapshot().await.is_none());

        #[cfg(unix)]
        {
            let pid = nix::unistd::Pid::from_raw(pid as i32);
            assert!(nix::sys::signal::kill(pid, None).is_err());
        }
        // No termination was counted for a supervised shutdown.
        assert!(harness.exit.codes().is_empty());
    }

    #[tokio::test]
    async fn binary_spawner_passes_signal_pid() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("worker.sh");
        std::fs::write(&binary, "#!/bin/sh\necho \"$@\"\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let child = BinarySpawner
            .spawn(&WorkerSpawnConfig {
                binary_path: binary,
                signal_pid: 4242,
                extra_path: Some(dir.path().to_path_buf()),
            })
            .unwrap();
        let output = child.wait_with_output().await.unwrap();

        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "execute --signal 4242\n");
    }

    #[test]
    fn path_with_appends_directory() {
        let joined = path_with(Path::new("/var/task"));
        let paths: Vec<PathBuf> = std::env::split_paths(&joined).collect();
        assert_eq!(paths.last(), Some(&PathBuf::from("/var/task")));
    }
}
