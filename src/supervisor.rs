use crate::events::{EventPublisher, ListenerId, SupervisorListener};
use crate::launcher::{self, LaunchError, LaunchSpec, LaunchedProcess};
use crate::log::{self, LogBuffer, LogLine, LogSource};
use crate::readiness;
use crate::scanner::{self, ProcessScanner, ReattachSignature, ScanError};
use crate::settings::SettingsSource;
use crate::state::{ServerState, ServerStatus};
use crate::sys;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Timings
// ---------------------------------------------------------------------------

/// Delays and bounds used by the supervisor, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// How long Stop waits for the killed process to exit.
    pub stop_timeout_ms: u64,
    /// Pause between the Stop and Start halves of a Restart.
    pub restart_delay_ms: u64,
    pub reattach_interval_ms: u64,
    pub reattach_attempts: u32,
    /// Window after a crash in which a re-attach may win over auto-restart.
    pub auto_restart_grace_ms: u64,
    pub auto_restart_delay_ms: u64,
    /// Liveness poll for adopted processes, which cannot be waited on.
    pub exit_poll_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 5000,
            restart_delay_ms: 1000,
            reattach_interval_ms: 500,
            reattach_attempts: 5,
            auto_restart_grace_ms: 15_000,
            auto_restart_delay_ms: 5000,
            exit_poll_ms: 500,
        }
    }
}

impl Timings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn reattach_interval(&self) -> Duration {
        Duration::from_millis(self.reattach_interval_ms)
    }

    pub fn auto_restart_grace(&self) -> Duration {
        Duration::from_millis(self.auto_restart_grace_ms)
    }

    pub fn auto_restart_delay(&self) -> Duration {
        Duration::from_millis(self.auto_restart_delay_ms)
    }

    pub fn exit_poll(&self) -> Duration {
        Duration::from_millis(self.exit_poll_ms.max(10))
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("failed to stop server process: {0}")]
    StopFailed(String),
}

impl SupervisorError {
    /// True for problems the user fixes in settings (root or files missing).
    pub fn is_configuration(&self) -> bool {
        matches!(self, SupervisorError::Launch(e) if e.is_configuration())
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessKind {
    /// Spawned by us; exit observed through `wait`.
    Owned,
    /// Found in the process table; exit observed by polling.
    Adopted,
}

struct Tracked {
    pid: u32,
    generation: u64,
    kind: ProcessKind,
    exited: watch::Receiver<bool>,
}

/// Everything guarded by the supervisor lock. `process.is_some()` holds
/// exactly when `state != Stopped`.
#[derive(Default)]
struct Core {
    state: ServerState,
    process: Option<Tracked>,
    /// Bumped on every launch or adoption; events from older processes are ignored.
    generation: u64,
    /// Bumped by explicit commands and by each crash; recovery tasks carry the
    /// value they were started with and give up once it changes.
    recovery_epoch: u64,
    last_script: Option<PathBuf>,
}

struct Inner {
    core: Mutex<Core>,
    status: watch::Sender<ServerStatus>,
    publisher: EventPublisher,
    logs: LogBuffer,
    settings: Arc<dyn SettingsSource>,
    scanner: Arc<dyn ProcessScanner>,
}

impl Inner {
    fn timings(&self) -> Timings {
        self.settings.current().timings
    }

    /// Apply a transition and publish it. Callers update `core.process`
    /// first so the published status carries the matching pid.
    fn set_state(&self, core: &mut Core, state: ServerState) {
        if core.state == state {
            return;
        }
        core.state = state;
        let pid = core.process.as_ref().map(|p| p.pid);
        self.status.send_replace(ServerStatus { state, pid });
        debug!(%state, ?pid, "server state changed");
        self.publisher.publish_state(state);
    }

    fn record(&self, line: LogLine) {
        self.logs.push(line.clone());
        self.publisher.publish_line(&line);
    }

    fn narrate(&self, text: impl Into<String>) {
        self.record(LogLine::manager(text));
    }

    fn report(&self, err: &SupervisorError) {
        if err.is_configuration() {
            warn!("{err}");
        } else {
            error!("{err}");
        }
        self.narrate(format!("Error: {err}"));
        self.publisher.publish_error(err);
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns the single supervised server process. Cheap to clone; all clones
/// share one state machine. Every mutation happens under one lock, and
/// events are published while it is held, so listeners observe transitions
/// in the order they happened. Listeners must not block.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(settings: Arc<dyn SettingsSource>, scanner: Arc<dyn ProcessScanner>) -> Self {
        let capacity = settings.current().log_capacity;
        let (status, _) = watch::channel(ServerStatus::stopped());
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core::default()),
                status,
                publisher: EventPublisher::new(),
                logs: LogBuffer::new(capacity),
                settings,
                scanner,
            }),
        }
    }

    // -- observation --------------------------------------------------------

    pub fn status(&self) -> ServerStatus {
        *self.inner.status.borrow()
    }

    pub fn state(&self) -> ServerState {
        self.status().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.status().pid
    }

    pub fn watch_status(&self) -> watch::Receiver<ServerStatus> {
        self.inner.status.subscribe()
    }

    pub fn log_snapshot(&self) -> Vec<LogLine> {
        self.inner.logs.snapshot()
    }

    pub fn subscribe(&self, listener: Arc<dyn SupervisorListener>) -> ListenerId {
        self.inner.publisher.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.publisher.unsubscribe(id)
    }

    /// Subscribe and take the log backlog in one step: every line is either
    /// in the returned snapshot or delivered to the listener, never both.
    pub async fn attach_listener(
        &self,
        listener: Arc<dyn SupervisorListener>,
    ) -> (ListenerId, Vec<LogLine>, ServerStatus) {
        let _core = self.inner.core.lock().await;
        let backlog = self.inner.logs.snapshot();
        let id = self.inner.publisher.subscribe(listener);
        (id, backlog, self.status())
    }

    // -- commands -----------------------------------------------------------

    /// Launch the server. Does nothing unless stopped. Returns once the OS
    /// has created the process; readiness is reported later.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut core = self.inner.core.lock().await;
        self.start_locked(&mut core)
    }

    /// Kill the server and wait for it to exit, bounded by the stop timeout.
    /// Ends in `Stopped` even when the kill fails.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut core = self.inner.core.lock().await;
        self.stop_locked(&mut core).await
    }

    /// Stop, pause, then start. From `Stopped` this is a plain start.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let mut core = self.inner.core.lock().await;
        if core.state == ServerState::Stopped {
            self.inner.narrate("Server was not running. Starting...");
            return self.start_locked(&mut core);
        }

        self.inner.narrate("Restarting server...");
        let stopped = self.stop_locked(&mut core).await;
        tokio::time::sleep(self.inner.timings().restart_delay()).await;
        let started = self.start_locked(&mut core);
        stopped.and(started)
    }

    /// Stop the server for good at the end of a session.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        let mut core = self.inner.core.lock().await;
        if core.state.is_active() {
            self.inner.narrate("Shutting down...");
        }
        self.stop_locked(&mut core).await
    }

    /// Look for a server left running by an earlier session and take it over.
    /// Goes straight to `Running` on a match, since the readiness banner is
    /// long gone. Returns the adopted pid.
    pub async fn adopt_existing(&self) -> Option<u32> {
        let settings = self.inner.settings.current();
        let root = settings.root_directory.filter(|r| r.is_dir())?;
        let script = scanner::script_for_root(&root);
        if !script.is_file() {
            return None;
        }

        let mut core = self.inner.core.lock().await;
        if core.state != ServerState::Stopped {
            return None;
        }
        core.last_script = Some(script);

        let signature = ReattachSignature::for_adoption(&root);
        let pid = match self.scan(signature).await {
            Ok(found) => found?,
            Err(e) => {
                warn!("initial process scan failed: {e}");
                self.inner
                    .narrate(format!("Error during initial process scan: {e}"));
                return None;
            }
        };

        core.generation += 1;
        let generation = core.generation;
        self.track_adopted(&mut core, generation, pid);
        self.inner.set_state(&mut core, ServerState::Running);
        info!(pid, "adopted existing server process");
        self.inner
            .narrate(format!("Attached to existing server process (PID: {pid})."));
        Some(pid)
    }

    // -- locked operations --------------------------------------------------

    fn start_locked(&self, core: &mut Core) -> Result<(), SupervisorError> {
        if core.state != ServerState::Stopped {
            debug!(state = %core.state, "start ignored");
            return Ok(());
        }
        core.recovery_epoch += 1;

        let settings = self.inner.settings.current();
        let launched = LaunchSpec::from_settings(&settings).and_then(|spec| {
            debug!("launching: {}", spec.command_line());
            let launched = launcher::launch(&spec)?;
            Ok((spec, launched))
        });
        let (spec, launched) = match launched {
            Ok(ok) => ok,
            Err(e) => {
                let err = SupervisorError::from(e);
                self.inner.report(&err);
                return Err(err);
            }
        };

        core.generation += 1;
        let generation = core.generation;
        core.last_script = Some(spec.script);
        self.track_owned(core, generation, launched);
        self.inner.set_state(core, ServerState::Starting);
        self.inner.narrate("Server process starting...");
        Ok(())
    }

    async fn stop_locked(&self, core: &mut Core) -> Result<(), SupervisorError> {
        core.recovery_epoch += 1;
        if core.state == ServerState::Stopped {
            return Ok(());
        }

        self.inner.narrate("Stopping server process...");
        let mut result = Ok(());
        // Taking the process marks its exit as requested: the exit watcher
        // finds the state already `Stopped` and does nothing.
        if let Some(mut process) = core.process.take() {
            if let Err(e) = sys::kill_tree(process.pid) {
                result = Err(SupervisorError::StopFailed(e.to_string()));
            }
            let timeout = self.inner.timings().stop_timeout();
            let exited = tokio::time::timeout(timeout, wait_exited(&mut process.exited))
                .await
                .is_ok();
            if !exited {
                warn!(pid = process.pid, ?timeout, "server process did not exit in time");
            }
        }

        self.inner.set_state(core, ServerState::Stopped);
        self.inner.narrate("Server stopped.");
        if let Err(e) = &result {
            self.inner.report(e);
        }
        result
    }

    // -- process tracking ---------------------------------------------------

    fn track_owned(&self, core: &mut Core, generation: u64, launched: LaunchedProcess) {
        let LaunchedProcess {
            pid,
            mut child,
            stdout,
            stderr,
        } = launched;
        let (exited_tx, exited_rx) = watch::channel(false);

        // Both streams feed one channel; a single consumer applies the lines.
        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = stdout {
            log::spawn_line_reader(LogSource::Stdout, stdout, line_tx.clone());
        }
        if let Some(stderr) = stderr {
            log::spawn_line_reader(LogSource::Stderr, stderr, line_tx);
        }
        let sup = self.clone();
        let mut pump = tokio::spawn(async move {
            while let Some((source, text)) = line_rx.recv().await {
                sup.on_line(generation, source, text).await;
            }
        });

        let sup = self.clone();
        tokio::spawn(async move {
            let detail = match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {e}"),
            };
            let _ = exited_tx.send(true);
            // Let trailing output land before the exit is narrated.
            if tokio::time::timeout(Duration::from_millis(500), &mut pump)
                .await
                .is_err()
            {
                debug!(pid, "output still open after exit");
            }
            sup.on_exit(generation, detail).await;
        });

        core.process = Some(Tracked {
            pid,
            generation,
            kind: ProcessKind::Owned,
            exited: exited_rx,
        });
    }

    fn track_adopted(&self, core: &mut Core, generation: u64, pid: u32) {
        let (exited_tx, exited_rx) = watch::channel(false);
        let poll = self.inner.timings().exit_poll();

        let sup = self.clone();
        tokio::spawn(async move {
            while sys::is_pid_alive(pid) {
                tokio::time::sleep(poll).await;
            }
            let _ = exited_tx.send(true);
            sup.on_exit(generation, "no longer running".to_string())
                .await;
        });

        core.process = Some(Tracked {
            pid,
            generation,
            kind: ProcessKind::Adopted,
            exited: exited_rx,
        });
    }

    // -- process events -----------------------------------------------------

    async fn on_line(&self, generation: u64, source: LogSource, text: String) {
        let mut core = self.inner.core.lock().await;
        let ready = readiness::is_ready_line(&text);
        self.inner.record(LogLine::new(source, text));

        let current = core.process.as_ref().map(|p| p.generation) == Some(generation);
        if ready && current && core.state == ServerState::Starting {
            self.inner.set_state(&mut core, ServerState::Running);
            info!("server is ready");
            self.inner.narrate("Server startup confirmed.");
        }
    }

    async fn on_exit(&self, generation: u64, detail: String) {
        let mut core = self.inner.core.lock().await;
        if core.state == ServerState::Stopped {
            return;
        }
        let Some(process) = core.process.as_ref() else {
            return;
        };
        if process.generation != generation {
            return;
        }

        let (pid, kind) = (process.pid, process.kind);
        core.process = None;
        self.inner.set_state(&mut core, ServerState::Stopped);
        warn!(pid, ?kind, "server process exited unexpectedly: {detail}");
        self.inner
            .narrate(format!("Server process has exited ({detail})."));

        core.recovery_epoch += 1;
        let epoch = core.recovery_epoch;
        if let Some(script) = core.last_script.clone() {
            self.inner
                .narrate("Searching for orphaned server process to re-attach...");
            self.spawn_reattach_search(epoch, script);
        }
        if self.inner.settings.current().auto_restart_on_crash {
            self.spawn_auto_restart(epoch);
        }
    }

    // -- recovery -----------------------------------------------------------

    fn spawn_reattach_search(&self, epoch: u64, script: PathBuf) {
        let sup = self.clone();
        tokio::spawn(async move {
            let timings = sup.inner.timings();
            let signature = ReattachSignature::for_script(&script);

            for attempt in 1..=timings.reattach_attempts {
                tokio::time::sleep(timings.reattach_interval()).await;
                if !sup.recovery_pending(epoch).await {
                    debug!(attempt, "re-attach search cancelled");
                    return;
                }

                let pid = match sup.scan(signature.clone()).await {
                    Ok(Some(pid)) => pid,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(attempt, "re-attach scan failed: {e}");
                        let core = sup.inner.core.lock().await;
                        if core.recovery_epoch != epoch || core.state != ServerState::Stopped {
                            return;
                        }
                        sup.inner
                            .narrate(format!("Error during re-attach search: {e}"));
                        continue;
                    }
                };

                let mut core = sup.inner.core.lock().await;
                if core.recovery_epoch != epoch || core.state != ServerState::Stopped {
                    return;
                }
                core.generation += 1;
                let generation = core.generation;
                sup.track_adopted(&mut core, generation, pid);
                sup.inner.set_state(&mut core, ServerState::Starting);
                info!(pid, attempt, "re-attached to server process");
                sup.inner
                    .narrate(format!("Successfully re-attached to new process (PID: {pid})."));
                return;
            }

            let core = sup.inner.core.lock().await;
            if core.recovery_epoch == epoch && core.state == ServerState::Stopped {
                info!("re-attach search timed out");
                sup.inner
                    .narrate("Re-attach search timed out. Could not find a new server process.");
            }
        });
    }

    /// Two phases: give a re-attach the grace period to win, then announce
    /// and wait the restart delay. Each phase re-checks under the lock.
    fn spawn_auto_restart(&self, epoch: u64) {
        let sup = self.clone();
        tokio::spawn(async move {
            let timings = sup.inner.timings();
            tokio::time::sleep(timings.auto_restart_grace()).await;
            {
                let core = sup.inner.core.lock().await;
                if core.recovery_epoch != epoch || core.state != ServerState::Stopped {
                    return;
                }
                sup.inner.narrate(format!(
                    "Auto-restarting server in {}...",
                    describe_delay(timings.auto_restart_delay())
                ));
            }

            tokio::time::sleep(timings.auto_restart_delay()).await;
            let mut core = sup.inner.core.lock().await;
            if core.recovery_epoch != epoch || core.state != ServerState::Stopped {
                return;
            }
            info!("auto-restarting server after crash");
            // Failures are reported to listeners inside start_locked.
            let _ = sup.start_locked(&mut core);
        });
    }

    async fn recovery_pending(&self, epoch: u64) -> bool {
        let core = self.inner.core.lock().await;
        core.recovery_epoch == epoch && core.state == ServerState::Stopped
    }

    async fn scan(&self, signature: ReattachSignature) -> Result<Option<u32>, ScanError> {
        let scanner = Arc::clone(&self.inner.scanner);
        tokio::task::spawn_blocking(move || scanner.find_match(&signature))
            .await
            .unwrap_or_else(|e| Err(ScanError::Failed(e.to_string())))
    }
}

async fn wait_exited(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|&exited| exited).await;
}

fn describe_delay(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        let secs = d.as_secs();
        if secs == 1 {
            "1 second".to_string()
        } else {
            format!("{secs} seconds")
        }
    } else {
        format!("{} ms", d.as_millis())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
