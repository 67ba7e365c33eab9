//! Lifecycle of the single llama-server child process.
//!
//! Lock order is `ops` then `state`. `ops` serializes whole lifecycle
//! operations (start, stop, timeout teardown) and may be held across process
//! waits; `state` is only held for short reads and transitions, so status
//! queries stay responsive while a stop is waiting out its grace period.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use modelcfg::{LauncherConfig, SupervisorSection};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SupervisorError};
use crate::health::{run_probe_loop, ProbeStep, Readiness, ReadinessProbe};
use crate::log_ring::{LogEntry, LogRing, LogSource};
use crate::runtime::{Phase, ServerState, StatusSnapshot};

/// How long to wait for the kernel to reap a SIGKILLed child.
const KILL_WAIT: Duration = Duration::from_secs(5);
/// Lines of output attached to an unexpected-exit error.
const EXIT_DETAIL_LINES: usize = 5;
const DRAIN_FLUSH_WAIT: Duration = Duration::from_millis(500);
/// Longer output lines are split into several entries.
const MAX_LINE_BYTES: u64 = 16 * 1024;

#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub probe_interval: Duration,
    pub health_timeout: Duration,
    pub stop_grace: Duration,
    pub port_release_timeout: Duration,
}

impl From<&SupervisorSection> for SupervisorSettings {
    fn from(s: &SupervisorSection) -> Self {
        Self {
            probe_interval: Duration::from_millis(s.probe_interval_ms.max(1)),
            health_timeout: Duration::from_secs(s.health_timeout_secs),
            stop_grace: Duration::from_secs(s.stop_grace_secs),
            port_release_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: &ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self { code: status.code(), signal }
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(c), _) => format!("exit code {c}"),
            (None, Some(s)) => format!("killed by signal {s}"),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

/// Handle to the live child. The `Child` itself is owned by the monitor task;
/// this side can only ask it to die and watch for the exit.
pub struct ActiveProcess {
    pub pid: Option<u32>,
    cancel: CancellationToken,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StartInfo {
    pub model: String,
    pub name: String,
    pub pid: Option<u32>,
    pub generation: u64,
    pub phase: Phase,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StopInfo {
    pub stopped: Option<String>,
    pub name: Option<String>,
    pub forced: bool,
    pub exit: Option<ExitInfo>,
}

struct Terminated {
    forced: bool,
    exit: ExitInfo,
}

pub struct Supervisor {
    config: Arc<LauncherConfig>,
    settings: SupervisorSettings,
    probe: Arc<dyn ReadinessProbe>,
    ops: Mutex<()>,
    state: Arc<Mutex<ServerState>>,
    logs: Arc<LogRing>,
}

impl Supervisor {
    pub fn new(
        config: Arc<LauncherConfig>,
        settings: SupervisorSettings,
        probe: Arc<dyn ReadinessProbe>,
        logs: Arc<LogRing>,
    ) -> Self {
        Self {
            config,
            settings,
            probe,
            ops: Mutex::new(()),
            state: Arc::new(Mutex::new(ServerState::default())),
            logs,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn probe(&self) -> &dyn ReadinessProbe {
        self.probe.as_ref()
    }

    pub fn logs(&self) -> &LogRing {
        &self.logs
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.state.lock().await.snapshot()
    }

    fn note(&self, generation: u64, line: impl Into<String>) {
        self.logs
            .append(LogEntry::new(generation, LogSource::Supervisor, line));
    }

    /// Launches `model_id` and returns as soon as the process is spawned.
    /// Readiness is tracked by a background probe; poll `status()`.
    pub async fn start(self: &Arc<Self>, model_id: &str) -> Result<StartInfo> {
        let model = self
            .config
            .model(model_id)
            .ok_or_else(|| SupervisorError::ModelNotFound(model_id.to_string()))?;
        let name = model.display_name(model_id).to_string();
        let spec = self.config.launch_spec(model);

        // refuse without queueing behind an in-flight stop
        self.ensure_accepts_start().await?;

        let _op = self.ops.lock().await;
        let mut st = self.state.lock().await;
        if !st.phase.accepts_start() {
            let current = st.model_id.clone().unwrap_or_default();
            return Err(SupervisorError::AlreadyRunning(current));
        }

        st.generation += 1;
        let generation = st.generation;
        self.logs.reset(generation);
        st.transition(Phase::Starting);
        st.model_id = Some(model_id.to_string());
        st.model_name = Some(name.clone());
        st.last_error = None;
        st.exit_code = None;
        st.pid = None;
        st.started_at = Some(Utc::now());
        st.started_instant = Some(Instant::now());

        self.note(generation, format!("Starting {name}..."));
        self.note(generation, format!("Command: {}", spec.command_line()));

        let host = &self.config.server.llama_host;
        let port = self.config.server.llama_port;
        if port_in_use(host, port) {
            let err = SupervisorError::LaunchFailure(format!("port {port} on {host} is already in use"));
            st.fail(err.to_string());
            self.note(generation, err.to_string());
            warn!(model = %model_id, port, "start refused: port busy");
            return Err(err);
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let err = SupervisorError::LaunchFailure(format!(
                    "{}: {e}",
                    spec.program.display()
                ));
                st.fail(err.to_string());
                self.note(generation, err.to_string());
                error!(model = %model_id, "spawn failed: {e}");
                return Err(err);
            }
        };

        let pid = child.id();
        let mut drains = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            drains.push(tokio::spawn(drain_output(out, LogSource::Stdout, generation, self.logs.clone())));
        }
        if let Some(err) = child.stderr.take() {
            drains.push(tokio::spawn(drain_output(err, LogSource::Stderr, generation, self.logs.clone())));
        }

        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        st.pid = pid;
        st.active = Some(ActiveProcess {
            pid,
            cancel: cancel.clone(),
            exit_rx,
            kill_tx: Some(kill_tx),
        });
        drop(st);

        tokio::spawn(monitor_exit(
            child,
            kill_rx,
            exit_tx,
            drains,
            self.state.clone(),
            self.logs.clone(),
            generation,
            cancel.clone(),
        ));
        tokio::spawn(run_probe_loop(Arc::clone(self), generation, cancel));

        info!(model = %model_id, pid = ?pid, generation, "llama-server launched");
        Ok(StartInfo {
            model: model_id.to_string(),
            name,
            pid,
            generation,
            phase: Phase::Starting,
        })
    }

    async fn ensure_accepts_start(&self) -> Result<()> {
        let st = self.state.lock().await;
        if st.phase.accepts_start() {
            return Ok(());
        }
        Err(SupervisorError::AlreadyRunning(st.model_id.clone().unwrap_or_default()))
    }

    /// Stops the running model. Always ends in `Stopped`; a failed forced
    /// kill is recorded as `last_error` and returned as `StopFailure`. A stop
    /// already in progress makes this a no-op success.
    pub async fn stop(&self) -> Result<StopInfo> {
        {
            let st = self.state.lock().await;
            if st.phase == Phase::Stopping {
                return Ok(StopInfo {
                    stopped: st.model_id.clone(),
                    name: st.model_name.clone(),
                    ..StopInfo::default()
                });
            }
        }

        let _op = self.ops.lock().await;

        let (active, model_id, name, generation) = {
            let mut st = self.state.lock().await;
            if st.phase == Phase::Stopped {
                return Ok(StopInfo::default());
            }
            let Some(active) = st.active.take() else {
                // Error with the child already gone
                let info = StopInfo {
                    stopped: st.model_id.clone(),
                    name: st.model_name.clone(),
                    ..StopInfo::default()
                };
                st.clear_process();
                st.transition(Phase::Stopped);
                return Ok(info);
            };
            st.transition(Phase::Stopping);
            (active, st.model_id.clone(), st.model_name.clone(), st.generation)
        };

        let display = name.clone().or_else(|| model_id.clone()).unwrap_or_default();
        self.note(generation, format!("Stopping {display}..."));
        info!(model = ?model_id, "stopping llama-server");

        let outcome = self.terminate(active).await;

        let mut st = self.state.lock().await;
        st.clear_process();
        st.transition(Phase::Stopped);
        match outcome {
            Ok(t) => {
                st.exit_code = t.exit.code;
                self.note(generation, format!("Stopped {display}"));
                info!(model = ?model_id, forced = t.forced, "llama-server stopped");
                Ok(StopInfo {
                    stopped: model_id,
                    name,
                    forced: t.forced,
                    exit: Some(t.exit),
                })
            }
            Err(e) => {
                st.last_error = Some(e.to_string());
                self.note(generation, e.to_string());
                error!(model = ?model_id, "{e}");
                Err(e)
            }
        }
    }

    /// SIGTERM, wait `stop_grace`, SIGKILL, wait, then wait for the port.
    /// Caller must hold `ops` and must already have taken `active` out of
    /// the state.
    async fn terminate(&self, mut active: ActiveProcess) -> Result<Terminated> {
        active.cancel.cancel();
        let mut exit_rx = active.exit_rx.clone();

        let mut forced = false;
        let already = (*exit_rx.borrow()).clone();
        let exit = match already {
            Some(e) => e,
            None => {
                send_terminate(&active);
                match timeout(self.settings.stop_grace, wait_exit(&mut exit_rx)).await {
                    Ok(Some(e)) => e,
                    _ => {
                        forced = true;
                        warn!(pid = ?active.pid, grace = ?self.settings.stop_grace, "graceful stop timed out, killing");
                        if let Some(tx) = active.kill_tx.take() {
                            let _ = tx.send(());
                        }
                        match timeout(KILL_WAIT, wait_exit(&mut exit_rx)).await {
                            Ok(Some(e)) => e,
                            _ => {
                                return Err(SupervisorError::StopFailure(format!(
                                    "process {:?} still alive after forced kill",
                                    active.pid
                                )))
                            }
                        }
                    }
                }
            }
        };

        let host = &self.config.server.llama_host;
        let port = self.config.server.llama_port;
        if !wait_port_released(host, port, self.settings.port_release_timeout).await {
            warn!(port, "port still bound after llama-server exit");
        }

        Ok(Terminated { forced, exit })
    }

    /// Probe result for `generation`. Only moves forward and only while the
    /// generation is current and still starting/loading.
    pub async fn apply_readiness(&self, generation: u64, readiness: Readiness) -> ProbeStep {
        let mut st = self.state.lock().await;
        if st.generation != generation || !matches!(st.phase, Phase::Starting | Phase::Loading) {
            debug!(generation, current = st.generation, phase = ?st.phase, "stale probe result dropped");
            return ProbeStep::Done;
        }
        match readiness {
            Readiness::Unreachable => ProbeStep::Continue,
            Readiness::Loading => {
                if st.phase == Phase::Starting {
                    st.transition(Phase::Loading);
                    self.note(generation, "llama-server is up, loading model");
                    info!(model = ?st.model_id, "model loading");
                }
                ProbeStep::Continue
            }
            Readiness::Ready => {
                st.transition(Phase::Ready);
                let took = st.started_instant.map(|t| t.elapsed()).unwrap_or_default();
                self.note(generation, format!("Model ready after {}s", took.as_secs()));
                info!(model = ?st.model_id, elapsed = ?took, "model ready");
                ProbeStep::Done
            }
        }
    }

    /// Readiness deadline passed: record the timeout, then tear the child
    /// down so a later start finds the port free.
    pub async fn expire_startup(&self, generation: u64, cancel: &CancellationToken) {
        let _op = tokio::select! {
            _ = cancel.cancelled() => return,
            g = self.ops.lock() => g,
        };

        let active = {
            let mut st = self.state.lock().await;
            if st.generation != generation || !matches!(st.phase, Phase::Starting | Phase::Loading) {
                return;
            }
            let err = SupervisorError::HealthTimeout(self.settings.health_timeout.as_secs());
            st.fail(err.to_string());
            self.note(generation, err.to_string());
            warn!(model = ?st.model_id, "{err}");
            st.active.take()
        };

        if let Some(a) = active {
            let outcome = self.terminate(a).await;
            let mut st = self.state.lock().await;
            if st.generation == generation {
                st.pid = None;
                match outcome {
                    Ok(t) => st.exit_code = t.exit.code,
                    Err(e) => {
                        error!("{e}");
                        st.last_error = Some(format!("{}; {e}", st.last_error.clone().unwrap_or_default()));
                    }
                }
            }
        }
    }
}

async fn wait_exit(rx: &mut watch::Receiver<Option<ExitInfo>>) -> Option<ExitInfo> {
    rx.wait_for(Option::is_some).await.ok().and_then(|v| (*v).clone())
}

#[cfg(unix)]
fn send_terminate(active: &ActiveProcess) {
    let Some(pid) = active.pid else { return };
    // SAFETY: plain kill(2) on a pid we spawned. The monitor publishes the
    // exit right after reaping, and the watch was still empty above.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        warn!(pid, "SIGTERM failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn send_terminate(active: &ActiveProcess) {
    // No SIGTERM equivalent for console processes; the kill path takes over
    // after the grace period.
    debug!(pid = ?active.pid, "no graceful terminate on this platform");
}

/// Owns the `Child` for its whole life: waits for it (reaping it), honours a
/// forced-kill request, publishes the exit, and flags unexpected exits.
#[allow(clippy::too_many_arguments)]
async fn monitor_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    drains: Vec<JoinHandle<()>>,
    state: Arc<Mutex<ServerState>>,
    logs: Arc<LogRing>,
    generation: u64,
    cancel: CancellationToken,
) {
    // a dropped handle also counts as a kill request
    let waited = tokio::select! {
        res = child.wait() => res,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!("kill failed: {e}");
            }
            child.wait().await
        }
    };

    let exit = match waited {
        Ok(status) => ExitInfo::from_status(&status),
        Err(e) => {
            error!("wait on llama-server failed: {e}");
            ExitInfo { code: None, signal: None }
        }
    };
    let _ = exit_tx.send(Some(exit.clone()));
    cancel.cancel();

    // let the pipes flush so the error detail carries the final lines
    for h in drains {
        let _ = timeout(DRAIN_FLUSH_WAIT, h).await;
    }

    let mut st = state.lock().await;
    if st.generation != generation || !st.phase.is_running() {
        debug!(generation, exit = %exit.describe(), "child exit observed by stop path");
        return;
    }

    let tail = logs.tail_text(EXIT_DETAIL_LINES);
    let mut detail = exit.describe();
    if !tail.is_empty() {
        detail.push_str("; last output: ");
        detail.push_str(&tail.join(" | "));
    }
    let err = SupervisorError::UnexpectedExit(detail);
    warn!(model = ?st.model_id, exit = %exit.describe(), "llama-server exited unexpectedly");
    st.exit_code = exit.code;
    st.fail(err.to_string());
    st.active = None;
    st.pid = None;
    logs.append(LogEntry::new(generation, LogSource::Supervisor, err.to_string()));
}

/// Feeds one pipe into the ring. Reads raw bytes so invalid UTF-8 never
/// stalls the child on a full pipe, and caps each read at `MAX_LINE_BYTES`
/// so a newline-free stream cannot grow the buffer without bound.
async fn drain_output<R>(reader: R, source: LogSource, generation: u64, logs: Arc<LogRing>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(512);
    loop {
        buf.clear();
        match (&mut reader).take(MAX_LINE_BYTES).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    logs.append(LogEntry::new(generation, source, line));
                }
            }
            Err(e) => {
                debug!(?source, "output drain ended: {e}");
                break;
            }
        }
    }
}

fn port_in_use(host: &str, port: u16) -> bool {
    std::net::TcpListener::bind((host, port)).is_err()
}

async fn wait_port_released(host: &str, port: u16, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if !port_in_use(host, port) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(100)).await;
    }
}
