//! Named child-process supervision: spawn, stream output, restart on failure,
//! and bounded graceful shutdown.
//!
//! All events travel over one bounded broadcast channel. Events for a single
//! process arrive in the order they happened: the monitor task only emits
//! `Exited` after both output readers have drained. There is no ordering
//! across processes, and a receiver that falls behind sees `Lagged` and loses
//! the skipped events.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures::future::join_all;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing;

use super::log::LogLevel;

/// A process that survives this long after spawn counts as running.
pub const RUNNING_THRESHOLD: Duration = Duration::from_secs(1);
/// Delay between a polite signal and the forced SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(5);
/// How long `shutdown` waits for each process before forcing it.
pub const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);
const EVENT_CAPACITY: usize = 1024;
const READER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("a process named '{0}' is already registered")]
    DuplicateProcessName(String),
    #[error("process '{name}' failed to start: {reason}")]
    StartupTimeout { name: String, reason: String },
    #[error("no process named '{0}' is registered")]
    NotFound(String),
    #[error("failed to send {signal} to process '{name}': {source}")]
    Signal {
        name: String,
        signal: Signal,
        #[source]
        source: Errno,
    },
    #[error("the supervisor is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
    Exited,
    Error,
}

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Pipe stdout/stderr and publish each line as an event. Otherwise inherit.
    pub capture_output: bool,
    pub max_restarts: u32,
    pub restart_delay: Duration,
    /// Wait for the process to reach `running` before returning.
    pub start_timeout: Option<Duration>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: Vec::new(),
            capture_output: true,
            max_restarts: 3,
            restart_delay: Duration::from_secs(1),
            start_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub registered_at: DateTime<Utc>,
}

impl ProcessInfo {
    fn starting(name: &str, command: &str, args: &[String], max_restarts: u32) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
            pid: None,
            status: ProcessStatus::Starting,
            restart_count: 0,
            max_restarts,
            exit_code: None,
            exit_signal: None,
            registered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEventKind {
    Spawned { pid: u32, attempt: u32 },
    Running { pid: u32 },
    Stdout { line: String },
    Stderr { line: String },
    Exited { code: Option<i32>, signal: Option<i32> },
    Restarting { attempt: u32, delay_ms: u64 },
    Error { message: String },
    /// Final event for a registration; emitted exactly once.
    Terminated {
        code: Option<i32>,
        signal: Option<i32>,
        restarts: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessEvent {
    pub name: String,
    #[serde(flatten)]
    pub kind: ProcessEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub restarts: u32,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Returned by `spawn_process`. Holds no ownership of the child.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub name: String,
    /// Pid of the first attempt; `None` if the OS refused the spawn.
    pub pid: Option<u32>,
    done: watch::Receiver<Option<ProcessOutcome>>,
}

impl ProcessHandle {
    /// Resolves once the registration ends, after any restarts.
    pub async fn wait(&mut self) -> Option<ProcessOutcome> {
        self.done.wait_for(Option::is_some).await.ok().and_then(|r| *r)
    }
}

struct Registration {
    info: ProcessInfo,
    done: watch::Receiver<Option<ProcessOutcome>>,
}

struct Inner {
    registry: DashMap<String, Registration>,
    events: broadcast::Sender<ProcessEvent>,
    shutting_down: AtomicBool,
}

impl Inner {
    fn emit(&self, name: &str, kind: ProcessEventKind) {
        let _ = self.events.send(ProcessEvent {
            name: name.to_string(),
            kind,
        });
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut ProcessInfo)) {
        if let Some(mut reg) = self.registry.get_mut(name) {
            f(&mut reg.info);
        }
    }

    fn status(&self, name: &str) -> Option<ProcessStatus> {
        self.registry.get(name).map(|r| r.info.status)
    }

    fn pid(&self, name: &str) -> Option<u32> {
        self.registry.get(name).and_then(|r| r.info.pid)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct LaunchSpec {
    name: String,
    command: String,
    args: Vec<String>,
    options: SpawnOptions,
}

struct AttemptExit {
    code: Option<i32>,
    signal: Option<i32>,
}

/// Owns the registry of managed children. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                registry: DashMap::new(),
                events,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut out: Vec<_> = self.inner.registry.iter().map(|r| r.info.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get(&self, name: &str) -> Option<ProcessInfo> {
        self.inner.registry.get(name).map(|r| r.info.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.registry.contains_key(name)
    }

    /// Registers and spawns `command`. Resolves once the OS has accepted or
    /// refused the first spawn; refusals arrive as `Error` events. With
    /// `start_timeout` set, also waits for the process to reach `running`.
    pub async fn spawn_process(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<ProcessHandle, SupervisorError> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }

        let (done_tx, done_rx) = watch::channel(None);
        match self.inner.registry.entry(name.to_string()) {
            MapEntry::Occupied(_) => {
                return Err(SupervisorError::DuplicateProcessName(name.to_string()));
            }
            MapEntry::Vacant(slot) => {
                slot.insert(Registration {
                    info: ProcessInfo::starting(name, command, args, options.max_restarts),
                    done: done_rx.clone(),
                });
            }
        }

        tracing::info!(
            target: "viralcast::runtime::supervisor",
            name,
            command,
            args = ?args,
            max_restarts = options.max_restarts,
            "Spawning managed process"
        );

        let start_timeout = options.start_timeout;
        let (spawned_tx, spawned_rx) = oneshot::channel();
        let (running_tx, running_rx) = oneshot::channel();
        let spec = LaunchSpec {
            name: name.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
            options,
        };
        tokio::spawn(supervise(self.inner.clone(), spec, done_tx, spawned_tx, running_tx));

        let pid = spawned_rx.await.unwrap_or(None);

        if let Some(limit) = start_timeout {
            let reason = match timeout(limit, running_rx).await {
                Ok(Ok(true)) => None,
                Ok(_) => Some("exited before it was considered running".to_string()),
                Err(_) => Some(format!("not running after {:?}", limit)),
            };
            if let Some(reason) = reason {
                self.abandon(name, done_rx).await;
                return Err(SupervisorError::StartupTimeout {
                    name: name.to_string(),
                    reason,
                });
            }
        }

        Ok(ProcessHandle {
            name: name.to_string(),
            pid,
            done: done_rx,
        })
    }

    /// Stops a registration whose start failed and waits for it to leave the
    /// registry, so no restart outlives the error returned to the caller.
    async fn abandon(&self, name: &str, mut done: watch::Receiver<Option<ProcessOutcome>>) {
        match self.kill_process(name, Signal::SIGTERM) {
            Ok(()) | Err(SupervisorError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(target: "viralcast::runtime::supervisor", name, error = %e, "Could not stop process after failed start")
            }
        }
        let limit = KILL_GRACE + READER_DRAIN + Duration::from_secs(1);
        if timeout(limit, done.wait_for(Option::is_some)).await.is_err() {
            tracing::warn!(target: "viralcast::runtime::supervisor", name, "Process still registered after failed start");
        }
    }

    /// Signals a process and marks it as stopping so it is not restarted.
    /// Anything but SIGKILL is followed by SIGKILL after `KILL_GRACE` if the
    /// same pid is still registered.
    pub fn kill_process(&self, name: &str, sig: Signal) -> Result<(), SupervisorError> {
        let pid = {
            let mut reg = self
                .inner
                .registry
                .get_mut(name)
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
            reg.info.status = ProcessStatus::Stopping;
            reg.info.pid
        };

        let Some(pid) = pid else {
            tracing::debug!(target: "viralcast::runtime::supervisor", name, "No live pid; marked stopping.");
            return Ok(());
        };

        tracing::info!(target: "viralcast::runtime::supervisor", name, pid, signal = %sig, "Signalling process");
        send_signal(name, pid, sig)?;

        if sig != Signal::SIGKILL {
            let inner = self.inner.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                sleep(KILL_GRACE).await;
                if inner.pid(&name) == Some(pid) {
                    tracing::warn!(target: "viralcast::runtime::supervisor", name = %name, pid, "Grace period elapsed, sending SIGKILL");
                    if let Err(e) = send_signal(&name, pid, Signal::SIGKILL) {
                        tracing::warn!(target: "viralcast::runtime::supervisor", name = %name, error = %e, "Forced kill failed");
                    }
                }
            });
        }
        Ok(())
    }

    /// Stops every registered process in parallel and empties the registry.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let targets: Vec<(String, watch::Receiver<Option<ProcessOutcome>>)> = self
            .inner
            .registry
            .iter()
            .map(|r| (r.key().clone(), r.done.clone()))
            .collect();

        if targets.is_empty() {
            return;
        }
        tracing::info!(target: "viralcast::runtime::supervisor", count = targets.len(), "Shutting down managed processes");

        let stops = targets.into_iter().map(|(name, mut done)| {
            let this = self.clone();
            async move {
                if let Err(e) = this.kill_process(&name, Signal::SIGTERM) {
                    tracing::debug!(target: "viralcast::runtime::supervisor", name = %name, error = %e, "SIGTERM not delivered");
                }
                let exited = timeout(SHUTDOWN_WAIT, done.wait_for(Option::is_some)).await.is_ok();
                if !exited {
                    tracing::warn!(target: "viralcast::runtime::supervisor", name = %name, "Process ignored SIGTERM, forcing");
                    if let Some(pid) = this.inner.pid(&name) {
                        let _ = send_signal(&name, pid, Signal::SIGKILL);
                    }
                    let _ = timeout(Duration::from_secs(2), done.wait_for(Option::is_some))
                        .await
                        .is_ok();
                }
            }
        });
        join_all(stops).await;

        self.inner.registry.clear();
        tracing::info!(target: "viralcast::runtime::supervisor", "All managed processes stopped");
    }
}

fn send_signal(name: &str, pid: u32, sig: Signal) -> Result<(), SupervisorError> {
    let raw = i32::try_from(pid).unwrap_or(i32::MAX);
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(SupervisorError::Signal {
            name: name.to_string(),
            signal: sig,
            source,
        }),
    }
}

fn forward_lines<R>(inner: Arc<Inner>, name: String, reader: R, stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stderr {
                // Plenty of tools log routine progress to stderr.
                match LogLevel::detect(&line) {
                    Some(LogLevel::Error) => {
                        tracing::error!(target: "viralcast::runtime::supervisor::stderr", process = %name, "{}", line)
                    }
                    Some(LogLevel::Warn) => {
                        tracing::warn!(target: "viralcast::runtime::supervisor::stderr", process = %name, "{}", line)
                    }
                    _ => tracing::info!(target: "viralcast::runtime::supervisor::stderr", process = %name, "{}", line),
                }
                inner.emit(&name, ProcessEventKind::Stderr { line });
            } else {
                tracing::info!(target: "viralcast::runtime::supervisor::stdout", process = %name, "{}", line);
                inner.emit(&name, ProcessEventKind::Stdout { line });
            }
        }
    })
}

async fn run_attempt(
    inner: &Arc<Inner>,
    spec: &LaunchSpec,
    attempt: u32,
    spawned_tx: &mut Option<oneshot::Sender<Option<u32>>>,
    running_tx: &mut Option<oneshot::Sender<bool>>,
) -> AttemptExit {
    let name = spec.name.as_str();
    if inner.is_shutting_down() || inner.status(name) == Some(ProcessStatus::Stopping) {
        tracing::debug!(target: "viralcast::runtime::supervisor", name, attempt, "Stopped before respawn");
        if let Some(tx) = spawned_tx.take() {
            let _ = tx.send(None);
        }
        if let Some(tx) = running_tx.take() {
            let _ = tx.send(false);
        }
        return AttemptExit {
            code: None,
            signal: None,
        };
    }

    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args);
    cmd.envs(spec.options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    cmd.stdin(Stdio::null());
    if let Some(cwd) = &spec.options.cwd {
        cmd.current_dir(cwd);
    }
    if spec.options.capture_output {
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(target: "viralcast::runtime::supervisor", name, command = %spec.command, error = %e, "Spawn failed");
            inner.update(name, |info| {
                info.status = ProcessStatus::Error;
                info.pid = None;
            });
            inner.emit(
                name,
                ProcessEventKind::Error {
                    message: format!("failed to spawn '{}': {}", spec.command, e),
                },
            );
            if let Some(tx) = spawned_tx.take() {
                let _ = tx.send(None);
            }
            if let Some(tx) = running_tx.take() {
                let _ = tx.send(false);
            }
            return AttemptExit {
                code: None,
                signal: None,
            };
        }
    };

    let pid = child.id();
    let mut stopping = false;
    inner.update(name, |info| {
        info.pid = pid;
        stopping = info.status == ProcessStatus::Stopping;
    });
    if let Some(pid) = pid {
        inner.emit(name, ProcessEventKind::Spawned { pid, attempt });
        // kill_process ran between the check above and the pid landing.
        if stopping || inner.is_shutting_down() {
            if let Err(e) = send_signal(name, pid, Signal::SIGTERM) {
                tracing::warn!(target: "viralcast::runtime::supervisor", name, error = %e, "Could not stop late spawn");
            }
        }
    }
    if let Some(tx) = spawned_tx.take() {
        let _ = tx.send(pid);
    }

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward_lines(inner.clone(), spec.name.clone(), stdout, false));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward_lines(inner.clone(), spec.name.clone(), stderr, true));
    }

    let waited = tokio::select! {
        status = child.wait() => status,
        _ = sleep(RUNNING_THRESHOLD) => {
            inner.update(name, |info| {
                if info.status == ProcessStatus::Starting {
                    info.status = ProcessStatus::Running;
                }
            });
            if let Some(pid) = pid {
                inner.emit(name, ProcessEventKind::Running { pid });
            }
            if let Some(tx) = running_tx.take() {
                let _ = tx.send(true);
            }
            child.wait().await
        }
    };

    // Grandchildren can keep the pipes open after the child is gone.
    for mut reader in readers {
        if timeout(READER_DRAIN, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    if let Some(tx) = running_tx.take() {
        let _ = tx.send(false);
    }

    let (code, sig) = match waited {
        Ok(status) => (status.code(), status.signal()),
        Err(e) => {
            inner.emit(
                name,
                ProcessEventKind::Error {
                    message: format!("failed to wait for process: {}", e),
                },
            );
            (None, None)
        }
    };

    inner.update(name, |info| {
        if info.status != ProcessStatus::Stopping {
            info.status = ProcessStatus::Exited;
        }
        info.pid = None;
        info.exit_code = code;
        info.exit_signal = sig;
    });
    tracing::info!(target: "viralcast::runtime::supervisor", name, ?code, signal = ?sig, attempt, "Process exited");
    inner.emit(name, ProcessEventKind::Exited { code, signal: sig });

    AttemptExit { code, signal: sig }
}

async fn supervise(
    inner: Arc<Inner>,
    spec: LaunchSpec,
    done_tx: watch::Sender<Option<ProcessOutcome>>,
    spawned_tx: oneshot::Sender<Option<u32>>,
    running_tx: oneshot::Sender<bool>,
) {
    let name = spec.name.clone();
    let mut spawned_tx = Some(spawned_tx);
    let mut running_tx = Some(running_tx);
    let mut restarts = 0u32;

    let outcome = loop {
        let exit = run_attempt(&inner, &spec, restarts + 1, &mut spawned_tx, &mut running_tx).await;

        let stopped = inner.status(&name) == Some(ProcessStatus::Stopping);
        let give_up = exit.code == Some(0)
            || stopped
            || inner.is_shutting_down()
            || restarts >= spec.options.max_restarts;

        if give_up {
            break ProcessOutcome {
                code: exit.code,
                signal: exit.signal,
                restarts,
            };
        }

        restarts += 1;
        let delay = spec.options.restart_delay;
        inner.update(&name, |info| info.restart_count = restarts);
        tracing::warn!(
            target: "viralcast::runtime::supervisor",
            name = %name,
            attempt = restarts,
            max_restarts = spec.options.max_restarts,
            delay_ms = delay.as_millis() as u64,
            "Restarting process after failure"
        );
        inner.emit(
            &name,
            ProcessEventKind::Restarting {
                attempt: restarts,
                delay_ms: delay.as_millis() as u64,
            },
        );
        sleep(delay).await;

        if inner.is_shutting_down() || inner.status(&name) == Some(ProcessStatus::Stopping) {
            break ProcessOutcome {
                code: exit.code,
                signal: exit.signal,
                restarts,
            };
        }
        inner.update(&name, |info| {
            if info.status != ProcessStatus::Stopping {
                info.status = ProcessStatus::Starting;
            }
        });
    };

    inner.registry.remove(&name);
    inner.emit(
        &name,
        ProcessEventKind::Terminated {
            code: outcome.code,
            signal: outcome.signal,
            restarts: outcome.restarts,
        },
    );
    let _ = done_tx.send(Some(outcome));
}
