//! The `start` pipeline: requirements, dependencies, tests, coverage,
//! validation, health check and dashboard launch, strictly in that order.
//!
//! Validation and health-check failures are downgraded to warnings so that a
//! half-configured integration never blocks local startup.

pub mod options;
pub mod requirements;

pub use options::{Mode, StartupOptions};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::checks::env_vars::EnvSnapshot;
use crate::checks::health::{HealthChecker, HealthStatus};
use crate::checks::validator::SetupValidator;
use crate::config::AppConfig;
use crate::monitor::MetricsCollector;
use crate::runtime::{ProcessEvent, ProcessEventKind, ProcessSupervisor, SpawnOptions};
use crate::terminal::browser::{open_url, BrowserOptions};
use crate::terminal::command::{run_command_in_dir, CommandLine};
use crate::terminal::port::{ensure_port_is_free, PortAllocator, PortSearch};

pub const DASHBOARD_PROCESS: &str = "dashboard";
pub const READY_MARKER: &str = "Dashboard listening";
const PORT_TAG: &str = "dashboard";
const DASHBOARD_MAX_RESTARTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepId {
    Requirements,
    Dependencies,
    Tests,
    Coverage,
    Validation,
    HealthCheck,
    Dashboard,
}

impl StepId {
    pub const ALL: [StepId; 7] = [
        StepId::Requirements,
        StepId::Dependencies,
        StepId::Tests,
        StepId::Coverage,
        StepId::Validation,
        StepId::HealthCheck,
        StepId::Dashboard,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StepId::Requirements => "Checking requirements",
            StepId::Dependencies => "Installing dependencies",
            StepId::Tests => "Running tests",
            StepId::Coverage => "Generating coverage report",
            StepId::Validation => "Validating configuration",
            StepId::HealthCheck => "Checking service health",
            StepId::Dashboard => "Starting dashboard",
        }
    }

    /// Validation and health failures only ever warn.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StepId::Validation | StepId::HealthCheck)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepUpdate {
    pub step: StepId,
    pub state: StepState,
    pub message: Option<String>,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: StepId,
    pub state: StepState,
    pub message: Option<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupSummary {
    pub success: bool,
    pub steps: Vec<StepRecord>,
    pub dashboard_url: Option<String>,
    pub failure: Option<String>,
    pub duration_ms: u64,
}

enum StepOutcome {
    Done { message: String, warnings: Vec<String> },
    Skipped(String),
}

impl StepOutcome {
    fn done(message: impl Into<String>) -> Self {
        StepOutcome::Done {
            message: message.into(),
            warnings: Vec::new(),
        }
    }
}

/// How to launch the dashboard child; `--port <p>` is appended.
#[derive(Debug, Clone)]
pub struct DashboardLaunch {
    pub program: String,
    pub args: Vec<String>,
}

impl DashboardLaunch {
    /// Re-invokes the running binary as `viralcast [--config <path>] dashboard`.
    pub fn current_exe(config_file: Option<&Path>) -> Result<Self> {
        let exe = std::env::current_exe().context("startup: cannot locate the viralcast executable")?;
        let mut args = Vec::new();
        if let Some(path) = config_file {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        args.push("dashboard".to_string());
        Ok(Self {
            program: exe.display().to_string(),
            args,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(&'static str),
    DashboardExited,
}

pub struct StartupSequencer {
    config: AppConfig,
    options: StartupOptions,
    supervisor: ProcessSupervisor,
    ports: Arc<PortAllocator>,
    dashboard: DashboardLaunch,
    env: Option<EnvSnapshot>,
    updates: Option<broadcast::Sender<StepUpdate>>,
}

impl StartupSequencer {
    pub fn new(
        config: AppConfig,
        options: StartupOptions,
        supervisor: ProcessSupervisor,
        ports: Arc<PortAllocator>,
        dashboard: DashboardLaunch,
    ) -> Self {
        Self {
            config,
            options: options.normalized(),
            supervisor,
            ports,
            dashboard,
            env: None,
            updates: None,
        }
    }

    /// Use a fixed environment instead of reading the process environment.
    pub fn with_env(mut self, env: EnvSnapshot) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_updates(mut self, updates: broadcast::Sender<StepUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn options(&self) -> &StartupOptions {
        &self.options
    }

    fn env(&self) -> EnvSnapshot {
        self.env.clone().unwrap_or_else(EnvSnapshot::from_process)
    }

    fn publish(&self, step: StepId, state: StepState, message: Option<String>, warnings: Vec<String>) {
        if let Some(tx) = &self.updates {
            let _ = tx.send(StepUpdate {
                step,
                state,
                message,
                warnings,
                timestamp: Utc::now(),
            });
        }
    }

    /// Runs every step in order. A fatal failure stops the pipeline and
    /// cleans up; the summary reports it rather than an `Err`.
    pub async fn run(&self) -> StartupSummary {
        let started = Instant::now();
        let mut records: Vec<StepRecord> = StepId::ALL
            .iter()
            .map(|step| StepRecord {
                step: *step,
                state: StepState::Pending,
                message: None,
                warnings: Vec::new(),
                duration_ms: 0,
            })
            .collect();
        let mut dashboard_url = None;
        let mut failure = None;

        tracing::info!(
            target: "viralcast::startup",
            mode = %self.options.mode,
            port = self.options.port,
            quick = self.options.quick,
            "Starting viralcast"
        );

        for record in records.iter_mut() {
            let step = record.step;
            let step_started = Instant::now();
            record.state = StepState::Running;
            self.publish(step, StepState::Running, None, Vec::new());
            tracing::info!(target: "viralcast::startup", step = ?step, "{}...", step.label());

            let result = match step {
                StepId::Requirements => self.requirements_step().await,
                StepId::Dependencies => self.dependencies_step().await,
                StepId::Tests => self.tests_step().await,
                StepId::Coverage => self.coverage_step().await,
                StepId::Validation => Ok(self.validation_step().await),
                StepId::HealthCheck => Ok(self.health_step().await),
                StepId::Dashboard => self.dashboard_step().await.map(|(outcome, url)| {
                    dashboard_url = Some(url);
                    outcome
                }),
            };
            record.duration_ms = step_started.elapsed().as_millis() as u64;

            match result {
                Ok(StepOutcome::Done { message, warnings }) => {
                    for warning in &warnings {
                        tracing::warn!(target: "viralcast::startup", step = ?step, "{}", warning);
                    }
                    tracing::info!(target: "viralcast::startup", step = ?step, duration_ms = record.duration_ms, "{}", message);
                    record.state = StepState::Succeeded;
                    record.message = Some(message);
                    record.warnings = warnings;
                }
                Ok(StepOutcome::Skipped(reason)) => {
                    tracing::info!(target: "viralcast::startup", step = ?step, "Skipped: {}", reason);
                    record.state = StepState::Skipped;
                    record.message = Some(reason);
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    tracing::error!(target: "viralcast::startup", step = ?step, error = %message, "{} failed", step.label());
                    record.state = StepState::Failed;
                    record.message = Some(message.clone());
                    failure = Some(format!("{}: {}", step.label(), message));
                }
            }
            self.publish(step, record.state, record.message.clone(), record.warnings.clone());

            if record.state == StepState::Failed && step.is_fatal() {
                break;
            }
        }

        let success = failure.is_none();
        if !success {
            self.cleanup().await;
        }

        StartupSummary {
            success,
            steps: records,
            dashboard_url: if success { dashboard_url } else { None },
            failure,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn requirements_step(&self) -> Result<StepOutcome> {
        let (message, warnings) = requirements::check_requirements(&self.config).await?;
        Ok(StepOutcome::Done { message, warnings })
    }

    async fn dependencies_step(&self) -> Result<StepOutcome> {
        let cache = self.config.resolve(&self.config.commands.dependency_cache);
        if cache.exists() && self.options.mode != Mode::Production {
            return Ok(StepOutcome::Skipped(format!(
                "{} present",
                self.config.commands.dependency_cache.display()
            )));
        }
        let command = CommandLine::parse(&self.config.commands.install)?;
        let lines = run_command_in_dir(&self.config.project_dir, &command, "dependency installation").await?;
        Ok(StepOutcome::done(format!("{} finished ({} output lines)", command.display(), lines)))
    }

    async fn tests_step(&self) -> Result<StepOutcome> {
        if self.options.skips_tests() {
            return Ok(StepOutcome::Skipped("tests disabled".into()));
        }
        let command = CommandLine::parse(&self.config.commands.test)?;
        run_command_in_dir(&self.config.project_dir, &command, "test suite").await?;
        Ok(StepOutcome::done("tests passed"))
    }

    async fn coverage_step(&self) -> Result<StepOutcome> {
        if self.options.skips_coverage() {
            let reason = if self.options.mode == Mode::Production {
                "production mode"
            } else {
                "tests disabled"
            };
            return Ok(StepOutcome::Skipped(reason.into()));
        }
        let command = CommandLine::parse(&self.config.commands.coverage)?;
        run_command_in_dir(&self.config.project_dir, &command, "coverage report").await?;
        Ok(StepOutcome::done("coverage report generated"))
    }

    async fn validation_step(&self) -> StepOutcome {
        if self.options.skip_validation {
            return StepOutcome::Skipped("validation disabled".into());
        }
        let validator = match SetupValidator::new(self.config.clone(), self.env()) {
            Ok(v) => v,
            Err(e) => {
                return StepOutcome::Done {
                    message: "validation could not run".into(),
                    warnings: vec![format!("{:#}", e)],
                }
            }
        };
        let report = validator.run().await;
        if report.is_success() {
            StepOutcome::done(format!("all {} checks passed", report.passed))
        } else {
            StepOutcome::Done {
                message: format!(
                    "{} of {} checks failed, continuing",
                    report.failed,
                    report.checks.len()
                ),
                warnings: report
                    .failures()
                    .map(|f| format!("{}: {}", f.check, f.message))
                    .collect(),
            }
        }
    }

    async fn health_step(&self) -> StepOutcome {
        if self.options.skip_health_check {
            return StepOutcome::Skipped("health check disabled".into());
        }
        let checker = match HealthChecker::new(self.config.clone(), self.env()) {
            Ok(c) => c.with_metrics(Arc::new(MetricsCollector::new(self.config.project_dir.clone()))),
            Err(e) => {
                return StepOutcome::Done {
                    message: "health check could not run".into(),
                    warnings: vec![format!("{:#}", e)],
                }
            }
        };

        let report = checker.check().await;
        let mut warnings: Vec<String> = report
            .errors
            .iter()
            .chain(report.warnings.iter())
            .map(|issue| format!("{}: {}", issue.source, issue.message))
            .collect();
        if let Err(e) = checker.persist(&report) {
            warnings.push(format!("report not saved: {:#}", e));
        }

        let message = match report.status {
            HealthStatus::Healthy => "all services healthy".to_string(),
            other => format!("status {:?}, continuing", other).to_lowercase(),
        };
        StepOutcome::Done { message, warnings }
    }

    async fn dashboard_step(&self) -> Result<(StepOutcome, String)> {
        let mut warnings = Vec::new();

        if self.options.reclaim_port {
            if let Err(e) = ensure_port_is_free(self.options.port, "dashboard").await {
                warnings.push(format!("could not reclaim port {}: {:#}", self.options.port, e));
            }
        }

        let allocation = self
            .ports
            .claim(self.options.port, &PortSearch::new(), PORT_TAG)
            .await?;
        if !allocation.is_preferred {
            warnings.push(allocation.message.clone());
        }
        let port = allocation.port;

        let events = self.supervisor.subscribe();
        let mut args = self.dashboard.args.clone();
        args.push("--port".to_string());
        args.push(port.to_string());

        let options = SpawnOptions {
            cwd: Some(self.config.project_dir.clone()),
            max_restarts: DASHBOARD_MAX_RESTARTS,
            ..Default::default()
        };
        self.supervisor
            .spawn_process(DASHBOARD_PROCESS, &self.dashboard.program, &args, options)
            .await?;

        let limit = Duration::from_secs(self.config.dashboard.readiness_timeout_secs);
        wait_for_dashboard(events, limit).await?;

        let url = format!("http://localhost:{}", port);
        if self.options.open_browser {
            if let Err(e) = open_url(&url, &BrowserOptions::default()).await {
                warnings.push(format!("could not open browser: {:#}", e));
            }
        }

        Ok((
            StepOutcome::Done {
                message: format!("dashboard running at {}", url),
                warnings,
            },
            url,
        ))
    }

    /// Stops every managed process and drops port reservations.
    pub async fn cleanup(&self) {
        self.supervisor.shutdown().await;
        self.ports.release_all();
    }

    /// Blocks until SIGINT, SIGTERM or SIGQUIT arrives, or the dashboard
    /// dies for good, then cleans up.
    pub async fn serve_until_shutdown(&self, signals: &mut ShutdownSignals) -> Result<ShutdownReason> {
        let reason = wait_for_shutdown(&self.supervisor, signals).await?;
        match reason {
            ShutdownReason::Signal(name) => {
                tracing::info!(target: "viralcast::startup", signal = name, "Received signal, shutting down")
            }
            ShutdownReason::DashboardExited => {
                tracing::error!(target: "viralcast::startup", "Dashboard exited permanently, shutting down")
            }
        }
        self.cleanup().await;
        Ok(reason)
    }
}

fn is_address_in_use(line: &str) -> bool {
    line.contains("EADDRINUSE") || line.contains("Address already in use")
}

/// Waits for the dashboard's readiness line on the supervisor event stream.
pub async fn wait_for_dashboard(mut events: broadcast::Receiver<ProcessEvent>, limit: Duration) -> Result<()> {
    let watch = async move {
        loop {
            match events.recv().await {
                Ok(ProcessEvent { name, kind }) if name == DASHBOARD_PROCESS => match kind {
                    ProcessEventKind::Stdout { line } if line.contains(READY_MARKER) => return Ok(()),
                    ProcessEventKind::Stdout { line } | ProcessEventKind::Stderr { line }
                        if is_address_in_use(&line) =>
                    {
                        bail!("dashboard port is already in use: {}", line.trim())
                    }
                    ProcessEventKind::Error { message } => bail!("dashboard failed to spawn: {}", message),
                    ProcessEventKind::Terminated { code, signal, restarts } => bail!(
                        "dashboard exited before becoming ready (code {:?}, signal {:?}, {} restarts)",
                        code,
                        signal,
                        restarts
                    ),
                    _ => {}
                },
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "viralcast::startup", skipped, "Readiness watcher lagged behind process events");
                }
                Err(RecvError::Closed) => bail!("process event stream closed"),
            }
        }
    };

    tokio::time::timeout(limit, watch)
        .await
        .map_err(|_| anyhow!("dashboard did not become ready within {}s", limit.as_secs()))?
}

/// SIGINT, SIGTERM and SIGQUIT listeners. A signal that arrives while nobody
/// is awaiting `recv` is kept until the next call.
pub struct ShutdownSignals {
    sigint: Signal,
    sigterm: Signal,
    sigquit: Signal,
}

impl ShutdownSignals {
    pub fn install() -> Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt()).context("startup: failed to install SIGINT handler")?,
            sigterm: signal(SignalKind::terminate()).context("startup: failed to install SIGTERM handler")?,
            sigquit: signal(SignalKind::quit()).context("startup: failed to install SIGQUIT handler")?,
        })
    }

    /// Resolves with the name of the next signal received.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigquit.recv() => "SIGQUIT",
        }
    }
}

/// Resolves with the name of the first SIGINT, SIGTERM or SIGQUIT received.
pub async fn wait_for_signal() -> Result<&'static str> {
    let mut signals = ShutdownSignals::install()?;
    Ok(signals.recv().await)
}

pub async fn wait_for_shutdown(
    supervisor: &ProcessSupervisor,
    signals: &mut ShutdownSignals,
) -> Result<ShutdownReason> {
    let mut events = supervisor.subscribe();
    let dashboard_gone = async move {
        loop {
            match events.recv().await {
                Ok(ProcessEvent {
                    name,
                    kind: ProcessEventKind::Terminated { .. },
                }) if name == DASHBOARD_PROCESS => return,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    };

    tokio::select! {
        signal = signals.recv() => Ok(ShutdownReason::Signal(signal)),
        _ = dashboard_gone => Ok(ShutdownReason::DashboardExited),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::services::tests::test_env;
    use crate::config::ServicesConfig;
    use tempfile::tempdir;

    fn project(dir: &Path) -> AppConfig {
        std::fs::write(dir.join(".env.example"), "VIRALCAST_STARTUP_TEST=1\n").unwrap();
        let mut config = AppConfig {
            project_dir: dir.to_path_buf(),
            services: ServicesConfig {
                openai_base_url: "http://127.0.0.1:1".into(),
                airtable_base_url: "http://127.0.0.1:1".into(),
                apify_base_url: "http://127.0.0.1:1".into(),
                n8n_base_url: "http://127.0.0.1:1".into(),
                timeout_secs: 2,
            },
            ..AppConfig::default()
        };
        config.requirements.runtime_version_command = "echo v20.11.1".into();
        config.requirements.min_free_memory_mb = 0;
        config.commands.install = "true".into();
        config.commands.test = "true".into();
        config.commands.coverage = "true".into();
        config.dashboard.readiness_timeout_secs = 10;
        config
    }

    fn shell_dashboard(script: &str) -> DashboardLaunch {
        DashboardLaunch {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    fn state_of(summary: &StartupSummary, step: StepId) -> StepState {
        summary.steps.iter().find(|r| r.step == step).unwrap().state
    }

    #[tokio::test]
    async fn full_pipeline_downgrades_check_failures() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = tempdir().unwrap();
        let supervisor = ProcessSupervisor::new();
        let ports = Arc::new(PortAllocator::new());
        let (tx, mut rx) = broadcast::channel(64);

        let sequencer = StartupSequencer::new(
            project(dir.path()),
            StartupOptions {
                open_browser: false,
                port: 47410,
                ..Default::default()
            },
            supervisor.clone(),
            ports.clone(),
            shell_dashboard("echo 'Dashboard listening on test'; exec sleep 30"),
        )
        .with_env(test_env())
        .with_updates(tx);

        let summary = sequencer.run().await;
        assert!(summary.success, "{:?}", summary.failure);
        for step in StepId::ALL {
            assert_eq!(state_of(&summary, step), StepState::Succeeded, "{:?}", step);
        }
        // No config files in the temp project, so validation only warns.
        let validation = summary.steps.iter().find(|r| r.step == StepId::Validation).unwrap();
        assert!(!validation.warnings.is_empty());
        assert!(dir.path().join(".env").exists());
        assert!(summary.dashboard_url.as_deref().unwrap().starts_with("http://localhost:"));
        assert!(supervisor.contains(DASHBOARD_PROCESS));
        assert_eq!(ports.reservations().len(), 1);

        let first = rx.recv().await.unwrap();
        assert_eq!((first.step, first.state), (StepId::Requirements, StepState::Running));

        sequencer.cleanup().await;
        assert!(supervisor.list().is_empty());
        assert!(ports.reservations().is_empty());
    }

    #[tokio::test]
    async fn dashboard_that_dies_fails_the_run() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = tempdir().unwrap();
        let supervisor = ProcessSupervisor::new();
        let ports = Arc::new(PortAllocator::new());

        let sequencer = StartupSequencer::new(
            project(dir.path()),
            StartupOptions {
                open_browser: false,
                quick: true,
                port: 47420,
                ..Default::default()
            },
            supervisor.clone(),
            ports.clone(),
            shell_dashboard("echo 'Error: Address already in use' >&2; exec sleep 5"),
        )
        .with_env(test_env());

        let summary = sequencer.run().await;
        assert!(!summary.success);
        assert_eq!(state_of(&summary, StepId::Tests), StepState::Skipped);
        assert_eq!(state_of(&summary, StepId::Validation), StepState::Skipped);
        assert_eq!(state_of(&summary, StepId::Dashboard), StepState::Failed);
        assert!(summary.failure.unwrap().contains("already in use"));
        assert!(supervisor.list().is_empty());
        assert!(ports.reservations().is_empty());
    }

    #[tokio::test]
    async fn signal_raised_before_waiting_is_kept() {
        let mut signals = ShutdownSignals::install().unwrap();
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGQUIT).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let name = tokio::time::timeout(Duration::from_secs(2), signals.recv()).await.unwrap();
        assert_eq!(name, "SIGQUIT");
    }

    #[tokio::test]
    async fn missing_runtime_stops_before_anything_else() {
        let dir = tempdir().unwrap();
        let mut config = project(dir.path());
        config.requirements.runtime_version_command = "viralcast-no-such-runtime --version".into();
        let sequencer = StartupSequencer::new(
            config,
            StartupOptions::default(),
            ProcessSupervisor::new(),
            Arc::new(PortAllocator::new()),
            shell_dashboard("exit 0"),
        );

        let summary = sequencer.run().await;
        assert!(!summary.success);
        assert_eq!(state_of(&summary, StepId::Requirements), StepState::Failed);
        assert_eq!(state_of(&summary, StepId::Dependencies), StepState::Pending);
    }
}
