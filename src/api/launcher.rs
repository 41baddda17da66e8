//! GUI launcher: start and stop `viralcast start` from a browser and watch
//! its output live.

use anyhow::Result;
use chrono::Utc;
use nix::sys::signal::Signal;
use poem::endpoint::StaticFilesEndpoint;
use poem::web::websocket::WebSocket;
use poem::web::Data;
use poem::{get, handler, Endpoint, EndpointExt, IntoResponse, Route};
use poem_openapi::param::Query;
use poem_openapi::payload::{Json, PlainText};
use poem_openapi::types::Any;
use poem_openapi::{ApiResponse, OpenApi, OpenApiService};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing;

use super::models::{ActionResponse, LogLine, LogsResponse};
use super::{bind, cors, pump_socket, shutdown_signal};
use crate::config::AppConfig;
use crate::runtime::log::{LogEntry, LogFilterOptions, LogLevel, LogStore};
use crate::runtime::{ProcessEvent, ProcessEventKind, ProcessStatus, ProcessSupervisor, SpawnOptions, SupervisorError};
use crate::startup::StartupOptions;
use crate::terminal::browser::{open_url, BrowserOptions};

pub const STARTUP_PROCESS: &str = "startup";
const EVENT_CAPACITY: usize = 256;
const DEFAULT_LOG_LIMIT: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LauncherStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub status: Option<ProcessStatus>,
    pub options: Option<StartupOptions>,
    pub last_exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum LauncherEvent {
    Log(LogEntry),
    Status(LauncherStatus),
}

/// The program and leading arguments used to run `viralcast`.
#[derive(Debug, Clone)]
pub struct StartupCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl StartupCommand {
    pub fn current_exe(config_file: Option<&std::path::Path>) -> Result<Self> {
        let launch = crate::startup::DashboardLaunch::current_exe(config_file)?;
        // Drop the trailing `dashboard` subcommand; options supply `start`.
        let mut args = launch.args;
        args.pop();
        Ok(Self {
            program: launch.program,
            args,
        })
    }
}

pub struct LauncherState {
    config: AppConfig,
    supervisor: ProcessSupervisor,
    command: StartupCommand,
    logs: LogStore,
    options: Mutex<Option<StartupOptions>>,
    last_exit_code: Mutex<Option<i32>>,
    events: broadcast::Sender<LauncherEvent>,
}

impl LauncherState {
    pub fn new(config: AppConfig, supervisor: ProcessSupervisor, command: StartupCommand) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            logs: LogStore::with_capacity(config.dashboard.log_capacity()),
            config,
            supervisor,
            command,
            options: Mutex::new(None),
            last_exit_code: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LauncherEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> LauncherStatus {
        let info = self.supervisor.get(STARTUP_PROCESS);
        LauncherStatus {
            running: info.is_some(),
            pid: info.as_ref().and_then(|i| i.pid),
            status: info.as_ref().map(|i| i.status),
            options: self.options.lock().unwrap_or_else(|p| p.into_inner()).clone(),
            last_exit_code: *self.last_exit_code.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }

    fn publish_status(&self) {
        let _ = self.events.send(LauncherEvent::Status(self.status()));
    }

    fn record_line(&self, level: LogLevel, line: String) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            target: STARTUP_PROCESS.to_string(),
            message: line,
        };
        self.logs.push(entry.clone());
        let _ = self.events.send(LauncherEvent::Log(entry));
    }

    pub fn recent_logs(&self, limit: usize) -> Vec<LogEntry> {
        self.logs.query(&LogFilterOptions {
            max_entries: Some(limit),
            ..Default::default()
        })
    }

    /// Spawns `viralcast start --no-browser ...` under the supervisor.
    pub async fn start(&self, options: StartupOptions) -> Result<LauncherStatus, SupervisorError> {
        let mut args = self.command.args.clone();
        args.extend(options.to_cli_args());

        let spawn = SpawnOptions {
            cwd: Some(self.config.project_dir.clone()),
            max_restarts: 0,
            ..Default::default()
        };
        // A running startup keeps its buffer and exit code.
        if self.supervisor.contains(STARTUP_PROCESS) {
            return Err(SupervisorError::DuplicateProcessName(STARTUP_PROCESS.to_string()));
        }
        self.logs.clear();
        *self.last_exit_code.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.supervisor
            .spawn_process(STARTUP_PROCESS, &self.command.program, &args, spawn)
            .await?;
        *self.options.lock().unwrap_or_else(|p| p.into_inner()) = Some(options);
        tracing::info!(target: "viralcast::api::launcher", args = ?args, "Startup launched from GUI");
        self.publish_status();
        Ok(self.status())
    }

    pub fn stop(&self) -> Result<(), SupervisorError> {
        self.supervisor.kill_process(STARTUP_PROCESS, Signal::SIGTERM)?;
        self.publish_status();
        Ok(())
    }

    fn on_process_event(&self, event: ProcessEvent) {
        if event.name != STARTUP_PROCESS {
            return;
        }
        match event.kind {
            ProcessEventKind::Stdout { line } => self.record_line(LogLevel::Info, line),
            // `viralcast start` logs to stderr; keep the level it printed.
            ProcessEventKind::Stderr { line } => {
                let level = LogLevel::detect(&line).unwrap_or(LogLevel::Info);
                self.record_line(level, line)
            }
            ProcessEventKind::Error { message } => {
                self.record_line(LogLevel::Error, message);
                self.publish_status();
            }
            ProcessEventKind::Terminated { code, .. } => {
                *self.last_exit_code.lock().unwrap_or_else(|p| p.into_inner()) = code;
                self.publish_status();
            }
            ProcessEventKind::Spawned { .. } | ProcessEventKind::Running { .. } => self.publish_status(),
            _ => {}
        }
    }
}

/// Copies the startup child's output and lifecycle into launcher events.
pub fn spawn_event_forwarder(state: &Arc<LauncherState>) -> JoinHandle<()> {
    let state = state.clone();
    let mut events = state.supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => state.on_process_event(event),
                Err(RecvError::Lagged(skipped)) => {
                    state.record_line(LogLevel::Warn, format!("[{} output lines dropped]", skipped));
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[derive(ApiResponse)]
enum StatusApiResponse {
    #[oai(status = 200)]
    Ok(Json<Any<LauncherStatus>>),
}

#[derive(ApiResponse)]
enum StartApiResponse {
    #[oai(status = 200)]
    Ok(Json<Any<LauncherStatus>>),
    #[oai(status = 409)]
    AlreadyRunning(PlainText<String>),
    #[oai(status = 500)]
    InternalServerError(PlainText<String>),
}

#[derive(ApiResponse)]
enum StopApiResponse {
    #[oai(status = 200)]
    Ok(Json<ActionResponse>),
    #[oai(status = 404)]
    NotRunning(PlainText<String>),
    #[oai(status = 500)]
    InternalServerError(PlainText<String>),
}

#[derive(ApiResponse)]
enum LauncherLogsApiResponse {
    #[oai(status = 200)]
    Ok(Json<LogsResponse>),
}

pub struct LauncherApi {
    state: Arc<LauncherState>,
}

#[OpenApi]
impl LauncherApi {
    /// Whether startup is running, and with which options
    #[oai(path = "/status", method = "get")]
    async fn status(&self) -> StatusApiResponse {
        StatusApiResponse::Ok(Json(Any(self.state.status())))
    }

    /// Launch the startup pipeline
    ///
    /// The body is a partial set of startup options; omitted fields take
    /// their defaults. The browser is never opened by the child.
    #[oai(path = "/start", method = "post")]
    async fn start(&self, options: Json<Any<StartupOptions>>) -> StartApiResponse {
        match self.state.start(options.0 .0).await {
            Ok(status) => StartApiResponse::Ok(Json(Any(status))),
            Err(e @ SupervisorError::DuplicateProcessName(_)) => StartApiResponse::AlreadyRunning(PlainText(e.to_string())),
            Err(e) => StartApiResponse::InternalServerError(PlainText(e.to_string())),
        }
    }

    /// Stop the startup pipeline with SIGTERM
    #[oai(path = "/stop", method = "post")]
    async fn stop(&self) -> StopApiResponse {
        match self.state.stop() {
            Ok(()) => StopApiResponse::Ok(Json(ActionResponse {
                success: true,
                message: "stop signal sent".to_string(),
            })),
            Err(e @ SupervisorError::NotFound(_)) => StopApiResponse::NotRunning(PlainText(e.to_string())),
            Err(e) => StopApiResponse::InternalServerError(PlainText(e.to_string())),
        }
    }

    /// Output captured from the startup process, oldest first
    #[oai(path = "/logs", method = "get")]
    async fn logs(&self, limit: Query<Option<usize>>) -> LauncherLogsApiResponse {
        let logs: Vec<LogLine> = self
            .state
            .recent_logs(limit.0.unwrap_or(DEFAULT_LOG_LIMIT))
            .into_iter()
            .map(LogLine::from)
            .collect();
        LauncherLogsApiResponse::Ok(Json(LogsResponse {
            count: logs.len(),
            logs,
        }))
    }
}

#[handler]
fn launcher_socket(ws: WebSocket, state: Data<&Arc<LauncherState>>) -> impl IntoResponse {
    let state = state.0.clone();
    ws.on_upgrade(move |socket| async move {
        let mut initial = vec![LauncherEvent::Status(state.status())];
        initial.extend(state.recent_logs(DEFAULT_LOG_LIMIT).into_iter().map(LauncherEvent::Log));
        pump_socket(socket, state.subscribe(), initial, |_| {}).await;
    })
}

pub fn launcher_app(state: Arc<LauncherState>) -> impl Endpoint {
    let api_service = OpenApiService::new(
        LauncherApi { state: state.clone() },
        "viralcast launcher",
        env!("CARGO_PKG_VERSION"),
    )
    .server("/api");
    let docs = api_service.swagger_ui();

    let mut app = Route::new()
        .nest("/api/docs", docs)
        .nest("/api", api_service)
        .at("/ws", get(launcher_socket.data(state.clone())));

    let public = state.config.launcher_path();
    if public.is_dir() {
        app = app.nest("/", StaticFilesEndpoint::new(public).index_file("index.html"));
    }
    app.with(cors())
}

/// Serves the launcher until SIGINT/SIGTERM, then stops any running startup.
pub async fn serve_launcher(
    config: AppConfig,
    supervisor: ProcessSupervisor,
    command: StartupCommand,
    open_browser: bool,
) -> Result<()> {
    let host = config.dashboard.host.clone();
    let port = config.dashboard.gui_port;
    let state = LauncherState::new(config, supervisor.clone(), command);
    let server = bind(&host, port).await?;
    let forwarder = spawn_event_forwarder(&state);

    let url = format!("http://localhost:{}", server.addr.port());
    tracing::info!(target: "viralcast::api::launcher", url = %url, "GUI launcher listening");
    println!("GUI launcher listening on {}", url);
    if open_browser {
        if let Err(e) = open_url(&url, &BrowserOptions::default()).await {
            tracing::warn!(target: "viralcast::api::launcher", error = %e, "Could not open browser");
        }
    }

    let result = server.run(launcher_app(state), shutdown_signal()).await;
    supervisor.shutdown().await;
    forwarder.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn shell_command(script: &str) -> StartupCommand {
        // `sh -c <script>` ignores the appended `start ...` arguments.
        StartupCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    async fn serve(state: Arc<LauncherState>) -> String {
        let server = bind("127.0.0.1", 0).await.unwrap();
        let url = format!("http://{}", server.addr);
        let app = launcher_app(state);
        tokio::spawn(async move {
            let _ = server.run(app, std::future::pending()).await;
        });
        url
    }

    #[tokio::test]
    async fn start_streams_output_and_reports_exit() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = tempdir().unwrap();
        let config = AppConfig {
            project_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        let state = LauncherState::new(config, ProcessSupervisor::new(), shell_command("echo step one; echo step two; exit 0"));
        let _forwarder = spawn_event_forwarder(&state);
        let mut events = state.subscribe();
        let url = serve(state.clone()).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/api/start", url))
            .json(&serde_json::json!({"quick": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let mut lines = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                LauncherEvent::Log(entry) => lines.push(entry.message),
                LauncherEvent::Status(status) if !status.running && status.last_exit_code.is_some() => {
                    assert_eq!(status.last_exit_code, Some(0));
                    break;
                }
                LauncherEvent::Status(_) => {}
            }
        }
        assert_eq!(lines, vec!["step one", "step two"]);

        let logs: serde_json::Value = reqwest::get(format!("{}/api/logs", url)).await.unwrap().json().await.unwrap();
        assert_eq!(logs["count"], 2);

        let status: serde_json::Value = reqwest::get(format!("{}/api/status", url)).await.unwrap().json().await.unwrap();
        assert_eq!(status["running"], false);
        assert_eq!(status["options"]["quick"], true);
    }

    #[tokio::test]
    async fn second_start_conflicts_and_stop_terminates() {
        let dir = tempdir().unwrap();
        let config = AppConfig {
            project_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        let supervisor = ProcessSupervisor::new();
        let state = LauncherState::new(config, supervisor.clone(), shell_command("exec sleep 30"));
        let url = serve(state.clone()).await;
        let client = reqwest::Client::new();

        let first = client.post(format!("{}/api/start", url)).json(&serde_json::json!({})).send().await.unwrap();
        assert_eq!(first.status(), 200);
        let second = client.post(format!("{}/api/start", url)).json(&serde_json::json!({})).send().await.unwrap();
        assert_eq!(second.status(), 409);

        let stop = client.post(format!("{}/api/stop", url)).send().await.unwrap();
        assert_eq!(stop.status(), 200);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while supervisor.contains(STARTUP_PROCESS) {
            assert!(tokio::time::Instant::now() < deadline, "startup process still registered");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let again = client.post(format!("{}/api/stop", url)).send().await.unwrap();
        assert_eq!(again.status(), 404);
    }

    #[tokio::test]
    async fn rejected_start_keeps_the_running_output() {
        let dir = tempdir().unwrap();
        let config = AppConfig {
            project_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        let supervisor = ProcessSupervisor::new();
        let state = LauncherState::new(config, supervisor.clone(), shell_command("echo alive; exec sleep 30"));
        let _forwarder = spawn_event_forwarder(&state);
        let mut events = state.subscribe();
        let url = serve(state.clone()).await;
        let client = reqwest::Client::new();

        let first = client.post(format!("{}/api/start", url)).json(&serde_json::json!({})).send().await.unwrap();
        assert_eq!(first.status(), 200);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let LauncherEvent::Log(entry) = events.recv().await.unwrap() {
                    if entry.message == "alive" {
                        break;
                    }
                }
            }
        })
        .await
        .unwrap();

        let second = client.post(format!("{}/api/start", url)).json(&serde_json::json!({})).send().await.unwrap();
        assert_eq!(second.status(), 409);

        let logs: serde_json::Value = reqwest::get(format!("{}/api/logs", url)).await.unwrap().json().await.unwrap();
        assert_eq!(logs["count"], 1);
        assert_eq!(logs["logs"][0]["message"], "alive");
        assert!(state.status().running);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn child_stderr_keeps_its_console_level() {
        let dir = tempdir().unwrap();
        let config = AppConfig {
            project_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        let script = "echo '2026-10-17T09:00:00Z  INFO viralcast::startup: Running tests...' >&2; \
                      echo '2026-10-17T09:00:01Z  WARN viralcast::startup: slow' >&2; \
                      echo 'npm notice' >&2";
        let state = LauncherState::new(config, ProcessSupervisor::new(), shell_command(script));
        let _forwarder = spawn_event_forwarder(&state);
        let mut events = state.subscribe();
        state.start(StartupOptions::default()).await.unwrap();

        let mut levels = Vec::new();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while levels.len() < 3 {
                if let LauncherEvent::Log(entry) = events.recv().await.unwrap() {
                    levels.push(entry.level);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(levels, vec![LogLevel::Info, LogLevel::Warn, LogLevel::Info]);
    }
}
