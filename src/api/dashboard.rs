//! Monitoring dashboard: health, metrics, logs and workflow files over REST,
//! with live updates over `/ws`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use poem::endpoint::StaticFilesEndpoint;
use poem::web::websocket::WebSocket;
use poem::web::Data;
use poem::{get, handler, Endpoint, EndpointExt, IntoResponse, Route};
use poem_openapi::param::Query;
use poem_openapi::payload::{Json, PlainText};
use poem_openapi::types::Any;
use poem_openapi::{ApiResponse, OpenApi, OpenApiService};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing;

use super::models::{LogLine, LogsResponse, TestWorkflowRequest, WorkflowFileInfo, WorkflowsResponse};
use super::{bind, cors, pump_socket, shutdown_signal};
use crate::checks::config_files::workflow_files;
use crate::checks::env_vars::EnvSnapshot;
use crate::checks::health::{HealthChecker, HealthReport};
use crate::checks::platform_test::{run_platform_test, PlatformTestError, WorkflowTestResult};
use crate::checks::services::{build_probes, ServiceProbe};
use crate::config::AppConfig;
use crate::monitor::{MetricsCollector, MetricsSnapshot};
use crate::runtime::log::{get_shared_logs, LogEntry, LogFilterOptions, LogLevel, SHARED_LOG_STORE};

pub const READY_MESSAGE: &str = "Dashboard listening on";
const EVENT_CAPACITY: usize = 256;
const DEFAULT_LOG_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Server to client envelope: `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum DashboardEvent {
    Metrics(MetricsSnapshot),
    Logs(LogEntry),
    HealthUpdate(HealthReport),
    WorkflowTestResult(WorkflowTestResult),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    RequestHealthCheck,
    RequestWorkflowTest { platform: String },
}

pub struct DashboardState {
    config: AppConfig,
    health: HealthChecker,
    probes: Vec<Arc<dyn ServiceProbe>>,
    metrics: Arc<MetricsCollector>,
    latest_metrics: RwLock<Option<MetricsSnapshot>>,
    events: broadcast::Sender<DashboardEvent>,
}

impl DashboardState {
    pub fn new(config: AppConfig, env: EnvSnapshot) -> Result<Arc<Self>> {
        let probes = build_probes(&config.services, &env)?;
        let metrics = Arc::new(MetricsCollector::new(config.project_dir.clone()));
        let health = HealthChecker::with_probes(config.clone(), env, probes.clone()).with_metrics(metrics.clone());
        Ok(Self::from_parts(config, health, probes, metrics))
    }

    pub fn from_parts(
        config: AppConfig,
        health: HealthChecker,
        probes: Vec<Arc<dyn ServiceProbe>>,
        metrics: Arc<MetricsCollector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config,
            health,
            probes,
            metrics,
            latest_metrics: RwLock::new(None),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DashboardEvent) {
        let _ = self.events.send(event);
    }

    pub fn latest_metrics(&self) -> Option<MetricsSnapshot> {
        self.latest_metrics.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Collects a snapshot, replaces the stored one and broadcasts it.
    pub async fn refresh_metrics(&self) -> MetricsSnapshot {
        let snapshot = self.metrics.collect().await;
        *self.latest_metrics.write().unwrap_or_else(|p| p.into_inner()) = Some(snapshot.clone());
        self.emit(DashboardEvent::Metrics(snapshot.clone()));
        snapshot
    }

    /// Runs, persists and broadcasts a health check. Overlapping calls are
    /// not merged.
    pub async fn run_health_check(&self) -> HealthReport {
        let report = self.health.check().await;
        if let Err(e) = self.health.persist(&report) {
            tracing::warn!(target: "viralcast::api::dashboard", error = %e, "Failed to save health report");
        }
        self.emit(DashboardEvent::HealthUpdate(report.clone()));
        report
    }

    pub async fn run_workflow_test(&self, platform: &str) -> Result<WorkflowTestResult, PlatformTestError> {
        let result = run_platform_test(platform, &self.config.platforms_path(), &self.probes).await;
        match &result {
            Ok(r) => self.emit(DashboardEvent::WorkflowTestResult(r.clone())),
            Err(e) => self.emit(DashboardEvent::Error(ErrorPayload { message: e.to_string() })),
        }
        result
    }

    pub fn workflows(&self) -> WorkflowsResponse {
        let dir = self.config.workflows_path();
        let workflows = workflow_files(&dir)
            .into_iter()
            .filter_map(|path| {
                let meta = std::fs::metadata(&path).ok()?;
                Some(WorkflowFileInfo {
                    name: path.file_name()?.to_string_lossy().into_owned(),
                    path: path.display().to_string(),
                    size_bytes: meta.len(),
                    modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
                })
            })
            .collect();
        WorkflowsResponse {
            directory: dir.display().to_string(),
            present: dir.is_dir(),
            workflows,
        }
    }

    fn handle_client_message(self: &Arc<Self>, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::RequestHealthCheck) => {
                let state = self.clone();
                tokio::spawn(async move {
                    state.run_health_check().await;
                });
            }
            Ok(ClientMessage::RequestWorkflowTest { platform }) => {
                let state = self.clone();
                tokio::spawn(async move {
                    let _ = state.run_workflow_test(&platform).await;
                });
            }
            Err(e) => self.emit(DashboardEvent::Error(ErrorPayload {
                message: format!("unrecognised message: {}", e),
            })),
        }
    }
}

/// Metrics and health ticks, plus forwarding of captured log lines.
pub fn spawn_background_tasks(state: &Arc<DashboardState>) -> Vec<JoinHandle<()>> {
    let metrics_state = state.clone();
    let metrics = tokio::spawn(async move {
        let mut ticker = interval(metrics_state.config.dashboard.metrics_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            metrics_state.refresh_metrics().await;
        }
    });

    let health_state = state.clone();
    let health = tokio::spawn(async move {
        let mut ticker = interval(health_state.config.dashboard.health_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            health_state.run_health_check().await;
        }
    });

    let log_state = state.clone();
    let logs = tokio::spawn(async move {
        let mut feed = SHARED_LOG_STORE.subscribe();
        loop {
            match feed.recv().await {
                Ok(entry) => log_state.emit(DashboardEvent::Logs(entry)),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    vec![metrics, health, logs]
}

#[derive(ApiResponse)]
enum HealthApiResponse {
    #[oai(status = 200)]
    Ok(Json<Any<HealthReport>>),
}

#[derive(ApiResponse)]
enum MetricsApiResponse {
    #[oai(status = 200)]
    Ok(Json<Any<MetricsSnapshot>>),
}

#[derive(ApiResponse)]
enum LogsApiResponse {
    #[oai(status = 200)]
    Ok(Json<LogsResponse>),
    #[oai(status = 400)]
    BadRequest(PlainText<String>),
}

#[derive(ApiResponse)]
enum WorkflowsApiResponse {
    #[oai(status = 200)]
    Ok(Json<WorkflowsResponse>),
}

#[derive(ApiResponse)]
enum TestWorkflowApiResponse {
    #[oai(status = 200)]
    Ok(Json<Any<WorkflowTestResult>>),
    #[oai(status = 404)]
    UnknownPlatform(PlainText<String>),
}

pub struct DashboardApi {
    state: Arc<DashboardState>,
}

#[OpenApi]
impl DashboardApi {
    /// Run a health check
    ///
    /// Probes every external service, saves the report under `reports/` and
    /// pushes it to connected sockets as `health-update`.
    #[oai(path = "/health", method = "get")]
    async fn health(&self) -> HealthApiResponse {
        HealthApiResponse::Ok(Json(Any(self.state.run_health_check().await)))
    }

    /// Latest metrics snapshot
    ///
    /// Collected on demand when no tick has run yet.
    #[oai(path = "/metrics", method = "get")]
    async fn metrics(&self) -> MetricsApiResponse {
        let snapshot = match self.state.latest_metrics() {
            Some(s) => s,
            None => self.state.refresh_metrics().await,
        };
        MetricsApiResponse::Ok(Json(Any(snapshot)))
    }

    /// Recent log lines
    ///
    /// `level` is a minimum severity: `warn` returns warnings and errors.
    #[oai(path = "/logs", method = "get")]
    async fn logs(&self, limit: Query<Option<usize>>, level: Query<Option<String>>) -> LogsApiResponse {
        let min_level = match level.0.as_deref().map(str::parse::<LogLevel>) {
            None => None,
            Some(Ok(l)) => Some(l),
            Some(Err(e)) => return LogsApiResponse::BadRequest(PlainText(e)),
        };
        let logs: Vec<LogLine> = get_shared_logs(&LogFilterOptions {
            min_level,
            max_entries: Some(limit.0.unwrap_or(DEFAULT_LOG_LIMIT)),
            ..Default::default()
        })
        .into_iter()
        .map(LogLine::from)
        .collect();
        LogsApiResponse::Ok(Json(LogsResponse {
            count: logs.len(),
            logs,
        }))
    }

    /// Workflow files with size and modification time
    #[oai(path = "/workflows", method = "get")]
    async fn workflows(&self) -> WorkflowsApiResponse {
        WorkflowsApiResponse::Ok(Json(self.state.workflows()))
    }

    /// Exercise every service once for a platform
    #[oai(path = "/test-workflow", method = "post")]
    async fn test_workflow(&self, req: Json<TestWorkflowRequest>) -> TestWorkflowApiResponse {
        match self.state.run_workflow_test(&req.0.platform).await {
            Ok(result) => TestWorkflowApiResponse::Ok(Json(Any(result))),
            Err(e) => TestWorkflowApiResponse::UnknownPlatform(PlainText(e.to_string())),
        }
    }
}

#[handler]
fn dashboard_socket(ws: WebSocket, state: Data<&Arc<DashboardState>>) -> impl IntoResponse {
    let state = state.0.clone();
    ws.on_upgrade(move |socket| async move {
        tracing::debug!(target: "viralcast::api::dashboard", "Socket connected");
        let initial: Vec<DashboardEvent> = state.latest_metrics().map(DashboardEvent::Metrics).into_iter().collect();
        let handler_state = state.clone();
        pump_socket(socket, state.subscribe(), initial, move |text| {
            handler_state.handle_client_message(&text)
        })
        .await;
        tracing::debug!(target: "viralcast::api::dashboard", "Socket disconnected");
    })
}

pub fn dashboard_app(state: Arc<DashboardState>) -> impl Endpoint {
    let api_service = OpenApiService::new(
        DashboardApi { state: state.clone() },
        "viralcast dashboard",
        env!("CARGO_PKG_VERSION"),
    )
    .server("/api");
    let docs = api_service.swagger_ui();

    let mut app = Route::new()
        .nest("/api/docs", docs)
        .nest("/api", api_service)
        .at("/ws", get(dashboard_socket.data(state.clone())));

    let public = state.config.public_path();
    if public.is_dir() {
        app = app.nest("/", StaticFilesEndpoint::new(public).index_file("index.html"));
    } else {
        tracing::warn!(target: "viralcast::api::dashboard", path = %public.display(), "Static dashboard directory missing; serving API only");
    }
    app.with(cors())
}

/// Binds, announces readiness on stdout and serves until SIGINT/SIGTERM.
pub async fn serve_dashboard(config: AppConfig, host: &str, port: u16) -> Result<()> {
    SHARED_LOG_STORE.set_capacity(config.dashboard.log_capacity());
    let state = DashboardState::new(config, EnvSnapshot::from_process())?;
    let server = bind(host, port).await?;

    let tasks = spawn_background_tasks(&state);
    tracing::info!(target: "viralcast::api::dashboard", host, port = server.addr.port(), "Dashboard started");
    println!("{} http://{}:{}", READY_MESSAGE, host, server.addr.port());

    let result = server.run(dashboard_app(state), shutdown_signal()).await;
    for task in tasks {
        task.abort();
    }
    result
}
