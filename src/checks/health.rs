//! Health checker: the service probes plus system resources, folded into a
//! tri-state status and persisted as timestamped JSON reports.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

use super::config_files::check_config_files;
use super::env_vars::{check_environment, EnvSnapshot};
use super::services::{build_probes, ProbeResult, ServiceKind, ServiceProbe};
use super::CheckError;
use crate::config::AppConfig;
use crate::monitor::{DiskUsage, MemoryUsage, MetricsCollector};

pub const REPORT_PREFIX: &str = "health-report-";
const LATENCY_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service: ServiceKind,
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub http_status: Option<u16>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CheckError>,
    /// Rolling figures across every check this checker has run.
    #[serde(default)]
    pub average_latency_ms: Option<f64>,
    #[serde(default)]
    pub failure_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthIssue {
    pub source: String,
    pub message: String,
}

impl HealthIssue {
    fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub memory: MemoryUsage,
    pub disk: Option<DiskUsage>,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub services: Vec<ServiceHealth>,
    pub system: Option<SystemHealth>,
    pub warnings: Vec<HealthIssue>,
    pub errors: Vec<HealthIssue>,
    pub duration_ms: u64,
}

pub fn aggregate_status(warnings: &[HealthIssue], errors: &[HealthIssue]) -> HealthStatus {
    if !errors.is_empty() {
        HealthStatus::Unhealthy
    } else if !warnings.is_empty() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Rolling counters for one service across checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub requests: u64,
    pub failures: u64,
    pub recent_latencies_ms: VecDeque<u64>,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl ServiceStats {
    pub fn record(&mut self, result: &ProbeResult) {
        self.requests += 1;
        if result.success {
            self.last_error = None;
        } else {
            self.failures += 1;
            self.last_error = Some(result.message.clone());
        }
        // Short-circuited probes never hit the network.
        if result.http_status.is_some() || result.latency_ms > 0 {
            if self.recent_latencies_ms.len() == LATENCY_WINDOW {
                self.recent_latencies_ms.pop_front();
            }
            self.recent_latencies_ms.push_back(result.latency_ms);
        }
        self.last_checked = Some(Utc::now());
    }

    pub fn average_latency_ms(&self) -> Option<f64> {
        if self.recent_latencies_ms.is_empty() {
            return None;
        }
        let sum: u64 = self.recent_latencies_ms.iter().sum();
        Some(sum as f64 / self.recent_latencies_ms.len() as f64)
    }

    pub fn failure_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.failures as f64 / self.requests as f64
        }
    }
}

pub struct HealthChecker {
    config: AppConfig,
    env: EnvSnapshot,
    probes: Vec<Arc<dyn ServiceProbe>>,
    metrics: Option<Arc<MetricsCollector>>,
    stats: Mutex<BTreeMap<ServiceKind, ServiceStats>>,
}

impl HealthChecker {
    pub fn new(config: AppConfig, env: EnvSnapshot) -> Result<Self> {
        let probes = build_probes(&config.services, &env)?;
        Ok(Self::with_probes(config, env, probes))
    }

    pub fn with_probes(config: AppConfig, env: EnvSnapshot, probes: Vec<Arc<dyn ServiceProbe>>) -> Self {
        Self {
            config,
            env,
            probes,
            metrics: None,
            stats: Mutex::new(BTreeMap::new()),
        }
    }

    /// Include memory and disk usage in reports.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn stats(&self) -> BTreeMap<ServiceKind, ServiceStats> {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Runs every check. Concurrent calls are independent; nothing is shared
    /// between them except the rolling stats.
    pub async fn check(&self) -> HealthReport {
        let started = Instant::now();
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        // Missing credentials show up once per service through the probes.
        for outcome in check_environment(&self.env) {
            match &outcome.error {
                None | Some(CheckError::MissingEnvironmentVariable { .. }) => {}
                Some(e) => warnings.push(HealthIssue::new(outcome.check.clone(), e.to_string())),
            }
        }

        for outcome in check_config_files(&self.config) {
            if let Some(e) = &outcome.error {
                errors.push(HealthIssue::new(outcome.check.clone(), e.to_string()));
            }
        }

        let results = join_all(self.probes.iter().map(|probe| probe.probe())).await;
        let rolling: BTreeMap<ServiceKind, (Option<f64>, f64)> = {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            for result in &results {
                stats.entry(result.service).or_default().record(result);
            }
            stats
                .iter()
                .map(|(service, s)| (*service, (s.average_latency_ms(), s.failure_rate())))
                .collect()
        };

        let latency_warn_ms = self.config.health.latency_warn_ms;
        let services: Vec<ServiceHealth> = results
            .into_iter()
            .map(|result| {
                if let Some(e) = &result.error {
                    errors.push(HealthIssue::new(result.service.label(), e.to_string()));
                } else if result.latency_ms > latency_warn_ms {
                    warnings.push(HealthIssue::new(
                        result.service.label(),
                        format!("slow response: {}ms (threshold {}ms)", result.latency_ms, latency_warn_ms),
                    ));
                }
                let (average_latency_ms, failure_rate) = rolling.get(&result.service).copied().unwrap_or((None, 0.0));
                ServiceHealth {
                    service: result.service,
                    status: if result.success {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Unhealthy
                    },
                    latency_ms: result.latency_ms,
                    http_status: result.http_status,
                    message: result.message,
                    error: result.error,
                    average_latency_ms,
                    failure_rate,
                }
            })
            .collect();

        let system = match &self.metrics {
            Some(metrics) => {
                let snapshot = metrics.collect().await;
                let limits = &self.config.health;
                if snapshot.memory.used_percent > limits.memory_warn_percent {
                    warnings.push(HealthIssue::new(
                        "system:memory",
                        format!("memory usage at {:.1}%", snapshot.memory.used_percent),
                    ));
                }
                if let Some(disk) = &snapshot.disk {
                    if disk.used_percent > limits.disk_warn_percent {
                        warnings.push(HealthIssue::new(
                            "system:disk",
                            format!("disk usage at {:.1}% on {}", disk.used_percent, disk.mount_point),
                        ));
                    }
                }
                Some(SystemHealth {
                    memory: snapshot.memory,
                    disk: snapshot.disk,
                    uptime_secs: snapshot.system_uptime_secs,
                })
            }
            None => None,
        };

        let status = aggregate_status(&warnings, &errors);
        let report = HealthReport {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            status,
            services,
            system,
            warnings,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            target: "viralcast::checks::health",
            status = ?report.status,
            warnings = report.warnings.len(),
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "Health check finished"
        );
        report
    }

    /// Writes the report and prunes old ones.
    pub fn persist(&self, report: &HealthReport) -> Result<PathBuf> {
        let dir = self.config.reports_path();
        let path = write_report(&dir, report)?;
        match prune_reports(&dir, self.config.health.retain_reports) {
            Ok(0) => {}
            Ok(removed) => {
                tracing::debug!(target: "viralcast::checks::health", removed, "Pruned old health reports")
            }
            Err(e) => {
                tracing::warn!(target: "viralcast::checks::health", error = %e, "Failed to prune health reports")
            }
        }
        Ok(path)
    }

    pub async fn check_and_persist(&self) -> Result<(HealthReport, PathBuf)> {
        let report = self.check().await;
        let path = self.persist(&report)?;
        Ok((report, path))
    }
}

pub fn report_file_name(report: &HealthReport) -> String {
    let simple = report.id.simple().to_string();
    format!(
        "{}{}-{}.json",
        REPORT_PREFIX,
        report.timestamp.format("%Y-%m-%dT%H-%M-%S%.3fZ"),
        &simple[..8]
    )
}

pub fn write_report(dir: &Path, report: &HealthReport) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("checks::health: failed to create reports dir {}", dir.display()))?;
    let path = dir.join(report_file_name(report));
    let json = serde_json::to_string_pretty(report).context("checks::health: failed to serialize report")?;
    std::fs::write(&path, json)
        .with_context(|| format!("checks::health: failed to write {}", path.display()))?;
    Ok(path)
}

/// Deletes all but the `keep` newest reports, never fewer than one. File names embed the
/// timestamp, so name order is chronological.
pub fn prune_reports(dir: &Path, keep: usize) -> Result<usize> {
    // The report just written always survives.
    let keep = keep.max(1);
    let mut reports: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("checks::health: failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(REPORT_PREFIX) && n.ends_with(".json"))
                .unwrap_or(false)
        })
        .collect();
    reports.sort();

    let excess = reports.len().saturating_sub(keep);
    let mut removed = 0;
    for path in reports.into_iter().take(excess) {
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => {
                tracing::warn!(target: "viralcast::checks::health", path = %path.display(), error = %e, "Could not delete report")
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::checks::services::tests::test_env;
    use crate::config::ServicesConfig;
    use tempfile::tempdir;

    /// A project dir with valid platforms, schema and one workflow.
    pub(crate) fn write_valid_project(root: &Path) {
        std::fs::create_dir_all(root.join("config")).unwrap();
        std::fs::create_dir_all(root.join("workflows")).unwrap();
        std::fs::write(
            root.join("config/platforms.json"),
            r#"{"platforms": {"tiktok": {}, "instagram": {}}}"#,
        )
        .unwrap();
        std::fs::write(root.join("config/airtable-schema.json"), r#"{"tables": []}"#).unwrap();
        std::fs::write(
            root.join("workflows/research.json"),
            r#"{"name": "research", "nodes": [], "connections": {}}"#,
        )
        .unwrap();
    }

    pub(crate) fn project_config(root: &Path, base_url: &str) -> AppConfig {
        AppConfig {
            project_dir: root.to_path_buf(),
            services: ServicesConfig {
                openai_base_url: base_url.to_string(),
                airtable_base_url: base_url.to_string(),
                apify_base_url: base_url.to_string(),
                n8n_base_url: base_url.to_string(),
                timeout_secs: 5,
            },
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn network_failures_make_four_distinct_errors() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = tempdir().unwrap();
        write_valid_project(dir.path());
        let checker = HealthChecker::new(project_config(dir.path(), "http://127.0.0.1:1"), test_env()).unwrap();

        let report = checker.check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.errors.len(), 4, "{:?}", report.errors);
        let mut sources: Vec<&str> = report.errors.iter().map(|e| e.source.as_str()).collect();
        sources.sort();
        sources.dedup();
        assert_eq!(sources, vec!["airtable", "apify", "n8n", "openai"]);

        let stats = checker.stats();
        assert_eq!(stats.len(), 4);
        assert!(stats.values().all(|s| s.requests == 1 && s.failures == 1));
        assert!(report.services.iter().all(|s| s.failure_rate == 1.0));
    }

    #[tokio::test]
    async fn reports_carry_rolling_service_figures() {
        let dir = tempdir().unwrap();
        write_valid_project(dir.path());
        let base_url = crate::checks::services::tests::spawn_mock_api().await;
        let checker = HealthChecker::new(project_config(dir.path(), &base_url), test_env()).unwrap();

        checker.check().await;
        let report = checker.check().await;
        let openai = report
            .services
            .iter()
            .find(|s| s.service == ServiceKind::OpenAi)
            .unwrap();
        assert_eq!(openai.failure_rate, 0.0);
        assert!(openai.average_latency_ms.is_some());
        let rejected = report
            .services
            .iter()
            .find(|s| s.service != ServiceKind::OpenAi)
            .unwrap();
        assert_eq!(rejected.failure_rate, 1.0);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["services"][0].get("failure_rate").is_some());
    }

    #[tokio::test]
    async fn zero_retention_still_keeps_the_latest_report() {
        let dir = tempdir().unwrap();
        write_valid_project(dir.path());
        let mut config = project_config(dir.path(), "http://127.0.0.1:1");
        config.health.retain_reports = 0;
        let checker = HealthChecker::with_probes(config, test_env(), Vec::new());

        let (_, first) = checker.check_and_persist().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let (_, second) = checker.check_and_persist().await.unwrap();
        assert!(second.exists());
        assert!(!first.exists());
    }

    #[tokio::test]
    async fn reachable_services_are_healthy() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = tempdir().unwrap();
        write_valid_project(dir.path());
        let base_url = crate::checks::services::tests::spawn_mock_api().await;
        let checker = HealthChecker::new(project_config(dir.path(), &base_url), test_env()).unwrap();
        let report = checker.check().await;
        let openai = report
            .services
            .iter()
            .find(|s| s.service == ServiceKind::OpenAi)
            .unwrap();
        assert_eq!(openai.status, HealthStatus::Healthy);
        // The mock rejects the other three.
        assert_eq!(report.errors.len(), 3);
    }

    #[test]
    fn status_aggregation() {
        let issue = HealthIssue::new("x", "y");
        assert_eq!(aggregate_status(&[], &[]), HealthStatus::Healthy);
        assert_eq!(aggregate_status(&[issue.clone()], &[]), HealthStatus::Degraded);
        assert_eq!(aggregate_status(&[issue.clone()], &[issue]), HealthStatus::Unhealthy);
    }

    #[test]
    fn stats_keep_the_last_twenty_latencies() {
        let mut stats = ServiceStats::default();
        for i in 0..25u64 {
            stats.record(&ProbeResult {
                service: ServiceKind::OpenAi,
                success: i % 5 != 0,
                http_status: Some(200),
                latency_ms: i,
                message: String::new(),
                error: None,
            });
        }
        assert_eq!(stats.requests, 25);
        assert_eq!(stats.failures, 5);
        assert_eq!(stats.recent_latencies_ms.len(), 20);
        assert_eq!(stats.recent_latencies_ms.front(), Some(&5));
        assert_eq!(stats.average_latency_ms(), Some(14.5));
    }

    #[tokio::test]
    async fn persisting_keeps_only_the_newest_reports() {
        let dir = tempdir().unwrap();
        write_valid_project(dir.path());
        let mut config = project_config(dir.path(), "http://127.0.0.1:1");
        config.health.retain_reports = 3;
        let checker = HealthChecker::with_probes(config, test_env(), Vec::new());

        let reports_dir = dir.path().join("reports");
        std::fs::create_dir_all(&reports_dir).unwrap();
        std::fs::write(reports_dir.join("health-report-2000-01-01T00-00-00.000Z-aaaaaaaa.json"), "{}").unwrap();
        std::fs::write(reports_dir.join("notes.txt"), "keep me").unwrap();

        let mut written = Vec::new();
        for _ in 0..3 {
            let (_, path) = checker.check_and_persist().await.unwrap();
            written.push(path);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let names: Vec<String> = std::fs::read_dir(&reports_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.iter().filter(|n| n.starts_with(REPORT_PREFIX)).count(), 3);
        assert!(names.contains(&"notes.txt".to_string()));
        assert!(!names.iter().any(|n| n.contains("2000-01-01")));
        assert!(written.iter().all(|p| p.exists()));

        let saved: HealthReport = serde_json::from_str(&std::fs::read_to_string(&written[2]).unwrap()).unwrap();
        assert_eq!(saved.status, HealthStatus::Healthy);
    }
}
