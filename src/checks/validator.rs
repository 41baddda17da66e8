use anyhow::Result;
use colored::Colorize;
use futures::future::join_all;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use super::config_files::check_config_files;
use super::env_vars::{check_environment, EnvSnapshot};
use super::services::{build_probes, ServiceProbe};
use super::{CheckCategory, CheckOutcome};
use crate::config::AppConfig;

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub checks: Vec<CheckOutcome>,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl ValidationReport {
    fn from_checks(checks: Vec<CheckOutcome>, duration_ms: u64) -> Self {
        let passed = checks.iter().filter(|c| c.success).count();
        Self {
            failed: checks.len() - passed,
            passed,
            checks,
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|c| !c.success)
    }

    /// Itemized pass/fail list grouped by category.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (category, title) in [
            (CheckCategory::Environment, "Environment"),
            (CheckCategory::Config, "Configuration files"),
            (CheckCategory::Service, "External services"),
        ] {
            let items: Vec<&CheckOutcome> = self.checks.iter().filter(|c| c.category == category).collect();
            if items.is_empty() {
                continue;
            }
            let _ = writeln!(out, "{}", title.bold());
            for item in items {
                let mark = if item.success { "✔".green() } else { "✘".red() };
                let latency = item
                    .latency_ms
                    .map(|ms| format!(" ({}ms)", ms).dimmed().to_string())
                    .unwrap_or_default();
                let _ = writeln!(out, "  {} {}: {}{}", mark, item.check, item.message, latency);
            }
        }

        let summary = format!(
            "{} passed, {} failed in {}ms",
            self.passed, self.failed, self.duration_ms
        );
        let _ = writeln!(
            out,
            "\n{}",
            if self.is_success() {
                summary.green().bold()
            } else {
                summary.red().bold()
            }
        );
        out
    }
}

pub struct SetupValidator {
    config: AppConfig,
    env: EnvSnapshot,
    probes: Vec<Arc<dyn ServiceProbe>>,
}

impl SetupValidator {
    pub fn new(config: AppConfig, env: EnvSnapshot) -> Result<Self> {
        let probes = build_probes(&config.services, &env)?;
        Ok(Self { config, env, probes })
    }

    pub fn with_probes(config: AppConfig, env: EnvSnapshot, probes: Vec<Arc<dyn ServiceProbe>>) -> Self {
        Self { config, env, probes }
    }

    /// Never fails: every problem becomes a failed check in the report.
    pub async fn run(&self) -> ValidationReport {
        let started = Instant::now();
        let mut checks = check_environment(&self.env);
        checks.extend(check_config_files(&self.config));

        let results = join_all(self.probes.iter().map(|p| p.probe())).await;
        checks.extend(results.iter().map(|r| r.to_outcome()));

        let report = ValidationReport::from_checks(checks, started.elapsed().as_millis() as u64);
        for failure in report.failures() {
            tracing::warn!(target: "viralcast::checks::validator", check = %failure.check, "{}", failure.message);
        }
        tracing::info!(
            target: "viralcast::checks::validator",
            passed = report.passed,
            failed = report.failed,
            "Validation finished"
        );
        report
    }
}
