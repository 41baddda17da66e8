use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use sysinfo::System;
use tokio::process::Command;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskUsage {
    pub filesystem: String,
    pub mount_point: String,
    pub total_kb: u64,
    pub used_kb: u64,
    pub available_kb: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
    /// Resident set size of this process.
    pub process_rss_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub process_uptime_secs: u64,
    pub system_uptime_secs: u64,
    pub memory: MemoryUsage,
    /// `None` when `df` is unavailable or its output could not be read.
    pub disk: Option<DiskUsage>,
}

/// Parses POSIX `df -Pk <path>` output; the last data line wins.
pub fn parse_df_output(output: &str) -> Option<DiskUsage> {
    let line = output.lines().skip(1).filter(|l| !l.trim().is_empty()).last()?;
    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.len() < 6 {
        return None;
    }
    let total_kb: u64 = cols[1].parse().ok()?;
    let used_kb: u64 = cols[2].parse().ok()?;
    let available_kb: u64 = cols[3].parse().ok()?;
    let used_percent = cols[4]
        .trim_end_matches('%')
        .parse::<f64>()
        .ok()
        .or_else(|| (total_kb > 0).then(|| used_kb as f64 * 100.0 / total_kb as f64))?;

    Some(DiskUsage {
        filesystem: cols[0].to_string(),
        // Mount points may contain spaces.
        mount_point: cols[5..].join(" "),
        total_kb,
        used_kb,
        available_kb,
        used_percent,
    })
}

pub async fn disk_usage(path: &Path) -> Result<DiskUsage> {
    let output = Command::new("df")
        .arg("-Pk")
        .arg(path)
        .output()
        .await
        .context("monitor::disk_usage: failed to run df")?;
    if !output.status.success() {
        return Err(anyhow!(
            "monitor::disk_usage: df exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_df_output(&stdout).ok_or_else(|| anyhow!("monitor::disk_usage: unrecognised df output"))
}

pub struct MetricsCollector {
    system: Mutex<System>,
    started: Instant,
    disk_path: PathBuf,
}

impl MetricsCollector {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            started: Instant::now(),
            disk_path: disk_path.into(),
        }
    }

    pub fn memory(&self) -> MemoryUsage {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_memory();
        let total = system.total_memory();
        let used = system.used_memory();

        let process_rss_bytes = sysinfo::get_current_pid().ok().and_then(|pid| {
            system.refresh_process(pid);
            system.process(pid).map(|p| p.memory())
        });

        MemoryUsage {
            total_bytes: total,
            used_bytes: used,
            available_bytes: system.available_memory(),
            used_percent: if total == 0 {
                0.0
            } else {
                used as f64 * 100.0 / total as f64
            },
            process_rss_bytes,
        }
    }

    pub async fn collect(&self) -> MetricsSnapshot {
        let memory = self.memory();
        let disk = match disk_usage(&self.disk_path).await {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::debug!(target: "viralcast::monitor::metrics", error = %e, "Disk usage unavailable");
                None
            }
        };

        MetricsSnapshot {
            timestamp: Utc::now(),
            process_uptime_secs: self.started.elapsed().as_secs(),
            system_uptime_secs: System::uptime(),
            memory,
            disk,
        }
    }
}
