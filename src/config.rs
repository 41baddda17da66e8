//! Application configuration: an optional `viralcast.toml`, overlaid with
//! environment variables (after `.env` has been loaded).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "viralcast.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root of the automation project (workflows, prompts, package.json).
    pub project_dir: PathBuf,
    pub env_file: PathBuf,
    pub env_template: PathBuf,
    pub reports_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub file_logging: bool,
    pub log_level: String,
    pub workflows_dir: PathBuf,
    pub platforms_config: PathBuf,
    pub schema_config: PathBuf,
    pub public_dir: PathBuf,
    pub launcher_dir: PathBuf,
    pub dashboard: DashboardConfig,
    pub services: ServicesConfig,
    pub commands: CommandsConfig,
    pub requirements: RequirementsConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub host: String,
    pub port: u16,
    pub gui_port: u16,
    pub metrics_interval_secs: u64,
    pub health_interval_secs: u64,
    pub log_buffer: usize,
    pub readiness_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub openai_base_url: String,
    pub airtable_base_url: String,
    pub apify_base_url: String,
    pub n8n_base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub install: String,
    pub test: String,
    pub coverage: String,
    /// Directory whose presence means dependencies are installed.
    pub dependency_cache: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequirementsConfig {
    /// Prints the runtime version, e.g. `v20.11.1`.
    pub runtime_version_command: String,
    pub min_runtime_major: u32,
    pub min_free_memory_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub memory_warn_percent: f64,
    pub disk_warn_percent: f64,
    pub latency_warn_ms: u64,
    pub retain_reports: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            env_file: PathBuf::from(".env"),
            env_template: PathBuf::from(".env.example"),
            reports_dir: PathBuf::from("reports"),
            logs_dir: PathBuf::from("logs"),
            file_logging: true,
            log_level: "info".to_string(),
            workflows_dir: PathBuf::from("workflows"),
            platforms_config: PathBuf::from("config/platforms.json"),
            schema_config: PathBuf::from("config/airtable-schema.json"),
            public_dir: PathBuf::from("public/dashboard"),
            launcher_dir: PathBuf::from("public/launcher"),
            dashboard: DashboardConfig::default(),
            services: ServicesConfig::default(),
            commands: CommandsConfig::default(),
            requirements: RequirementsConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            gui_port: 3100,
            metrics_interval_secs: 5,
            health_interval_secs: 30,
            log_buffer: 1000,
            readiness_timeout_secs: 30,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            openai_base_url: "https://api.openai.com".to_string(),
            airtable_base_url: "https://api.airtable.com".to_string(),
            apify_base_url: "https://api.apify.com".to_string(),
            n8n_base_url: "http://localhost:5678".to_string(),
            timeout_secs: 15,
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            install: "npm install".to_string(),
            test: "npm test".to_string(),
            coverage: "npm run test:coverage".to_string(),
            dependency_cache: PathBuf::from("node_modules"),
        }
    }
}

impl Default for RequirementsConfig {
    fn default() -> Self {
        Self {
            runtime_version_command: "node --version".to_string(),
            min_runtime_major: 18,
            min_free_memory_mb: 512,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            memory_warn_percent: 90.0,
            disk_warn_percent: 90.0,
            latency_warn_ms: 5000,
            retain_reports: 10,
        }
    }
}

impl DashboardConfig {
    /// Metrics tick, clamped to 5..=30 seconds.
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.clamp(5, 30))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(5))
    }

    /// Ring buffer size, clamped to 200..=1000 lines.
    pub fn log_capacity(&self) -> usize {
        self.log_buffer.clamp(200, 1000)
    }
}

impl ServicesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl AppConfig {
    /// Loads `path` if it exists, otherwise starts from defaults. Relative
    /// paths in the result are resolved against `project_dir`.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str::<AppConfig>(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            tracing::debug!(target: "viralcast::config", path = %path.display(), "No config file, using defaults.");
            AppConfig::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlays environment variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("LOG_LEVEL").or_else(|| lookup("RUST_LOG")) {
            if !level.trim().is_empty() {
                self.log_level = level;
            }
        }
        if let Some(port) = lookup("DASHBOARD_PORT").and_then(|p| p.trim().parse().ok()) {
            self.dashboard.port = port;
        }
        if let Some(toggle) = lookup("ENABLE_FILE_LOGS") {
            self.file_logging = !matches!(toggle.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off");
        }
        if let Some(url) = lookup("N8N_BASE_URL") {
            if !url.trim().is_empty() {
                self.services.n8n_base_url = url.trim().trim_end_matches('/').to_string();
            }
        }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn reports_path(&self) -> PathBuf {
        self.resolve(&self.reports_dir)
    }

    pub fn logs_path(&self) -> PathBuf {
        self.resolve(&self.logs_dir)
    }

    pub fn workflows_path(&self) -> PathBuf {
        self.resolve(&self.workflows_dir)
    }

    pub fn platforms_path(&self) -> PathBuf {
        self.resolve(&self.platforms_config)
    }

    pub fn schema_path(&self) -> PathBuf {
        self.resolve(&self.schema_config)
    }

    pub fn env_path(&self) -> PathBuf {
        self.resolve(&self.env_file)
    }

    pub fn env_template_path(&self) -> PathBuf {
        self.resolve(&self.env_template)
    }

    pub fn public_path(&self) -> PathBuf {
        self.resolve(&self.public_dir)
    }

    pub fn launcher_path(&self) -> PathBuf {
        self.resolve(&self.launcher_dir)
    }
}

/// Production when `APP_ENV` (or `NODE_ENV`) says so.
pub fn is_production_env(lookup: impl Fn(&str) -> Option<String>) -> bool {
    lookup("APP_ENV")
        .or_else(|| lookup("NODE_ENV"))
        .map(|v| v.trim().eq_ignore_ascii_case("production"))
        .unwrap_or(false)
}
