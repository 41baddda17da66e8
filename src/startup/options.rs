use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Development,
    Production,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Development => f.write_str("development"),
            Mode::Production => f.write_str("production"),
        }
    }
}

/// Flat startup configuration, built once from flags and environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupOptions {
    pub skip_tests: bool,
    pub skip_validation: bool,
    pub skip_health_check: bool,
    pub open_browser: bool,
    pub port: u16,
    pub mode: Mode,
    pub gui: bool,
    pub quick: bool,
    pub reclaim_port: bool,
}

impl Default for StartupOptions {
    fn default() -> Self {
        Self {
            skip_tests: false,
            skip_validation: false,
            skip_health_check: false,
            open_browser: true,
            port: 3000,
            mode: Mode::Development,
            gui: false,
            quick: false,
            reclaim_port: false,
        }
    }
}

impl StartupOptions {
    /// Folds `quick` into the individual skip flags.
    pub fn normalized(mut self) -> Self {
        if self.quick {
            self.skip_tests = true;
            self.skip_validation = true;
            self.skip_health_check = true;
        }
        self
    }

    pub fn skips_tests(&self) -> bool {
        self.skip_tests || self.quick
    }

    /// Coverage only runs alongside tests and never in production.
    pub fn skips_coverage(&self) -> bool {
        self.skips_tests() || self.mode == Mode::Production
    }

    /// Arguments for a child `viralcast start` reproducing these options.
    /// The child never opens a browser and never starts a GUI.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["start".to_string(), "--no-browser".to_string()];
        let flags = [
            (self.skip_tests, "--skip-tests"),
            (self.skip_validation, "--skip-validation"),
            (self.skip_health_check, "--skip-health-check"),
            (self.quick, "--quick"),
            (self.reclaim_port, "--reclaim-port"),
        ];
        args.extend(flags.iter().filter(|(on, _)| *on).map(|(_, flag)| flag.to_string()));
        args.push("--port".to_string());
        args.push(self.port.to_string());
        args.push("--mode".to_string());
        args.push(self.mode.to_string());
        args
    }
}
