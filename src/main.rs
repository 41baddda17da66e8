use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use viralcast::api::dashboard::serve_dashboard;
use viralcast::api::launcher::{serve_launcher, StartupCommand};
use viralcast::checks::env_vars::EnvSnapshot;
use viralcast::checks::health::{HealthChecker, HealthReport, HealthStatus};
use viralcast::checks::validator::SetupValidator;
use viralcast::config::{is_production_env, AppConfig, DEFAULT_CONFIG_FILE};
use viralcast::logging::{init_logging, ConsoleTarget, LoggingOptions};
use viralcast::monitor::MetricsCollector;
use viralcast::runtime::ProcessSupervisor;
use viralcast::startup::{
    DashboardLaunch, Mode, ShutdownReason, ShutdownSignals, StartupOptions, StartupSequencer, StartupSummary,
    StepState, StepUpdate,
};
use viralcast::terminal::port::PortAllocator;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Local orchestration for the viral content pipeline", long_about = None)]
struct Cli {
    /// Optional TOML config file.
    #[clap(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check requirements, run tests and checks, then launch the dashboard.
    Start(StartArgs),
    /// Validate environment, config files and API credentials.
    Validate,
    /// Run a health check and save the report.
    Health {
        /// Print the report without writing it to the reports directory.
        #[clap(long)]
        no_save: bool,
    },
    /// Serve the monitoring dashboard.
    Dashboard {
        #[clap(long)]
        port: Option<u16>,
        #[clap(long)]
        host: Option<String>,
    },
}

#[derive(Args, Debug)]
struct StartArgs {
    #[clap(long)]
    skip_tests: bool,
    #[clap(long)]
    skip_validation: bool,
    #[clap(long)]
    skip_health_check: bool,
    #[clap(long)]
    no_browser: bool,
    /// Preferred dashboard port (falls back to DASHBOARD_PORT, then 3000).
    #[clap(long)]
    port: Option<u16>,
    #[clap(long, value_enum)]
    mode: Option<Mode>,
    /// Open the browser launcher instead of running the pipeline here.
    #[clap(long)]
    gui: bool,
    /// Skip tests, validation and the health check.
    #[clap(long)]
    quick: bool,
    /// Kill whatever holds the preferred port before starting.
    #[clap(long)]
    reclaim_port: bool,
}

impl StartArgs {
    fn into_options(self, config: &AppConfig) -> StartupOptions {
        let mode = self.mode.unwrap_or_else(|| {
            if is_production_env(|k| std::env::var(k).ok()) {
                Mode::Production
            } else {
                Mode::Development
            }
        });
        StartupOptions {
            skip_tests: self.skip_tests,
            skip_validation: self.skip_validation,
            skip_health_check: self.skip_health_check,
            open_browser: !self.no_browser,
            port: self.port.unwrap_or(config.dashboard.port),
            mode,
            gui: self.gui,
            quick: self.quick,
            reclaim_port: self.reclaim_port,
        }
        .normalized()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    // Missing .env files are fine; the start pipeline creates one.
    let _ = dotenvy::dotenv();
    let mut config = AppConfig::load(path)?;
    if dotenvy::from_path(config.env_path()).is_ok() {
        config.apply_env(|k| std::env::var(k).ok());
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli.config)?;

    let (console, file_prefix) = match cli.command {
        // The parent process reads the dashboard's stdout for readiness.
        Commands::Dashboard { .. } => (ConsoleTarget::Stdout, "viralcast-dashboard"),
        _ => (ConsoleTarget::Stderr, "viralcast"),
    };
    let _guard = init_logging(&LoggingOptions {
        filter: config.log_level.clone(),
        log_dir: config.file_logging.then(|| config.logs_path()),
        file_prefix: file_prefix.to_string(),
        console,
        capture: true,
    })?;

    info!(target: "viralcast::main", command = ?cli.command, "viralcast starting");

    match cli.command {
        Commands::Start(args) => {
            let options = args.into_options(&config);
            start(config, options, &cli.config).await
        }
        Commands::Validate => {
            let validator = SetupValidator::new(config, EnvSnapshot::from_process())?;
            let report = validator.run().await;
            print!("{}", report.render());
            Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Health { no_save } => {
            let metrics = Arc::new(MetricsCollector::new(config.project_dir.clone()));
            let checker = HealthChecker::new(config, EnvSnapshot::from_process())?.with_metrics(metrics);
            let report = checker.check().await;
            if !no_save {
                let path = checker.persist(&report)?;
                info!(target: "viralcast::main", path = %path.display(), "Health report saved");
            }
            print_health(&report);
            Ok(if report.status == HealthStatus::Unhealthy {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::Dashboard { port, host } => {
            let host = host.unwrap_or_else(|| config.dashboard.host.clone());
            let port = port.unwrap_or(config.dashboard.port);
            serve_dashboard(config, &host, port).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn start(config: AppConfig, options: StartupOptions, config_file: &Path) -> Result<ExitCode> {
    let supervisor = ProcessSupervisor::new();

    if options.gui {
        let command = StartupCommand::current_exe(Some(config_file))?;
        serve_launcher(config, supervisor, command, options.open_browser).await?;
        return Ok(ExitCode::SUCCESS);
    }

    // One set of listeners for the whole run, so no signal falls between waits.
    let mut signals = ShutdownSignals::install()?;
    let ports = Arc::new(PortAllocator::new());
    let (updates, progress) = broadcast::channel::<StepUpdate>(64);
    let dashboard = DashboardLaunch::current_exe(Some(config_file)).context("Failed to prepare dashboard command")?;
    let sequencer = StartupSequencer::new(config, options, supervisor, ports, dashboard).with_updates(updates);
    let printer = ProgressPrinter::spawn(progress, print_step);

    let summary = tokio::select! {
        summary = sequencer.run() => summary,
        signal = signals.recv() => {
            warn!(target: "viralcast::main", signal, "Interrupted during startup, cleaning up");
            sequencer.cleanup().await;
            printer.finish().await;
            return Ok(ExitCode::from(130));
        }
    };
    printer.finish().await;
    print_summary(&summary);

    if !summary.success {
        return Ok(ExitCode::FAILURE);
    }

    if let Some(url) = &summary.dashboard_url {
        println!("\n{} {} (Ctrl+C to stop)", "viralcast is running:".green().bold(), url);
    }
    match sequencer.serve_until_shutdown(&mut signals).await? {
        ShutdownReason::Signal(_) => Ok(ExitCode::SUCCESS),
        ShutdownReason::DashboardExited => Ok(ExitCode::FAILURE),
    }
}

/// Prints step updates as they arrive. `finish` drains whatever the pipeline
/// published before returning.
struct ProgressPrinter {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ProgressPrinter {
    fn spawn<F>(mut progress: broadcast::Receiver<StepUpdate>, mut sink: F) -> Self
    where
        F: FnMut(&StepUpdate) + Send + 'static,
    {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = progress.recv() => match update {
                        Ok(update) => sink(&update),
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return,
                    },
                    _ = &mut stopped => break,
                }
            }
            loop {
                match progress.try_recv() {
                    Ok(update) => sink(&update),
                    Err(TryRecvError::Lagged(_)) => {}
                    Err(_) => break,
                }
            }
        });
        Self { stop, task }
    }

    async fn finish(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

fn print_step(update: &StepUpdate) {
    let label = update.step.label();
    let message = update.message.as_deref().unwrap_or("");
    match update.state {
        StepState::Running => eprintln!("{} {}...", "›".cyan(), label),
        StepState::Succeeded => {
            eprintln!("{} {}: {}", "✔".green(), label, message);
            for warning in &update.warnings {
                eprintln!("    {} {}", "⚠".yellow(), warning);
            }
        }
        StepState::Skipped => eprintln!("{} {}: {}", "–".dimmed(), label, message.dimmed()),
        StepState::Failed => eprintln!("{} {}: {}", "✘".red(), label, message.red()),
        StepState::Pending => {}
    }
}

fn summary_headline(summary: &StartupSummary) -> String {
    let warnings: usize = summary.steps.iter().map(|s| s.warnings.len()).sum();
    format!(
        "startup {} in {:.1}s ({} warnings)",
        if summary.success { "finished" } else { "failed" },
        summary.duration_ms as f64 / 1000.0,
        warnings
    )
}

/// One `label: warning` line per warning, in step order.
fn summary_warnings(summary: &StartupSummary) -> Vec<String> {
    summary
        .steps
        .iter()
        .flat_map(|record| {
            record
                .warnings
                .iter()
                .map(move |warning| format!("{}: {}", record.step.label(), warning))
        })
        .collect()
}

fn print_summary(summary: &StartupSummary) {
    let line = summary_headline(summary);
    if summary.success {
        eprintln!("\n{}", line.green().bold());
    } else {
        eprintln!("\n{}", line.red().bold());
        if let Some(failure) = &summary.failure {
            eprintln!("  {}", failure.red());
        }
    }
    for warning in summary_warnings(summary) {
        eprintln!("  {} {}", "⚠".yellow(), warning);
    }
}

fn print_health(report: &HealthReport) {
    let status = match report.status {
        HealthStatus::Healthy => "HEALTHY".green().bold(),
        HealthStatus::Degraded => "DEGRADED".yellow().bold(),
        HealthStatus::Unhealthy => "UNHEALTHY".red().bold(),
    };
    println!("{} ({}ms)", status, report.duration_ms);
    for service in &report.services {
        let mark = if service.error.is_none() { "✔".green() } else { "✘".red() };
        println!("  {} {}: {} ({}ms)", mark, service.service, service.message, service.latency_ms);
    }
    for issue in &report.warnings {
        println!("  {} {}: {}", "⚠".yellow(), issue.source, issue.message);
    }
    for issue in &report.errors {
        println!("  {} {}: {}", "✘".red(), issue.source, issue.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;
    use viralcast::startup::{StepId, StepRecord};

    fn update(step: StepId, state: StepState, warnings: Vec<String>) -> StepUpdate {
        StepUpdate {
            step,
            state,
            message: None,
            warnings,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn printer_shows_the_last_update_before_finishing() {
        let (tx, rx) = broadcast::channel(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let printer = ProgressPrinter::spawn(rx, move |u: &StepUpdate| sink.lock().unwrap().push((u.step, u.state)));

        tx.send(update(StepId::HealthCheck, StepState::Succeeded, Vec::new())).unwrap();
        tx.send(update(StepId::Dashboard, StepState::Running, Vec::new())).unwrap();
        tx.send(update(StepId::Dashboard, StepState::Succeeded, vec!["port moved".into()]))
            .unwrap();
        printer.finish().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.last(), Some(&(StepId::Dashboard, StepState::Succeeded)));
    }

    #[test]
    fn summary_lists_dashboard_warnings() {
        let summary = StartupSummary {
            success: true,
            steps: vec![
                StepRecord {
                    step: StepId::Validation,
                    state: StepState::Succeeded,
                    message: None,
                    warnings: vec!["OPENAI_API_KEY is missing".into()],
                    duration_ms: 3,
                },
                StepRecord {
                    step: StepId::Dashboard,
                    state: StepState::Succeeded,
                    message: Some("dashboard running at http://localhost:3001".into()),
                    warnings: vec!["Port 3000 is in use, using port 3001 instead".into()],
                    duration_ms: 40,
                },
            ],
            dashboard_url: Some("http://localhost:3001".into()),
            failure: None,
            duration_ms: 1500,
        };

        assert_eq!(summary_headline(&summary), "startup finished in 1.5s (2 warnings)");
        assert_eq!(
            summary_warnings(&summary),
            vec![
                "Validating configuration: OPENAI_API_KEY is missing".to_string(),
                "Starting dashboard: Port 3000 is in use, using port 3001 instead".to_string(),
            ]
        );
    }
}
