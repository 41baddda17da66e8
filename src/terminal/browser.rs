use anyhow::{bail, Context, Result};
use backoff::{future::retry_notify, Error as BackoffError, ExponentialBackoff};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing;
use url::Url;

use super::command::CommandLine;

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Browser executable or application name. `None` uses the system default.
    pub browser: Option<String>,
    /// Poll the URL until it answers before opening it.
    pub wait_until_ready: bool,
    pub ready_timeout: Duration,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            browser: None,
            wait_until_ready: true,
            ready_timeout: Duration::from_secs(30),
        }
    }
}

fn validate_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("terminal::browser: invalid URL '{}'", raw))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => bail!("terminal::browser: refusing to open '{}' URL {}", other, raw),
    }
}

/// The command used to open `url` on this platform.
pub fn browser_command(url: &Url, browser: Option<&str>) -> CommandLine {
    let url = url.to_string();
    if cfg!(target_os = "macos") {
        match browser {
            Some(app) => CommandLine {
                program: "open".into(),
                args: vec!["-a".into(), app.into(), url],
            },
            None => CommandLine {
                program: "open".into(),
                args: vec![url],
            },
        }
    } else if cfg!(target_os = "windows") {
        let mut args = vec!["/C".to_string(), "start".to_string(), "\"\"".to_string()];
        if let Some(app) = browser {
            args.push(app.to_string());
        }
        args.push(url);
        CommandLine {
            program: "cmd".into(),
            args,
        }
    } else {
        CommandLine {
            program: browser.unwrap_or("xdg-open").to_string(),
            args: vec![url],
        }
    }
}

/// Polls `url` until any HTTP response comes back or `timeout` elapses.
pub async fn wait_for_url(url: &str, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .context("terminal::browser: failed to build HTTP client")?;

    let backoff_strategy = ExponentialBackoff {
        initial_interval: Duration::from_millis(250),
        max_interval: Duration::from_secs(2),
        max_elapsed_time: Some(timeout),
        ..ExponentialBackoff::default()
    };

    let operation = || async {
        client
            .get(url)
            .send()
            .await
            .map(|_| ())
            .map_err(BackoffError::transient)
    };

    let notify = |err: reqwest::Error, dur: Duration| {
        tracing::debug!(target: "viralcast::terminal::browser", url, retry_in = ?dur, error = %err, "URL not ready yet.");
    };

    retry_notify(backoff_strategy, operation, notify)
        .await
        .with_context(|| format!("terminal::browser: {} did not respond within {:?}", url, timeout))
}

/// Opens `url` in a browser. Launch failures are returned, never retried.
pub async fn open_url(url: &str, options: &BrowserOptions) -> Result<()> {
    let parsed = validate_url(url)?;

    if options.wait_until_ready {
        wait_for_url(url, options.ready_timeout).await?;
    }

    let command = browser_command(&parsed, options.browser.as_deref());
    tracing::info!(target: "viralcast::terminal::browser", url, command = %command.display(), "Opening browser.");

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("terminal::browser: failed to launch '{}'", command.program))?;

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if !status.success() => {
                tracing::warn!(target: "viralcast::terminal::browser", status = %status, "Browser launcher exited with failure.");
            }
            Err(e) => {
                tracing::warn!(target: "viralcast::terminal::browser", error = %e, "Failed to wait for browser launcher.");
            }
            _ => {}
        }
    });
    Ok(())
}
