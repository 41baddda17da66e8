use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing;

/// A command line taken from configuration, e.g. `"npm run test:coverage"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Splits on whitespace. Quoting is not supported; wrap complex
    /// invocations in a script instead.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("terminal::command: empty command line"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Runs a command to completion in `dir`, streaming its output through tracing.
/// Returns the number of output lines seen.
pub async fn run_command_in_dir(dir: &Path, command: &CommandLine, description: &str) -> Result<usize> {
    tracing::info!(
        target: "viralcast::terminal::command",
        cwd = %dir.display(),
        command = %command.display(),
        description,
        "Executing command and waiting for completion"
    );

    let mut cmd = Command::new(&command.program);
    cmd.current_dir(dir);
    cmd.args(&command.args);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "terminal::command: Failed to spawn '{}' for {}. Ensure {} is installed and in PATH.",
            command.display(),
            description,
            command.program
        )
    })?;

    let stdout = child
        .stdout
        .take()
        .context("terminal::command: Failed to capture stdout")?;
    let stderr = child
        .stderr
        .take()
        .context("terminal::command: Failed to capture stderr")?;

    let stdout_desc = description.to_string();
    let stdout_task = tokio::spawn(async move {
        let mut count = 0usize;
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            count += 1;
            tracing::info!(target: "viralcast::terminal::command::stdout", description = %stdout_desc, "{}", line);
        }
        count
    });

    let stderr_desc = description.to_string();
    let stderr_task = tokio::spawn(async move {
        let mut count = 0usize;
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            count += 1;
            tracing::warn!(target: "viralcast::terminal::command::stderr", description = %stderr_desc, "{}", line);
        }
        count
    });

    let status = child
        .wait()
        .await
        .with_context(|| format!("terminal::command: Failed to wait for '{}'", command.display()))?;

    let lines = stdout_task.await.unwrap_or(0) + stderr_task.await.unwrap_or(0);

    if status.success() {
        tracing::info!(target: "viralcast::terminal::command", description, status = %status, "Command completed successfully.");
        Ok(lines)
    } else {
        tracing::error!(target: "viralcast::terminal::command", description, status = %status, "Command failed.");
        bail!(
            "terminal::command: '{}' ({}) exited with status: {}. Check logs for details.",
            command.display(),
            description,
            status
        )
    }
}

/// Runs `program args...` and returns trimmed stdout. Fails on non-zero exit.
pub async fn capture_output(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("terminal::command: Failed to run {} {}", program, args.join(" ")))?;

    if !output.status.success() {
        bail!(
            "terminal::command: {} {} exited with status {}: {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Parses the major component of a version string like `v20.11.1`.
pub fn parse_major_version(raw: &str) -> Option<u32> {
    raw.trim()
        .trim_start_matches('v')
        .split('.')
        .next()
        .and_then(|major| major.parse().ok())
}
