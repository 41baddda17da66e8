use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use sysinfo::System;

use crate::config::{AppConfig, RequirementsConfig};
use crate::terminal::command::{capture_output, parse_major_version, CommandLine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvFileState {
    Present,
    CreatedFromTemplate,
}

/// Fails when the runtime is missing or older than the configured major.
pub async fn check_runtime(requirements: &RequirementsConfig) -> Result<String> {
    let command = CommandLine::parse(&requirements.runtime_version_command)?;
    let program = command.program.as_str();
    let args: Vec<&str> = command.args.iter().map(String::as_str).collect();
    let raw = capture_output(program, &args)
        .await
        .with_context(|| format!("{} is not installed or not in PATH", program))?;
    let major = parse_major_version(&raw)
        .with_context(|| format!("Could not parse {} version from '{}'", program, raw))?;
    if major < requirements.min_runtime_major {
        bail!(
            "{} {} is too old; version {} or newer is required",
            program,
            raw,
            requirements.min_runtime_major
        );
    }
    Ok(format!("{} {}", program, raw))
}

/// Low memory is reported, not fatal.
pub fn check_memory(requirements: &RequirementsConfig) -> (String, bool) {
    let mut system = System::new();
    system.refresh_memory();
    let available_mb = system.available_memory() / (1024 * 1024);
    if available_mb < requirements.min_free_memory_mb {
        (
            format!(
                "only {}MB free memory (recommended {}MB)",
                available_mb, requirements.min_free_memory_mb
            ),
            false,
        )
    } else {
        (format!("{}MB free memory", available_mb), true)
    }
}

/// Writes and removes a probe file to prove the project dir is writable.
pub fn check_disk_access(dir: &Path) -> Result<()> {
    let probe = dir.join(format!(".viralcast-write-test-{}", std::process::id()));
    fs::write(&probe, b"ok").with_context(|| format!("Cannot write to {}", dir.display()))?;
    fs::remove_file(&probe).with_context(|| format!("Cannot remove probe file {}", probe.display()))?;
    Ok(())
}

/// Creates the env file from the template when absent. A missing template
/// is fatal.
pub fn ensure_env_file(env_path: &Path, template_path: &Path) -> Result<EnvFileState> {
    if env_path.exists() {
        return Ok(EnvFileState::Present);
    }
    if !template_path.exists() {
        bail!(
            "{} is missing and no template exists at {}",
            env_path.display(),
            template_path.display()
        );
    }

    fs::copy(template_path, env_path).with_context(|| {
        format!(
            "Failed to create {} from {}",
            env_path.display(),
            template_path.display()
        )
    })?;
    tracing::warn!(
        target: "viralcast::startup::requirements",
        path = %env_path.display(),
        "Created env file from template; fill in your API credentials."
    );

    if let Err(e) = dotenvy::from_path(env_path) {
        tracing::warn!(target: "viralcast::startup::requirements", error = %e, "Could not load newly created env file");
    }
    Ok(EnvFileState::CreatedFromTemplate)
}

/// All requirement checks; returns a status line plus any warnings.
pub async fn check_requirements(config: &AppConfig) -> Result<(String, Vec<String>)> {
    let runtime = check_runtime(&config.requirements).await?;
    let (memory, memory_ok) = check_memory(&config.requirements);
    check_disk_access(&config.project_dir)?;
    let env_state = ensure_env_file(&config.env_path(), &config.env_template_path())?;

    let mut warnings = Vec::new();
    if !memory_ok {
        warnings.push(memory.clone());
    }
    if env_state == EnvFileState::CreatedFromTemplate {
        warnings.push(format!("{} created from template", config.env_file.display()));
    }

    let env_note = match env_state {
        EnvFileState::Present => "env file present",
        EnvFileState::CreatedFromTemplate => "env file created",
    };
    Ok((format!("{}, {}, disk writable, {}", runtime, memory, env_note), warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn env_file_is_created_from_template_once() {
        let dir = tempdir().unwrap();
        let env = dir.path().join(".env");
        let template = dir.path().join(".env.example");
        std::fs::write(&template, "VIRALCAST_TEMPLATE_MARKER=1\n").unwrap();

        assert_eq!(ensure_env_file(&env, &template).unwrap(), EnvFileState::CreatedFromTemplate);
        assert_eq!(std::fs::read_to_string(&env).unwrap(), "VIRALCAST_TEMPLATE_MARKER=1\n");
        assert_eq!(ensure_env_file(&env, &template).unwrap(), EnvFileState::Present);
    }

    #[test]
    fn missing_template_is_fatal() {
        let dir = tempdir().unwrap();
        let err = ensure_env_file(&dir.path().join(".env"), &dir.path().join(".env.example")).unwrap_err();
        assert!(err.to_string().contains("no template"));
    }

    #[test]
    fn disk_probe_leaves_no_trace() {
        let dir = tempdir().unwrap();
        check_disk_access(dir.path()).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(check_disk_access(&dir.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn runtime_version_is_enforced() {
        let missing = RequirementsConfig {
            runtime_version_command: "viralcast-no-such-runtime --version".into(),
            ..Default::default()
        };
        assert!(check_runtime(&missing).await.is_err());

        let old = RequirementsConfig {
            runtime_version_command: "echo v16.20.0".into(),
            ..Default::default()
        };
        assert!(check_runtime(&old).await.unwrap_err().to_string().contains("too old"));

        let current = RequirementsConfig {
            runtime_version_command: "echo v20.11.1".into(),
            ..Default::default()
        };
        assert_eq!(check_runtime(&current).await.unwrap(), "echo v20.11.1");
    }
}
