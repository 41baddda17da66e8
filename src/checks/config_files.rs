use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{CheckCategory, CheckError, CheckOutcome};
use crate::config::AppConfig;

pub const PLATFORMS_REQUIRED_KEYS: &[&str] = &["platforms"];
pub const SCHEMA_REQUIRED_KEYS: &[&str] = &["tables"];
pub const WORKFLOW_REQUIRED_KEYS: &[&str] = &["name", "nodes", "connections"];

/// Parses `path` as a JSON object and asserts each of `required_keys` exists.
pub fn check_json_file(path: &Path, required_keys: &[&str]) -> Result<Value, CheckError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CheckError::MissingConfigFile { path: display.clone() }
        } else {
            CheckError::InvalidConfigStructure {
                path: display.clone(),
                reason: format!("unreadable: {}", e),
            }
        }
    })?;

    let value: Value = serde_json::from_str(&raw).map_err(|e| CheckError::InvalidConfigStructure {
        path: display.clone(),
        reason: format!("invalid JSON: {}", e),
    })?;

    let object = value.as_object().ok_or_else(|| CheckError::InvalidConfigStructure {
        path: display.clone(),
        reason: "top-level value must be an object".to_string(),
    })?;

    let missing: Vec<&str> = required_keys
        .iter()
        .copied()
        .filter(|key| !object.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(CheckError::InvalidConfigStructure {
            path: display,
            reason: format!("missing required keys: {}", missing.join(", ")),
        });
    }

    Ok(value)
}

/// Platform names from a platforms file. Accepts `{"platforms": {name: {...}}}`,
/// `{"platforms": ["name", ...]}` or `{"platforms": [{"name": ...}, ...]}`.
pub fn load_platforms(path: &Path) -> Result<Vec<String>, CheckError> {
    let value = check_json_file(path, PLATFORMS_REQUIRED_KEYS)?;
    let invalid = |reason: &str| CheckError::InvalidConfigStructure {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    let names: Vec<String> = match &value["platforms"] {
        Value::Object(map) => map.keys().cloned().collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o.get("name").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => return Err(invalid("'platforms' must be an object or an array")),
    };

    if names.is_empty() {
        return Err(invalid("'platforms' is empty"));
    }
    Ok(names)
}

pub fn workflow_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    files.sort();
    files
}

pub fn check_workflows(dir: &Path) -> Vec<CheckOutcome> {
    if !dir.is_dir() {
        return vec![CheckOutcome::fail(
            CheckCategory::Config,
            "workflows",
            CheckError::MissingConfigFile {
                path: dir.display().to_string(),
            },
        )];
    }

    let files = workflow_files(dir);
    if files.is_empty() {
        return vec![CheckOutcome::fail(
            CheckCategory::Config,
            "workflows",
            CheckError::InvalidConfigStructure {
                path: dir.display().to_string(),
                reason: "no workflow files found".to_string(),
            },
        )];
    }

    files
        .iter()
        .map(|file| {
            let label = format!(
                "workflow:{}",
                file.file_name().and_then(|n| n.to_str()).unwrap_or("?")
            );
            match check_json_file(file, WORKFLOW_REQUIRED_KEYS) {
                Ok(value) => {
                    let nodes = value["nodes"].as_array().map(Vec::len).unwrap_or(0);
                    CheckOutcome::pass(CheckCategory::Config, label, format!("{} nodes", nodes))
                }
                Err(e) => CheckOutcome::fail(CheckCategory::Config, label, e),
            }
        })
        .collect()
}

pub fn check_config_files(config: &AppConfig) -> Vec<CheckOutcome> {
    let mut outcomes = Vec::new();

    outcomes.push(match load_platforms(&config.platforms_path()) {
        Ok(names) => CheckOutcome::pass(
            CheckCategory::Config,
            "platforms",
            format!("{} platforms configured: {}", names.len(), names.join(", ")),
        ),
        Err(e) => CheckOutcome::fail(CheckCategory::Config, "platforms", e),
    });

    outcomes.push(match check_json_file(&config.schema_path(), SCHEMA_REQUIRED_KEYS) {
        Ok(_) => CheckOutcome::pass(CheckCategory::Config, "airtable-schema", "schema file is well formed"),
        Err(e) => CheckOutcome::fail(CheckCategory::Config, "airtable-schema", e),
    });

    outcomes.extend(check_workflows(&config.workflows_path()));
    outcomes
}
