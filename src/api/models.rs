use chrono::{DateTime, Utc};
use poem_openapi::Object;
use serde::{Deserialize, Serialize};

use crate::runtime::log::LogEntry;

#[derive(Debug, Clone, Object, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    pub level: String,
    pub target: String,
    pub message: String,
}

impl From<LogEntry> for LogLine {
    fn from(entry: LogEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            level: serde_json::to_value(entry.level)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            target: entry.target,
            message: entry.message,
        }
    }
}

#[derive(Debug, Clone, Object, Serialize, Deserialize)]
pub struct LogsResponse {
    pub count: usize,
    /// Oldest first.
    pub logs: Vec<LogLine>,
}

#[derive(Debug, Clone, Object, Serialize, Deserialize)]
pub struct WorkflowFileInfo {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Object, Serialize, Deserialize)]
pub struct WorkflowsResponse {
    pub directory: String,
    /// Whether the workflows directory exists at all.
    pub present: bool,
    pub workflows: Vec<WorkflowFileInfo>,
}

#[derive(Debug, Clone, Object, Serialize, Deserialize)]
pub struct TestWorkflowRequest {
    /// Platform name, e.g. `tiktok`.
    pub platform: String,
}

#[derive(Debug, Clone, Object, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}
