//! Checks shared by the setup validator and the health checker.
//!
//! Connectivity and configuration problems are values, not errors: every
//! check yields a [`CheckOutcome`] so callers always get a full picture.

pub mod config_files;
pub mod env_vars;
pub mod health;
pub mod services;
pub mod validator;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckError {
    #[error("missing environment variable {name}")]
    MissingEnvironmentVariable { name: String },
    #[error("{name} is malformed: {reason}")]
    MalformedCredential { name: String, reason: String },
    #[error("config file not found: {path}")]
    MissingConfigFile { path: String },
    #[error("invalid config structure in {path}: {reason}")]
    InvalidConfigStructure { path: String, reason: String },
    #[error("{service} rejected the credentials (HTTP {status})")]
    ApiAuthenticationFailed { service: String, status: u16 },
    #[error("{service} is unreachable: {reason}")]
    ApiUnreachable { service: String, reason: String },
    #[error("{service} is rate limiting requests{}", retry_after_suffix(.retry_after))]
    RateLimited {
        service: String,
        retry_after: Option<u64>,
    },
    #[error("{service} returned HTTP {status}: {message}")]
    UnexpectedStatus {
        service: String,
        status: u16,
        message: String,
    },
}

fn retry_after_suffix(retry_after: &Option<u64>) -> String {
    match retry_after {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckCategory {
    Environment,
    Config,
    Service,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check: String,
    pub category: CheckCategory,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CheckError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl CheckOutcome {
    pub fn pass(category: CheckCategory, check: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            category,
            success: true,
            message: message.into(),
            error: None,
            latency_ms: None,
        }
    }

    pub fn fail(category: CheckCategory, check: impl Into<String>, error: CheckError) -> Self {
        Self {
            check: check.into(),
            category,
            success: false,
            message: error.to_string(),
            error: Some(error),
            latency_ms: None,
        }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_message_mentions_retry_after() {
        let err = CheckError::RateLimited {
            service: "openai".into(),
            retry_after: Some(30),
        };
        assert_eq!(err.to_string(), "openai is rate limiting requests (retry after 30s)");
    }

    #[test]
    fn errors_serialize_with_kind_tag() {
        let err = CheckError::MissingEnvironmentVariable {
            name: "OPENAI_API_KEY".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "missing_environment_variable");
        assert_eq!(json["name"], "OPENAI_API_KEY");
    }
}
