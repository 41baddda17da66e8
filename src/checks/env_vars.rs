use std::collections::HashMap;

use super::{CheckCategory, CheckError, CheckOutcome};

#[derive(Debug, Clone, Copy)]
pub struct CredentialSpec {
    pub name: &'static str,
    pub service: &'static str,
    pub prefix: Option<&'static str>,
}

pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const AIRTABLE_API_KEY: &str = "AIRTABLE_API_KEY";
pub const AIRTABLE_BASE_ID: &str = "AIRTABLE_BASE_ID";
pub const APIFY_API_TOKEN: &str = "APIFY_API_TOKEN";
pub const N8N_API_KEY: &str = "N8N_API_KEY";
pub const NOTIFICATION_EMAIL: &str = "NOTIFICATION_EMAIL";

pub const CREDENTIALS: &[CredentialSpec] = &[
    CredentialSpec {
        name: OPENAI_API_KEY,
        service: "openai",
        prefix: Some("sk-"),
    },
    CredentialSpec {
        name: AIRTABLE_API_KEY,
        service: "airtable",
        prefix: Some("pat"),
    },
    CredentialSpec {
        name: AIRTABLE_BASE_ID,
        service: "airtable",
        prefix: Some("app"),
    },
    CredentialSpec {
        name: APIFY_API_TOKEN,
        service: "apify",
        prefix: Some("apify_api_"),
    },
    CredentialSpec {
        name: N8N_API_KEY,
        service: "n8n",
        prefix: None,
    },
];

/// A frozen view of the environment, so checks are reproducible in tests.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// The trimmed value, or `None` when unset or blank.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str, CheckError> {
        self.get(key).ok_or_else(|| CheckError::MissingEnvironmentVariable {
            name: key.to_string(),
        })
    }
}

/// Shows the first few characters only.
pub fn mask_secret(value: &str) -> String {
    let visible: String = value.chars().take(4).collect();
    if value.chars().count() <= 8 {
        "****".to_string()
    } else {
        format!("{}****", visible)
    }
}

pub fn check_credential(env: &EnvSnapshot, spec: &CredentialSpec) -> Result<String, CheckError> {
    let value = env.require(spec.name)?;
    if let Some(prefix) = spec.prefix {
        if !value.starts_with(prefix) {
            return Err(CheckError::MalformedCredential {
                name: spec.name.to_string(),
                reason: format!("expected value starting with '{}'", prefix),
            });
        }
    }
    Ok(mask_secret(value))
}

/// `Ok(None)` when the optional address is unset.
pub fn check_notification_email(env: &EnvSnapshot) -> Result<Option<String>, CheckError> {
    match env.get(NOTIFICATION_EMAIL) {
        None => Ok(None),
        Some(addr) => {
            let valid = addr
                .split_once('@')
                .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
                .unwrap_or(false);
            if valid {
                Ok(Some(addr.to_string()))
            } else {
                Err(CheckError::MalformedCredential {
                    name: NOTIFICATION_EMAIL.to_string(),
                    reason: "expected an email address".to_string(),
                })
            }
        }
    }
}

pub fn check_environment(env: &EnvSnapshot) -> Vec<CheckOutcome> {
    let mut outcomes: Vec<CheckOutcome> = CREDENTIALS
        .iter()
        .map(|spec| match check_credential(env, spec) {
            Ok(masked) => CheckOutcome::pass(
                CheckCategory::Environment,
                spec.name,
                format!("{} is set ({})", spec.name, masked),
            ),
            Err(e) => CheckOutcome::fail(CheckCategory::Environment, spec.name, e),
        })
        .collect();

    outcomes.push(match check_notification_email(env) {
        Ok(Some(addr)) => CheckOutcome::pass(
            CheckCategory::Environment,
            NOTIFICATION_EMAIL,
            format!("notifications go to {}", addr),
        ),
        Ok(None) => CheckOutcome::pass(
            CheckCategory::Environment,
            NOTIFICATION_EMAIL,
            "not set, email notifications disabled",
        ),
        Err(e) => CheckOutcome::fail(CheckCategory::Environment, NOTIFICATION_EMAIL, e),
    });

    outcomes
}
