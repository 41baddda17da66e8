use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Mutex;
use tokio::sync::broadcast;

pub const DEFAULT_LOG_CAPACITY: usize = 1000;
pub const MIN_LOG_CAPACITY: usize = 200;
const LIVE_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        if level == tracing::Level::ERROR {
            LogLevel::Error
        } else if level == tracing::Level::WARN {
            LogLevel::Warn
        } else if level == tracing::Level::INFO {
            LogLevel::Info
        } else if level == tracing::Level::DEBUG {
            LogLevel::Debug
        } else {
            LogLevel::Trace
        }
    }
}

impl LogLevel {
    /// Finds the level token a tracing-style console line carries, if any.
    pub fn detect(line: &str) -> Option<LogLevel> {
        line.split(|c: char| !c.is_ascii_alphabetic())
            .filter(|word| !word.is_empty())
            .take(6)
            .find_map(|word| match word {
                "ERROR" => Some(LogLevel::Error),
                "WARN" => Some(LogLevel::Warn),
                "INFO" => Some(LogLevel::Info),
                "DEBUG" => Some(LogLevel::Debug),
                "TRACE" => Some(LogLevel::Trace),
                _ => None,
            })
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LogFilterOptions {
    /// Keep entries at this severity or more severe.
    pub min_level: Option<LogLevel>,
    pub content_contains: Option<String>,
    pub since_timestamp: Option<DateTime<Utc>>,
    /// Keep only the most recent N matches.
    pub max_entries: Option<usize>,
}

/// Bounded in-memory ring of recent log lines with a live feed.
pub struct LogStore {
    inner: Mutex<Ring>,
    live: broadcast::Sender<LogEntry>,
}

struct Ring {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl LogStore {
    pub fn with_capacity(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Ring {
                capacity: capacity.max(1),
                entries: VecDeque::with_capacity(capacity.max(1)),
            }),
            live,
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        let mut ring = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        ring.capacity = capacity.max(1);
        while ring.entries.len() > ring.capacity {
            ring.entries.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).capacity
    }

    pub fn push(&self, entry: LogEntry) {
        {
            let mut ring = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if ring.entries.len() >= ring.capacity {
                ring.entries.pop_front();
            }
            ring.entries.push_back(entry.clone());
        }
        let _ = self.live.send(entry);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.live.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Matching entries, oldest first.
    pub fn query(&self, filters: &LogFilterOptions) -> Vec<LogEntry> {
        let ring = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let needle = filters.content_contains.as_ref().map(|c| c.to_lowercase());

        let mut matched: Vec<LogEntry> = ring
            .entries
            .iter()
            .rev()
            .filter(|entry| filters.min_level.map_or(true, |min| entry.level <= min))
            .filter(|entry| {
                needle
                    .as_ref()
                    .map_or(true, |n| entry.message.to_lowercase().contains(n))
            })
            .filter(|entry| filters.since_timestamp.map_or(true, |since| entry.timestamp >= since))
            .take(filters.max_entries.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        matched.reverse();
        matched
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).entries.clear();
    }
}

/// Process-wide store fed by the tracing capture layer.
pub static SHARED_LOG_STORE: Lazy<LogStore> = Lazy::new(|| LogStore::with_capacity(DEFAULT_LOG_CAPACITY));

pub fn add_log_entry(level: LogLevel, target: &str, message: String) {
    SHARED_LOG_STORE.push(LogEntry {
        timestamp: Utc::now(),
        level,
        target: target.to_string(),
        message,
    });
}

pub fn get_shared_logs(filters: &LogFilterOptions) -> Vec<LogEntry> {
    SHARED_LOG_STORE.query(filters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_console_levels() {
        assert_eq!(
            LogLevel::detect("2026-10-17T09:00:00.123Z  INFO viralcast::startup: Running tests..."),
            Some(LogLevel::Info)
        );
        assert_eq!(
            LogLevel::detect("\u{1b}[2m2026-10-17T09:00:00Z\u{1b}[0m \u{1b}[33m WARN\u{1b}[0m viralcast: slow"),
            Some(LogLevel::Warn)
        );
        assert_eq!(LogLevel::detect("plain output from a script"), None);
    }

    fn entry(level: LogLevel, message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level,
            target: "test".to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn ring_drops_oldest_entries() {
        let store = LogStore::with_capacity(3);
        for i in 0..5 {
            store.push(entry(LogLevel::Info, &format!("line {}", i)));
        }
        let all = store.query(&LogFilterOptions::default());
        let messages: Vec<_> = all.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn filters_by_minimum_level_and_limit() {
        let store = LogStore::with_capacity(10);
        store.push(entry(LogLevel::Error, "boom"));
        store.push(entry(LogLevel::Info, "hello"));
        store.push(entry(LogLevel::Warn, "careful"));
        store.push(entry(LogLevel::Debug, "noise"));
        store.push(entry(LogLevel::Warn, "again"));

        let warnings = store.query(&LogFilterOptions {
            min_level: Some(LogLevel::Warn),
            ..Default::default()
        });
        let messages: Vec<_> = warnings.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["boom", "careful", "again"]);

        let latest_two = store.query(&LogFilterOptions {
            max_entries: Some(2),
            ..Default::default()
        });
        let messages: Vec<_> = latest_two.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["noise", "again"]);
    }

    #[test]
    fn content_filter_is_case_insensitive() {
        let store = LogStore::with_capacity(10);
        store.push(entry(LogLevel::Info, "Dashboard LISTENING"));
        store.push(entry(LogLevel::Info, "other"));
        let found = store.query(&LogFilterOptions {
            content_contains: Some("listening".into()),
            ..Default::default()
        });
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn shrinking_capacity_truncates() {
        let store = LogStore::with_capacity(5);
        for i in 0..5 {
            store.push(entry(LogLevel::Info, &i.to_string()));
        }
        store.set_capacity(2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.capacity(), 2);
    }

    #[tokio::test]
    async fn live_subscribers_receive_new_entries() {
        let store = LogStore::with_capacity(5);
        let mut rx = store.subscribe();
        store.push(entry(LogLevel::Warn, "live"));
        assert_eq!(rx.recv().await.unwrap().message, "live");
    }

    #[test]
    fn parses_level_names() {
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
