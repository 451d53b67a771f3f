use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Target every forwarded entry is logged under
pub const LOG_TARGET: &str = "fencebox::report";

/// Pipeline stage an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    PolicyCheck,
    Execution,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::PolicyCheck => "policy_check",
            Stage::Execution => "execution",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

/// One structured record attached to an [`super::ExecutionResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: Stage,
    pub level: LogLevel,
    pub message: String,
    /// Structured data as a JSON object
    pub fields: Value,
}

/// Per-run entry buffer, mirrored to the `log` facade as entries arrive
#[derive(Debug, Clone)]
pub(crate) struct RunLog {
    run_tag: String,
    entries: Vec<LogEntry>,
}

impl RunLog {
    pub(crate) fn new(run_tag: String) -> Self {
        Self {
            run_tag,
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, stage: Stage, level: LogLevel, message: &str, fields: Value) {
        log::log!(
            target: LOG_TARGET,
            log::Level::from(level),
            "[{}] {}: {} {}",
            self.run_tag,
            stage,
            message,
            fields
        );
        self.entries.push(LogEntry {
            timestamp: Utc::now(),
            stage,
            level,
            message: message.to_string(),
            fields,
        });
    }

    pub(crate) fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entries_keep_order_and_fields() {
        let mut log = RunLog::new("abcd".to_string());
        log.push(Stage::Extraction, LogLevel::Info, "started", json!({}));
        log.push(
            Stage::PolicyCheck,
            LogLevel::Warn,
            "finished",
            json!({"violations": 2}),
        );

        let entries = log.into_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].stage, Stage::Extraction);
        assert_eq!(entries[1].fields["violations"], 2);
        assert!(entries[0].timestamp <= entries[1].timestamp);
    }

    #[test]
    fn test_entry_serialises_snake_case() {
        let entry = LogEntry {
            timestamp: Utc::now(),
            stage: Stage::PolicyCheck,
            level: LogLevel::Info,
            message: "m".to_string(),
            fields: json!({"k": 1}),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["stage"], "policy_check");
        assert_eq!(json["level"], "info");
    }
}
