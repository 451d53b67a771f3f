//! Outcome reporting
//!
//! Every call produces exactly one [`ExecutionResult`]. The stages append
//! [`LogEntry`] records as they start and finish; the result carries them in
//! order, together with the policy snapshot and the terminal
//! [`ExecutionOutcome`].

mod entry;
mod outcome;
mod run;

pub use entry::{LogEntry, LogLevel, Stage, LOG_TARGET};
pub use outcome::ExecutionOutcome;
pub use run::{Extracting, PolicyChecking, Run, Running};

use crate::config::types::Policy;
use crate::extract::Fragment;
use crate::policy::Violation;
use crate::runner::relay::Artifact;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// The record returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    /// `None` only when extraction failed
    pub fragment: Option<Fragment>,
    pub policy_snapshot: Policy,
    pub outcome: ExecutionOutcome,
    pub started_at: DateTime<Utc>,
    #[serde(with = "crate::config::types::duration_ms", rename = "duration_ms")]
    pub duration: Duration,
    pub log_entries: Vec<LogEntry>,
}

impl ExecutionResult {
    pub fn is_completed(&self) -> bool {
        self.outcome.is_completed()
    }

    pub fn stdout(&self) -> Option<&str> {
        match &self.outcome {
            ExecutionOutcome::Completed { stdout, .. } => Some(stdout),
            _ => None,
        }
    }

    pub fn artifacts(&self) -> &[Artifact] {
        match &self.outcome {
            ExecutionOutcome::Completed { artifacts, .. } => artifacts,
            _ => &[],
        }
    }

    pub fn violations(&self) -> &[Violation] {
        match &self.outcome {
            ExecutionOutcome::PolicyDenied { violations } => violations,
            _ => &[],
        }
    }

    /// One line for humans
    pub fn summary(&self) -> String {
        let fragment = match &self.fragment {
            Some(fragment) => format!("fragment {}", fragment.index),
            None => "no fragment".to_string(),
        };
        format!(
            "run {} ({}): {} in {}ms",
            &self.run_id.simple().to_string()[..8],
            fragment,
            self.outcome,
            self.duration.as_millis()
        )
    }
}
