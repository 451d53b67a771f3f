use crate::policy::Violation;
use crate::runner::relay::Artifact;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Terminal outcome of one call
///
/// Exactly one variant is populated per result; a limit breach is always
/// `TimedOut` or `MemoryExceeded`, never `Completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed {
        stdout: String,
        stderr: String,
        artifacts: Vec<Artifact>,
        return_summary: Option<String>,
    },
    TimedOut {
        #[serde(with = "crate::config::types::duration_ms", rename = "elapsed_ms")]
        elapsed: Duration,
    },
    MemoryExceeded {
        peak_bytes: u64,
    },
    PolicyDenied {
        violations: Vec<Violation>,
    },
    ExtractionFailed {
        reason: String,
    },
    RuntimeFailed {
        exception_type: String,
        message: String,
        traceback: String,
    },
}

impl ExecutionOutcome {
    /// Stable snake_case name, also used as the metrics label
    pub fn status(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed { .. } => "completed",
            ExecutionOutcome::TimedOut { .. } => "timed_out",
            ExecutionOutcome::MemoryExceeded { .. } => "memory_exceeded",
            ExecutionOutcome::PolicyDenied { .. } => "policy_denied",
            ExecutionOutcome::ExtractionFailed { .. } => "extraction_failed",
            ExecutionOutcome::RuntimeFailed { .. } => "runtime_failed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed { .. })
    }

    /// Limit breaches
    pub fn is_resource_breach(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::TimedOut { .. } | ExecutionOutcome::MemoryExceeded { .. }
        )
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionOutcome::Completed {
                stdout, artifacts, ..
            } => write!(
                f,
                "completed ({} bytes of stdout, {} artifacts)",
                stdout.len(),
                artifacts.len()
            ),
            ExecutionOutcome::TimedOut { elapsed } => {
                write!(f, "timed out after {}ms", elapsed.as_millis())
            }
            ExecutionOutcome::MemoryExceeded { peak_bytes } => {
                write!(f, "memory exceeded (peak {} bytes)", peak_bytes)
            }
            ExecutionOutcome::PolicyDenied { violations } => {
                write!(f, "policy denied ({} violations", violations.len())?;
                if let Some(first) = violations.first() {
                    write!(f, "; first: {}", first)?;
                }
                write!(f, ")")
            }
            ExecutionOutcome::ExtractionFailed { reason } => {
                write!(f, "extraction failed: {}", reason)
            }
            ExecutionOutcome::RuntimeFailed {
                exception_type,
                message,
                ..
            } => write!(f, "runtime failed: {}: {}", exception_type, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialises_with_status_tag() {
        let outcome = ExecutionOutcome::TimedOut {
            elapsed: Duration::from_millis(150),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "timed_out");
        assert_eq!(json["elapsed_ms"], 150);

        let back: ExecutionOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn test_breach_predicate() {
        assert!(ExecutionOutcome::MemoryExceeded { peak_bytes: 1 }.is_resource_breach());
        assert!(!ExecutionOutcome::ExtractionFailed {
            reason: "none".into()
        }
        .is_resource_breach());
    }

    #[test]
    fn test_display_runtime_failure() {
        let outcome = ExecutionOutcome::RuntimeFailed {
            exception_type: "ZeroDivisionError".into(),
            message: "division by zero".into(),
            traceback: String::new(),
        };
        assert_eq!(
            outcome.to_string(),
            "runtime failed: ZeroDivisionError: division by zero"
        );
        assert_eq!(outcome.status(), "runtime_failed");
    }
}
