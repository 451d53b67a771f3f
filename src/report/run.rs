// Per-call state machine
//
// Extracting -> PolicyChecking -> Running
//
// Each transition consumes the previous state. Terminal outcomes are produced
// by the state they belong to (`no_fragment` only while extracting, `denied`
// only while policy checking, `finished` only while running), and they
// consume the run, so no stage can be skipped or re-entered.

use super::entry::{LogLevel, RunLog, Stage};
use super::{ExecutionOutcome, ExecutionResult};
use crate::config::types::Policy;
use crate::extract::Fragment;
use crate::observability::metrics::get_metrics;
use crate::policy::{Violation, VettedUnit};
use crate::runner::RunReport;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::marker::PhantomData;
use std::time::Instant;
use uuid::Uuid;

/// Type-state marker: scanning the raw text
pub struct Extracting;

/// Type-state marker: a fragment was selected and is being vetted
pub struct PolicyChecking;

/// Type-state marker: a vetted unit is executing
pub struct Running;

/// One call in progress; `S` is the stage it is in
///
/// A run cannot be finished before its unit was vetted:
///
/// ```compile_fail
/// use fencebox::report::Run;
/// use fencebox::Policy;
///
/// let run = Run::start(&Policy::default());
/// run.denied(Vec::new());
/// ```
///
/// and a consumed state cannot be used again:
///
/// ```compile_fail
/// use fencebox::report::Run;
/// use fencebox::Policy;
///
/// let run = Run::start(&Policy::default());
/// let _failed = run.no_fragment("none".to_string(), 0);
/// run.no_fragment("again".to_string(), 0);
/// ```
pub struct Run<S> {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    policy: Policy,
    fragment: Option<Fragment>,
    log: RunLog,
    _state: PhantomData<S>,
}

impl<S> Run<S> {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn advance<T>(self) -> Run<T> {
        Run {
            run_id: self.run_id,
            started_at: self.started_at,
            started: self.started,
            policy: self.policy,
            fragment: self.fragment,
            log: self.log,
            _state: PhantomData,
        }
    }

    fn finish(self, outcome: ExecutionOutcome) -> ExecutionResult {
        let duration = self.started.elapsed();
        get_metrics().record_outcome(&outcome, duration);

        ExecutionResult {
            run_id: self.run_id,
            fragment: self.fragment,
            policy_snapshot: self.policy,
            outcome,
            started_at: self.started_at,
            duration,
            log_entries: self.log.into_entries(),
        }
    }
}

impl Run<Extracting> {
    /// Open a run; the policy is snapshotted here
    pub fn start(policy: &Policy) -> Self {
        let run_id = Uuid::new_v4();
        let mut log = RunLog::new(run_id.simple().to_string()[..8].to_string());
        log.push(
            Stage::Extraction,
            LogLevel::Info,
            "extraction started",
            json!({}),
        );

        Run {
            run_id,
            started_at: Utc::now(),
            started: Instant::now(),
            policy: policy.clone(),
            fragment: None,
            log,
            _state: PhantomData,
        }
    }

    /// Terminal: nothing usable was found
    pub fn no_fragment(mut self, reason: String, fragments_found: usize) -> ExecutionResult {
        self.log.push(
            Stage::Extraction,
            LogLevel::Warn,
            "extraction finished without a usable fragment",
            json!({ "fragments_found": fragments_found, "reason": reason }),
        );
        self.finish(ExecutionOutcome::ExtractionFailed { reason })
    }

    pub fn fragment_selected(mut self, fragment: Fragment) -> Run<PolicyChecking> {
        self.log.push(
            Stage::Extraction,
            LogLevel::Info,
            "extraction finished",
            json!({
                "fragment_index": fragment.index,
                "language_tag": fragment.language_tag,
                "source_span": [fragment.source_span.0, fragment.source_span.1],
                "bytes": fragment.text.len(),
            }),
        );
        self.log.push(
            Stage::PolicyCheck,
            LogLevel::Info,
            "policy check started",
            json!({
                "allowed_modules": self.policy.allowed_modules.len(),
                "denied_names": self.policy.denied_names.len(),
            }),
        );
        self.fragment = Some(fragment);
        self.advance()
    }
}

impl Run<PolicyChecking> {
    /// Terminal: the fragment broke the policy
    pub fn denied(mut self, violations: Vec<Violation>) -> ExecutionResult {
        let rules: Vec<&str> = violations.iter().map(|v| v.rule.as_str()).collect();
        self.log.push(
            Stage::PolicyCheck,
            LogLevel::Warn,
            "policy check finished",
            json!({ "violation_count": violations.len(), "rules": rules }),
        );
        self.finish(ExecutionOutcome::PolicyDenied { violations })
    }

    pub fn vetted(mut self, unit: &VettedUnit) -> Run<Running> {
        self.log.push(
            Stage::PolicyCheck,
            LogLevel::Info,
            "policy check finished",
            json!({ "violation_count": 0, "digest": unit.digest() }),
        );
        self.log.push(
            Stage::Execution,
            LogLevel::Info,
            "run started",
            json!({
                "max_wall_time_ms": self.policy.max_wall_time.as_millis() as u64,
                "max_cpu_time_ms": self.policy.max_cpu_time.as_millis() as u64,
                "max_memory_bytes": self.policy.max_memory_bytes,
                "capture_artifacts": self.policy.capture_artifacts,
            }),
        );
        self.advance()
    }
}

impl Run<Running> {
    /// Terminal: the worker reached an outcome
    pub fn finished(mut self, report: RunReport) -> ExecutionResult {
        let level = if report.outcome.is_completed() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let usage = serde_json::to_value(&report.usage).unwrap_or_else(|_| json!({}));
        self.log.push(
            Stage::Execution,
            level,
            &format!("run finished: {}", report.outcome.status()),
            usage,
        );
        self.finish(report.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Location, ViolationRule};

    fn fragment() -> Fragment {
        Fragment {
            text: "print(1)".to_string(),
            source_span: (10, 18),
            language_tag: Some("python".to_string()),
            index: 0,
        }
    }

    #[test]
    fn test_extraction_failure_has_no_fragment() {
        let result = Run::start(&Policy::default()).no_fragment("no code".to_string(), 0);
        assert!(result.fragment.is_none());
        assert_eq!(
            result.outcome,
            ExecutionOutcome::ExtractionFailed {
                reason: "no code".to_string()
            }
        );
        assert_eq!(result.log_entries.len(), 2);
        assert!(result
            .log_entries
            .iter()
            .all(|e| e.stage == Stage::Extraction));
    }

    #[test]
    fn test_denied_records_violation_count() {
        let violation = Violation {
            location: Location { line: 1, column: 1 },
            rule: ViolationRule::DeniedImport,
            detail: "os".to_string(),
        };
        let result = Run::start(&Policy::default())
            .fragment_selected(fragment())
            .denied(vec![violation]);

        assert_eq!(result.fragment, Some(fragment()));
        let last = result.log_entries.last().unwrap();
        assert_eq!(last.stage, Stage::PolicyCheck);
        assert_eq!(last.fields["violation_count"], 1);
        assert_eq!(last.fields["rules"][0], "denied_import");
    }

    #[test]
    fn test_policy_is_snapshotted() {
        let policy = Policy::default().allow_module("numpy");
        let result = Run::start(&policy).no_fragment("none".to_string(), 0);
        assert_eq!(result.policy_snapshot, policy);
        assert!(result.duration >= std::time::Duration::ZERO);
    }
}
