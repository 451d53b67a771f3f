// Process-wide run metrics
//
// Counters, gauges and a latency histogram for:
// - Outcomes (completed, timed_out, memory_exceeded, policy_denied,
//   extraction_failed, runtime_failed)
// - Violation rules reported by the policy compiler
// - Artifacts relayed and output truncations
// - Active runs and end-to-end run duration
//
// Values are advisory. Nothing in the pipeline reads them back.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::policy::ViolationRule;
use crate::report::ExecutionOutcome;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge that never wraps below zero
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Increments the active-runs gauge for as long as it lives
pub struct ActiveRunGuard {
    registry: Arc<MetricsRegistry>,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.registry.active_runs.dec();
    }
}

#[derive(Debug)]
pub struct HistogramBucket {
    /// Upper bound in seconds
    pub le: f64,
    pub count: AtomicU64,
}

/// Cumulative latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Buckets from 10ms to 60s, covering interpreter start-up through the
    /// longest sensible wall limit
    pub fn new_latency() -> Self {
        let buckets = [0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
            .into_iter()
            .map(|le| HistogramBucket {
                le,
                count: AtomicU64::new(0),
            })
            .collect();

        Self {
            buckets,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum_micros
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for bucket in self.buckets.iter().filter(|b| seconds <= b.le) {
            bucket.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn write_prometheus(&self, name: &str, out: &mut String) {
        for bucket in &self.buckets {
            let _ = writeln!(
                out,
                "{}_bucket{{le=\"{}\"}} {}",
                name,
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, self.get_count());
        let _ = writeln!(
            out,
            "{}_sum {}",
            name,
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        );
        let _ = writeln!(out, "{}_count {}", name, self.get_count());
    }
}

#[derive(Debug)]
pub struct MetricsRegistry {
    pub runs_total: Counter,

    // Outcome counters
    pub outcome_completed: Counter,
    pub outcome_timed_out: Counter,
    pub outcome_memory_exceeded: Counter,
    pub outcome_policy_denied: Counter,
    pub outcome_extraction_failed: Counter,
    pub outcome_runtime_failed: Counter,

    // Violation counters, one per rule
    pub violations_denied_import: Counter,
    pub violations_denied_name: Counter,
    pub violations_denied_attribute_access: Counter,
    pub violations_syntax_unsupported: Counter,

    pub artifacts_relayed: Counter,
    pub relay_records_malformed: Counter,
    pub output_truncations: Counter,

    pub active_runs: Gauge,
    pub run_duration: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            runs_total: Counter::new(),
            outcome_completed: Counter::new(),
            outcome_timed_out: Counter::new(),
            outcome_memory_exceeded: Counter::new(),
            outcome_policy_denied: Counter::new(),
            outcome_extraction_failed: Counter::new(),
            outcome_runtime_failed: Counter::new(),
            violations_denied_import: Counter::new(),
            violations_denied_name: Counter::new(),
            violations_denied_attribute_access: Counter::new(),
            violations_syntax_unsupported: Counter::new(),
            artifacts_relayed: Counter::new(),
            relay_records_malformed: Counter::new(),
            output_truncations: Counter::new(),
            active_runs: Gauge::new(),
            run_duration: Histogram::new_latency(),
        }
    }

    /// Count a terminal outcome and its duration
    pub fn record_outcome(&self, outcome: &ExecutionOutcome, duration: Duration) {
        self.runs_total.inc();
        self.run_duration.observe(duration);

        match outcome {
            ExecutionOutcome::Completed { .. } => self.outcome_completed.inc(),
            ExecutionOutcome::TimedOut { .. } => self.outcome_timed_out.inc(),
            ExecutionOutcome::MemoryExceeded { .. } => self.outcome_memory_exceeded.inc(),
            ExecutionOutcome::PolicyDenied { violations } => {
                self.outcome_policy_denied.inc();
                for violation in violations {
                    self.record_violation(violation.rule);
                }
            }
            ExecutionOutcome::ExtractionFailed { .. } => self.outcome_extraction_failed.inc(),
            ExecutionOutcome::RuntimeFailed { .. } => self.outcome_runtime_failed.inc(),
        }
    }

    pub fn record_violation(&self, rule: ViolationRule) {
        match rule {
            ViolationRule::DeniedImport => self.violations_denied_import.inc(),
            ViolationRule::DeniedName => self.violations_denied_name.inc(),
            ViolationRule::DeniedAttributeAccess => self.violations_denied_attribute_access.inc(),
            ViolationRule::SyntaxUnsupported => self.violations_syntax_unsupported.inc(),
        }
    }

    /// Mark a worker as running until the guard drops
    pub fn track_active(self: &Arc<Self>) -> ActiveRunGuard {
        self.active_runs.inc();
        ActiveRunGuard {
            registry: Arc::clone(self),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP fencebox_runs_total Total number of sandbox runs\n");
        out.push_str("# TYPE fencebox_runs_total counter\n");
        let _ = writeln!(out, "fencebox_runs_total {}", self.runs_total.get());

        out.push_str("# HELP fencebox_outcomes_total Runs by terminal outcome\n");
        out.push_str("# TYPE fencebox_outcomes_total counter\n");
        for (status, counter) in [
            ("completed", &self.outcome_completed),
            ("timed_out", &self.outcome_timed_out),
            ("memory_exceeded", &self.outcome_memory_exceeded),
            ("policy_denied", &self.outcome_policy_denied),
            ("extraction_failed", &self.outcome_extraction_failed),
            ("runtime_failed", &self.outcome_runtime_failed),
        ] {
            let _ = writeln!(
                out,
                "fencebox_outcomes_total{{status=\"{}\"}} {}",
                status,
                counter.get()
            );
        }

        out.push_str("# HELP fencebox_violations_total Policy violations by rule\n");
        out.push_str("# TYPE fencebox_violations_total counter\n");
        for rule in [
            ViolationRule::DeniedImport,
            ViolationRule::DeniedName,
            ViolationRule::DeniedAttributeAccess,
            ViolationRule::SyntaxUnsupported,
        ] {
            let _ = writeln!(
                out,
                "fencebox_violations_total{{rule=\"{}\"}} {}",
                rule,
                self.violation_counter(rule).get()
            );
        }

        out.push_str("# HELP fencebox_artifacts_relayed_total Artifacts relayed out of workers\n");
        out.push_str("# TYPE fencebox_artifacts_relayed_total counter\n");
        let _ = writeln!(
            out,
            "fencebox_artifacts_relayed_total {}",
            self.artifacts_relayed.get()
        );

        out.push_str("# HELP fencebox_relay_records_malformed_total Relay lines dropped\n");
        out.push_str("# TYPE fencebox_relay_records_malformed_total counter\n");
        let _ = writeln!(
            out,
            "fencebox_relay_records_malformed_total {}",
            self.relay_records_malformed.get()
        );

        out.push_str("# HELP fencebox_output_truncations_total Streams cut at their cap\n");
        out.push_str("# TYPE fencebox_output_truncations_total counter\n");
        let _ = writeln!(
            out,
            "fencebox_output_truncations_total {}",
            self.output_truncations.get()
        );

        out.push_str("# HELP fencebox_active_runs Workers currently running\n");
        out.push_str("# TYPE fencebox_active_runs gauge\n");
        let _ = writeln!(out, "fencebox_active_runs {}", self.active_runs.get());

        out.push_str("# HELP fencebox_run_duration_seconds End-to-end run duration\n");
        out.push_str("# TYPE fencebox_run_duration_seconds histogram\n");
        self.run_duration
            .write_prometheus("fencebox_run_duration_seconds", &mut out);

        out
    }

    fn violation_counter(&self, rule: ViolationRule) -> &Counter {
        match rule {
            ViolationRule::DeniedImport => &self.violations_denied_import,
            ViolationRule::DeniedName => &self.violations_denied_name,
            ViolationRule::DeniedAttributeAccess => &self.violations_denied_attribute_access,
            ViolationRule::SyntaxUnsupported => &self.violations_syntax_unsupported,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

/// Get global metrics registry
pub fn get_metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Location, Violation};

    #[test]
    fn test_gauge_saturates_at_zero() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = Histogram::new_latency();
        histogram.observe(Duration::from_millis(40));
        histogram.observe(Duration::from_millis(200));
        histogram.observe(Duration::from_secs(3));

        assert_eq!(histogram.get_count(), 3);
        assert_eq!(histogram.get_bucket_count(0.05), 1);
        assert_eq!(histogram.get_bucket_count(0.25), 2);
        assert_eq!(histogram.get_bucket_count(5.0), 3);
    }

    #[test]
    fn test_policy_denied_counts_each_rule() {
        let metrics = MetricsRegistry::new();
        let violation = |rule| Violation {
            location: Location { line: 1, column: 1 },
            rule,
            detail: String::new(),
        };
        let outcome = ExecutionOutcome::PolicyDenied {
            violations: vec![
                violation(ViolationRule::DeniedImport),
                violation(ViolationRule::DeniedImport),
                violation(ViolationRule::SyntaxUnsupported),
            ],
        };
        metrics.record_outcome(&outcome, Duration::from_millis(3));

        assert_eq!(metrics.runs_total.get(), 1);
        assert_eq!(metrics.outcome_policy_denied.get(), 1);
        assert_eq!(metrics.violations_denied_import.get(), 2);
        assert_eq!(metrics.violations_syntax_unsupported.get(), 1);
        assert_eq!(metrics.violations_denied_name.get(), 0);
    }

    #[test]
    fn test_active_guard_decrements() {
        let metrics = Arc::new(MetricsRegistry::new());
        {
            let _guard = metrics.track_active();
            assert_eq!(metrics.active_runs.get(), 1);
        }
        assert_eq!(metrics.active_runs.get(), 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = MetricsRegistry::new();
        metrics.record_outcome(
            &ExecutionOutcome::TimedOut {
                elapsed: Duration::from_millis(100),
            },
            Duration::from_millis(120),
        );
        metrics.artifacts_relayed.add(2);

        let output = metrics.export_prometheus();
        assert!(output.contains("fencebox_runs_total 1"));
        assert!(output.contains("fencebox_outcomes_total{status=\"timed_out\"} 1"));
        assert!(output.contains("fencebox_violations_total{rule=\"denied_import\"} 0"));
        assert!(output.contains("fencebox_artifacts_relayed_total 2"));
        assert!(output.contains("fencebox_run_duration_seconds_count 1"));
    }

    #[test]
    fn test_global_metrics_shared() {
        let a = get_metrics();
        let b = get_metrics();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
