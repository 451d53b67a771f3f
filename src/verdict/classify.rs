use crate::config::types::{Policy, RunnerConfig};
use crate::report::ExecutionOutcome;
use crate::runner::relay::RelayReport;
use crate::runner::sanitize::sanitize_text;
use crate::runner::watchdog::Breach;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Exception type reported for a caller-requested abort
pub const ABORTED_EXCEPTION: &str = "SandboxAborted";

/// Stderr tail kept when the worker dies without an exception record
const STDERR_TAIL_CHARS: usize = 2048;

/// Limits a run was held to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSnapshot {
    #[serde(with = "crate::config::types::duration_ms", rename = "wall_limit_ms")]
    pub wall_limit: Duration,
    #[serde(with = "crate::config::types::duration_ms", rename = "cpu_limit_ms")]
    pub cpu_limit: Duration,
    pub memory_limit_bytes: u64,
    pub return_summary_limit: usize,
}

impl LimitSnapshot {
    pub fn new(policy: &Policy, config: &RunnerConfig) -> Self {
        Self {
            wall_limit: policy.max_wall_time,
            cpu_limit: policy.max_cpu_time,
            memory_limit_bytes: policy.max_memory_bytes,
            return_summary_limit: config.return_summary_limit,
        }
    }
}

/// Everything observed about one worker, frozen after it was reaped
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub breach: Option<Breach>,
    pub aborted: bool,
    pub wall_elapsed: Duration,
    pub cpu_time: Duration,
    /// Highest resident set seen by the watchdog or reported by the worker
    pub peak_rss_bytes: u64,
    pub stdout: String,
    pub stderr: String,
    pub relay: RelayReport,
    pub scratch_dir: Option<PathBuf>,
}

/// Which rule decided the outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictCause {
    WatchdogWallTime,
    WatchdogCpuTime,
    WatchdogMemory,
    CallerAbort,
    KernelCpuLimit,
    WorkerMemoryExhausted,
    PostHocMemory,
    PostHocTime,
    FragmentException,
    NormalExit,
    WorkerExit,
    WorkerSignal,
}

/// Classify a finished run
///
/// Priority, first match wins:
/// 1. watchdog breach
/// 2. caller abort
/// 3. kernel CPU-limit signal
/// 4. memory exhaustion reported by the worker
/// 5. post-hoc limit check on the observed usage
/// 6. exception record
/// 7. clean exit
/// 8. any other exit or signal
pub fn classify(evidence: &Evidence, limits: &LimitSnapshot) -> (ExecutionOutcome, VerdictCause) {
    if let Some(breach) = evidence.breach {
        return classify_breach(evidence, breach);
    }

    if evidence.aborted {
        return (
            ExecutionOutcome::RuntimeFailed {
                exception_type: ABORTED_EXCEPTION.to_string(),
                message: "run aborted by caller".to_string(),
                traceback: String::new(),
            },
            VerdictCause::CallerAbort,
        );
    }

    if is_kernel_cpu_kill(evidence, limits) {
        return (
            ExecutionOutcome::TimedOut {
                elapsed: evidence.wall_elapsed,
            },
            VerdictCause::KernelCpuLimit,
        );
    }

    if evidence.relay.memory_exhausted {
        return (
            ExecutionOutcome::MemoryExceeded {
                peak_bytes: evidence.peak_rss_bytes.max(limits.memory_limit_bytes),
            },
            VerdictCause::WorkerMemoryExhausted,
        );
    }

    if evidence.peak_rss_bytes >= limits.memory_limit_bytes {
        return (
            ExecutionOutcome::MemoryExceeded {
                peak_bytes: evidence.peak_rss_bytes,
            },
            VerdictCause::PostHocMemory,
        );
    }

    if evidence.wall_elapsed > limits.wall_limit || evidence.cpu_time >= limits.cpu_limit {
        return (
            ExecutionOutcome::TimedOut {
                elapsed: evidence.wall_elapsed,
            },
            VerdictCause::PostHocTime,
        );
    }

    let scratch = evidence.scratch_dir.as_deref();

    if let Some(exception) = &evidence.relay.exception {
        return (
            ExecutionOutcome::RuntimeFailed {
                exception_type: exception.exception_type.clone(),
                message: sanitize_text(&exception.message, scratch),
                traceback: sanitize_text(&exception.traceback, scratch),
            },
            VerdictCause::FragmentException,
        );
    }

    match (evidence.exit_code, evidence.signal) {
        (Some(0), _) => (
            ExecutionOutcome::Completed {
                stdout: evidence.stdout.clone(),
                stderr: evidence.stderr.clone(),
                artifacts: evidence.relay.artifacts.clone(),
                return_summary: evidence
                    .relay
                    .return_summary
                    .as_deref()
                    .map(|summary| cap_chars(summary, limits.return_summary_limit)),
            },
            VerdictCause::NormalExit,
        ),
        (Some(code), _) => (
            ExecutionOutcome::RuntimeFailed {
                exception_type: "WorkerExit".to_string(),
                message: format!("worker exited with status {}", code),
                traceback: sanitize_text(&stderr_tail(&evidence.stderr), scratch),
            },
            VerdictCause::WorkerExit,
        ),
        (None, signal) => (
            ExecutionOutcome::RuntimeFailed {
                exception_type: "WorkerSignal".to_string(),
                message: format!("worker terminated by {}", signal_name(signal)),
                traceback: sanitize_text(&stderr_tail(&evidence.stderr), scratch),
            },
            VerdictCause::WorkerSignal,
        ),
    }
}

fn classify_breach(evidence: &Evidence, breach: Breach) -> (ExecutionOutcome, VerdictCause) {
    match breach {
        Breach::WallTime => (
            ExecutionOutcome::TimedOut {
                elapsed: evidence.wall_elapsed,
            },
            VerdictCause::WatchdogWallTime,
        ),
        Breach::CpuTime => (
            ExecutionOutcome::TimedOut {
                elapsed: evidence.wall_elapsed,
            },
            VerdictCause::WatchdogCpuTime,
        ),
        Breach::Memory => (
            ExecutionOutcome::MemoryExceeded {
                peak_bytes: evidence.peak_rss_bytes,
            },
            VerdictCause::WatchdogMemory,
        ),
    }
}

/// SIGXCPU from RLIMIT_CPU, or the hard-limit SIGKILL once CPU is spent
fn is_kernel_cpu_kill(evidence: &Evidence, limits: &LimitSnapshot) -> bool {
    match evidence.signal {
        Some(libc::SIGXCPU) => true,
        Some(libc::SIGKILL) => evidence.cpu_time >= limits.cpu_limit,
        _ => false,
    }
}

fn signal_name(signal: Option<i32>) -> String {
    match signal {
        Some(raw) => match nix::sys::signal::Signal::try_from(raw) {
            Ok(sig) => sig.as_str().to_string(),
            Err(_) => format!("signal {}", raw),
        },
        None => "an unknown cause".to_string(),
    }
}

fn stderr_tail(stderr: &str) -> String {
    let count = stderr.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return stderr.to_string();
    }
    stderr.chars().skip(count - STDERR_TAIL_CHARS).collect()
}

fn cap_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
