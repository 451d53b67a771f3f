/// Worker supervision
///
/// The calling thread polls the worker with `try_wait`, sampling `/proc` for
/// resident memory and CPU ticks between polls. A breached limit or a caller
/// abort kills the worker's whole process group with SIGKILL; the worker gets
/// no chance to react.
use crate::config::types::{Policy, Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Caller-side abort switch, shareable across threads
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the watchdog to kill the worker at its next poll
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Which limit the watchdog enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Breach {
    WallTime,
    CpuTime,
    Memory,
}

/// What the watchdog saw
#[derive(Debug, Clone)]
pub struct WatchdogReport {
    pub status: ExitStatus,
    pub breach: Option<Breach>,
    pub aborted: bool,
    pub wall_elapsed: Duration,
    pub cpu_time: Duration,
    pub peak_rss_bytes: u64,
}

/// One `/proc` reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcSample {
    pub rss_bytes: u64,
    pub peak_rss_bytes: u64,
    pub cpu_ticks: u64,
}

impl ProcSample {
    /// None once the process is gone
    pub fn read(pid: u32) -> Option<Self> {
        let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;

        let mut sample = ProcSample::default();
        for line in status.lines() {
            if let Some(value) = line.strip_prefix("VmRSS:") {
                sample.rss_bytes = parse_kb(value);
            } else if let Some(value) = line.strip_prefix("VmHWM:") {
                sample.peak_rss_bytes = parse_kb(value);
            }
        }
        sample.cpu_ticks = parse_cpu_ticks(&stat).unwrap_or(0);
        Some(sample)
    }
}

/// `"   1234 kB"` -> bytes
fn parse_kb(value: &str) -> u64 {
    value
        .split_whitespace()
        .next()
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

/// utime + stime from `/proc/<pid>/stat`; comm may contain spaces and parens
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // fields[0] is state (field 3); utime and stime are fields 14 and 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn clock_ticks_per_second() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

/// SIGKILL the worker's process group, falling back to the worker alone
pub fn kill_group(pid: u32) {
    let pid = pid as libc::pid_t;
    let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
    if rc != 0 {
        log::debug!(
            "group SIGKILL fallback used: {}",
            std::io::Error::last_os_error()
        );
        let _ = unsafe { libc::kill(pid, libc::SIGKILL) };
    }
}

pub struct Watchdog {
    wall_limit: Duration,
    cpu_limit: Duration,
    memory_limit: u64,
    poll_interval: Duration,
}

impl Watchdog {
    pub fn new(policy: &Policy, poll_interval: Duration) -> Self {
        Self {
            wall_limit: policy.max_wall_time,
            cpu_limit: policy.max_cpu_time,
            memory_limit: policy.max_memory_bytes,
            poll_interval,
        }
    }

    /// Supervise `child` until it exits or is killed
    pub fn supervise(
        &self,
        child: &mut Child,
        started: Instant,
        abort: &AbortHandle,
    ) -> Result<WatchdogReport> {
        let pid = child.id();
        let tick = Duration::from_secs(1) / clock_ticks_per_second() as u32;
        let mut peak_rss_bytes = 0u64;
        let mut cpu_time = Duration::ZERO;

        loop {
            if let Some(sample) = ProcSample::read(pid) {
                peak_rss_bytes = peak_rss_bytes
                    .max(sample.peak_rss_bytes)
                    .max(sample.rss_bytes);
                cpu_time = tick * sample.cpu_ticks as u32;
            }

            let waited = child
                .try_wait()
                .map_err(|e| SandboxError::Spawn(format!("wait: {}", e)))?;
            if let Some(status) = waited {
                return Ok(WatchdogReport {
                    status,
                    breach: None,
                    aborted: false,
                    wall_elapsed: started.elapsed(),
                    cpu_time,
                    peak_rss_bytes,
                });
            }

            let elapsed = started.elapsed();
            let aborted = abort.is_aborted();
            let breach = if aborted {
                None
            } else if elapsed >= self.wall_limit {
                Some(Breach::WallTime)
            } else if cpu_time >= self.cpu_limit {
                Some(Breach::CpuTime)
            } else if peak_rss_bytes >= self.memory_limit {
                Some(Breach::Memory)
            } else {
                None
            };

            if aborted || breach.is_some() {
                kill_group(pid);
                let status = child
                    .wait()
                    .map_err(|e| SandboxError::Spawn(format!("wait after kill: {}", e)))?;
                log::debug!(
                    "worker {} killed after {:?} (breach={:?}, aborted={})",
                    pid,
                    elapsed,
                    breach,
                    aborted
                );
                return Ok(WatchdogReport {
                    status,
                    breach,
                    aborted,
                    wall_elapsed: elapsed,
                    cpu_time,
                    peak_rss_bytes,
                });
            }

            let remaining = self.wall_limit.saturating_sub(elapsed);
            std::thread::sleep(self.poll_interval.min(remaining).max(Duration::from_micros(100)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kb() {
        assert_eq!(parse_kb("   2048 kB"), 2048 * 1024);
        assert_eq!(parse_kb("garbage"), 0);
    }

    #[test]
    fn test_parse_cpu_ticks_with_odd_comm() {
        let stat = "4242 (py (thon) x) R 1 4242 4242 0 -1 4194560 100 0 0 0 37 5 0 0 20 0 1 0 100 0 0";
        assert_eq!(parse_cpu_ticks(stat), Some(42));
    }

    #[test]
    fn test_sample_self() {
        let sample = ProcSample::read(std::process::id()).unwrap();
        assert!(sample.rss_bytes > 0);
        assert!(sample.peak_rss_bytes >= sample.rss_bytes);
    }

    #[test]
    fn test_sample_missing_process() {
        assert!(ProcSample::read(u32::MAX - 1).is_none());
    }

    #[test]
    fn test_abort_handle_shared() {
        let handle = AbortHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_aborted());
        clone.abort();
        assert!(handle.is_aborted());
    }

    #[test]
    fn test_wall_breach_kills_sleeping_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let policy = Policy::default().with_wall_time(Duration::from_millis(100));
        let watchdog = Watchdog::new(&policy, Duration::from_millis(5));

        let report = watchdog
            .supervise(&mut child, Instant::now(), &AbortHandle::new())
            .unwrap();
        assert_eq!(report.breach, Some(Breach::WallTime));
        assert!(report.wall_elapsed >= Duration::from_millis(100));
        assert!(report.wall_elapsed < Duration::from_secs(2));
    }
}
