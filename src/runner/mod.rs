//! Isolation runner
//!
//! Runs a [`VettedUnit`] in a separate `python3` process:
//!
//! - a per-run scratch directory is the worker's cwd and `HOME`
//! - the environment is cleared and rebuilt from a fixed list
//! - [`limits::WorkerLimits`] hardens the child between fork and exec
//! - stdout, stderr and the fd 3 relay pipe are drained by collector threads
//! - the calling thread runs the [`watchdog::Watchdog`] until the worker
//!   exits or is killed
//!
//! The collected evidence is classified by [`crate::verdict::classify`].

pub mod bootstrap;
pub mod limits;
pub mod output;
pub mod relay;
pub mod sanitize;
pub mod watchdog;

use crate::config::types::{Policy, Result, RunnerConfig, SandboxError};
use crate::observability::metrics::get_metrics;
use crate::policy::VettedUnit;
use crate::report::ExecutionOutcome;
use crate::verdict::{classify, Evidence, LimitSnapshot, VerdictCause};
use bootstrap::{WorkerRequest, BOOTSTRAP, RELAY_FD};
use limits::WorkerLimits;
use output::{collection_deadline, CollectedStream, StreamCollector};
use relay::RelayReport;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use watchdog::{kill_group, AbortHandle, Watchdog};

const WORKER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Resource snapshot attached to the run's log entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    #[serde(with = "crate::config::types::duration_ms", rename = "wall_elapsed_ms")]
    pub wall_elapsed: Duration,
    #[serde(with = "crate::config::types::duration_ms", rename = "cpu_time_ms")]
    pub cpu_time: Duration,
    pub peak_rss_bytes: u64,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub relay_truncated: bool,
    pub malformed_relay_records: usize,
    pub cause: VerdictCause,
}

/// What one worker produced
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: ExecutionOutcome,
    pub usage: ResourceUsage,
}

pub struct IsolationRunner {
    config: RunnerConfig,
    interpreter: PathBuf,
}

impl IsolationRunner {
    pub fn new(config: RunnerConfig, interpreter: PathBuf) -> Self {
        Self {
            config,
            interpreter,
        }
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Execute `unit` to completion or limit breach
    ///
    /// Only infrastructure failures (scratch directory, pipe, spawn) are
    /// errors; everything the fragment does ends up in the outcome.
    pub fn run(
        &self,
        unit: &VettedUnit,
        policy: &Policy,
        bindings: &Map<String, Value>,
        abort: &AbortHandle,
    ) -> Result<RunReport> {
        let scratch = self.scratch_dir()?;
        let request = WorkerRequest::new(unit, bindings, self.config.return_summary_limit).to_bytes()?;
        let (relay_read, relay_write) = relay_pipe()?;
        let limits = WorkerLimits::new(policy, &self.config);

        let mut command = self.worker_command(scratch.path());
        let relay_fd: RawFd = relay_write.as_raw_fd();
        unsafe {
            command.pre_exec(move || limits.apply_in_child(relay_fd, RELAY_FD));
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| {
            SandboxError::Spawn(format!("{}: {}", self.interpreter.display(), e))
        })?;
        // The worker holds the only write end from here on
        drop(relay_write);

        let pid = child.id();
        let metrics = get_metrics();
        let _active = metrics.track_active();
        log::debug!(
            "worker {} started for fragment {} (digest {})",
            pid,
            unit.fragment_index(),
            unit.digest().get(..12).unwrap_or(unit.digest())
        );

        let stdin_writer = child.stdin.take().map(|mut stdin| {
            thread::spawn(move || {
                if let Err(e) = stdin.write_all(&request) {
                    if e.kind() != io::ErrorKind::BrokenPipe {
                        log::debug!("writing worker request failed: {}", e);
                    }
                }
            })
        });

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                kill_group(pid);
                let _ = child.wait();
                return Err(SandboxError::Spawn("worker stdio was not captured".to_string()));
            }
        };
        let stdout = StreamCollector::spawn("stdout", stdout, self.config.stdout_limit);
        let stderr = StreamCollector::spawn("stderr", stderr, self.config.stderr_limit);
        let relay = StreamCollector::spawn("relay", File::from(relay_read), self.config.relay_limit);

        let watchdog = Watchdog::new(policy, self.config.poll_interval);
        let report = match watchdog.supervise(&mut child, started, abort) {
            Ok(report) => report,
            Err(e) => {
                kill_group(pid);
                let _ = child.wait();
                return Err(e);
            }
        };

        let deadline = collection_deadline(self.config.collection_timeout);
        let stdout = stdout.finish(deadline);
        let stderr = stderr.finish(deadline);
        let relay_raw = relay.finish(deadline);
        if let Some(writer) = stdin_writer {
            let _ = writer.join();
        }

        // Anything relayed after a kill is discarded, never merged
        let relay = if report.breach.is_some() || report.aborted {
            RelayReport::default()
        } else {
            RelayReport::parse(&relay_raw.data, relay_raw.truncated)
        };

        record_stream_metrics(&[&stdout, &stderr, &relay_raw], &relay);

        let worker_peak = relay.peak_rss_kb.map(|kb| kb * 1024).unwrap_or(0);
        let (stdout_truncated, stderr_truncated) = (stdout.truncated, stderr.truncated);
        let malformed_relay_records = relay.malformed;
        let evidence = Evidence {
            exit_code: report.status.code(),
            signal: report.status.signal(),
            breach: report.breach,
            aborted: report.aborted,
            wall_elapsed: report.wall_elapsed,
            cpu_time: report.cpu_time,
            peak_rss_bytes: report.peak_rss_bytes.max(worker_peak),
            stdout: stdout.into_text(),
            stderr: stderr.into_text(),
            relay,
            scratch_dir: Some(scratch.path().to_path_buf()),
        };

        let (outcome, cause) = classify(&evidence, &LimitSnapshot::new(policy, &self.config));
        if let ExecutionOutcome::Completed { artifacts, .. } = &outcome {
            metrics.artifacts_relayed.add(artifacts.len() as u64);
        }
        log::debug!("worker {} classified as {:?}", pid, cause);

        if let Err(e) = scratch.close() {
            log::warn!("failed to remove scratch directory: {}", e);
        }

        Ok(RunReport {
            outcome,
            usage: ResourceUsage {
                wall_elapsed: evidence.wall_elapsed,
                cpu_time: evidence.cpu_time,
                peak_rss_bytes: evidence.peak_rss_bytes,
                exit_code: evidence.exit_code,
                signal: evidence.signal,
                stdout_truncated,
                stderr_truncated,
                relay_truncated: relay_raw.truncated,
                malformed_relay_records,
                cause,
            },
        })
    }

    fn scratch_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(".fencebox-");
        let dir = match &self.config.scratch_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    fn worker_command(&self, scratch: &Path) -> Command {
        let mut command = Command::new(&self.interpreter);
        command
            .args(["-I", "-B", "-c", BOOTSTRAP])
            .current_dir(scratch)
            .env_clear()
            .env("PATH", WORKER_PATH)
            .env("LANG", "C.UTF-8")
            .env("PYTHONIOENCODING", "utf-8")
            .env("MPLBACKEND", "Agg")
            .env("HOME", scratch)
            .env("MPLCONFIGDIR", scratch)
            .env("OPENBLAS_NUM_THREADS", "1")
            .env("OMP_NUM_THREADS", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

/// Close-on-exec pipe; the child re-opens the write end on fd 3
fn relay_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1, -1];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // Both descriptors were just created and are owned by nobody else
    let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok(pair)
}

fn record_stream_metrics(streams: &[&CollectedStream], relay: &RelayReport) {
    let metrics = get_metrics();
    let truncated = streams.iter().filter(|s| s.truncated).count() as u64;
    if truncated > 0 {
        metrics.output_truncations.add(truncated);
    }
    if relay.malformed > 0 {
        metrics.relay_records_malformed.add(relay.malformed as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract;
    use crate::policy::PolicyCompiler;

    fn python() -> Option<PathBuf> {
        which::which("python3").ok()
    }

    fn run_source(source: &str, policy: &Policy) -> Option<RunReport> {
        let interpreter = python()?;
        let text = format!("```python\n{}\n```", source);
        let fragment = extract(&text).next().unwrap();
        let unit = PolicyCompiler::default().compile(&fragment, policy).unwrap();
        let runner = IsolationRunner::new(RunnerConfig::default(), interpreter);
        Some(
            runner
                .run(&unit, policy, &Map::new(), &AbortHandle::new())
                .unwrap(),
        )
    }

    #[test]
    fn test_relay_pipe_is_cloexec() {
        let (read, write) = relay_pipe().unwrap();
        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert!(flags & libc::FD_CLOEXEC != 0);
        }
    }

    #[test]
    fn test_prints_and_summarises() {
        let Some(report) = run_source("print('hi')\n6 * 7", &Policy::default()) else {
            eprintln!("python3 not found, skipping");
            return;
        };
        assert_eq!(report.usage.cause, VerdictCause::NormalExit);
        match report.outcome {
            ExecutionOutcome::Completed {
                stdout,
                return_summary,
                ..
            } => {
                assert_eq!(stdout, "hi\n");
                assert_eq!(return_summary.as_deref(), Some("42"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stdout_cap_marks_truncation() {
        let Some(interpreter) = python() else {
            eprintln!("python3 not found, skipping");
            return;
        };
        let config = RunnerConfig {
            stdout_limit: 64,
            ..RunnerConfig::default()
        };
        let policy = Policy::default();
        let text = "```python\nprint('x' * 10000)\n```";
        let fragment = extract(text).next().unwrap();
        let unit = PolicyCompiler::default().compile(&fragment, &policy).unwrap();
        let report = IsolationRunner::new(config, interpreter)
            .run(&unit, &policy, &Map::new(), &AbortHandle::new())
            .unwrap();

        assert!(report.usage.stdout_truncated);
        match report.outcome {
            ExecutionOutcome::Completed { stdout, .. } => {
                assert!(stdout.ends_with(output::TRUNCATION_MARKER));
                assert!(stdout.starts_with(&"x".repeat(64)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_exception_becomes_runtime_failure() {
        let Some(report) = run_source("x = 1\nx / 0", &Policy::default()) else {
            eprintln!("python3 not found, skipping");
            return;
        };
        assert_eq!(report.usage.cause, VerdictCause::FragmentException);
        match report.outcome {
            ExecutionOutcome::RuntimeFailed {
                exception_type,
                traceback,
                ..
            } => {
                assert_eq!(exception_type, "ZeroDivisionError");
                assert!(traceback.contains("File \"<fragment>\", line 2"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
