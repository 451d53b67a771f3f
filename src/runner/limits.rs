/// Worker hardening applied between fork and exec
///
/// The sequence is fixed:
/// 1. setsid() so the watchdog can kill the whole process group
/// 2. prctl(PR_SET_PDEATHSIG, SIGKILL)
/// 3. optional unshare(CLONE_NEWUSER | CLONE_NEWNET), best-effort
/// 4. rlimits: data, cpu, file size, core, open files
/// 5. prctl(PR_SET_NO_NEW_PRIVS, 1)
/// 6. relay pipe onto its fixed fd
///
/// Everything here runs in the forked child, so it must not allocate or log.
use crate::config::types::{Policy, RunnerConfig};
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::Signal;
use std::io;
use std::os::unix::io::RawFd;

/// Kernel-enforced ceilings for one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLimits {
    pub memory_bytes: u64,
    /// RLIMIT_CPU soft limit; the hard limit is one second above it
    pub cpu_seconds: u64,
    pub file_size_bytes: u64,
    pub open_files: u64,
    pub isolate_network: bool,
}

impl WorkerLimits {
    pub fn new(policy: &Policy, config: &RunnerConfig) -> Self {
        // Round up so the kernel never fires before the watchdog would
        let cpu = policy.max_cpu_time;
        let cpu_seconds = cpu.as_secs() + u64::from(cpu.subsec_nanos() > 0);

        Self {
            memory_bytes: policy.max_memory_bytes,
            cpu_seconds: cpu_seconds.max(1),
            file_size_bytes: config.file_size_limit,
            open_files: config.fd_limit,
            isolate_network: config.isolate_network,
        }
    }

    /// Apply every step in the forked child
    pub fn apply_in_child(&self, relay_fd: RawFd, target_fd: RawFd) -> io::Result<()> {
        nix::unistd::setsid().map_err(io::Error::from)?;
        set_parent_death_signal()?;

        if self.isolate_network {
            // Unprivileged user namespaces may be disabled; carry on without
            let _ = unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET);
        }

        self.apply_rlimits()?;
        nix::sys::prctl::set_no_new_privs().map_err(io::Error::from)?;
        install_relay_fd(relay_fd, target_fd)
    }

    fn apply_rlimits(&self) -> io::Result<()> {
        apply_rlimit_value(Resource::RLIMIT_DATA, self.memory_bytes, self.memory_bytes)?;
        apply_rlimit_value(Resource::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds + 1)?;
        apply_rlimit_value(Resource::RLIMIT_FSIZE, self.file_size_bytes, self.file_size_bytes)?;
        apply_rlimit_value(Resource::RLIMIT_CORE, 0, 0)?;
        apply_rlimit_value(Resource::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        Ok(())
    }
}

/// Never raises an existing hard limit (that would need privileges)
fn apply_rlimit_value(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let (_, current_hard) = getrlimit(resource).map_err(io::Error::from)?;
    let hard = (hard as libc::rlim_t).min(current_hard);
    let soft = (soft as libc::rlim_t).min(hard);
    setrlimit(resource, soft, hard).map_err(io::Error::from)
}

fn set_parent_death_signal() -> io::Result<()> {
    nix::sys::prctl::set_pdeathsig(Signal::SIGKILL).map_err(io::Error::from)
}

/// Move the relay write end onto `target_fd`, clearing close-on-exec
fn install_relay_fd(relay_fd: RawFd, target_fd: RawFd) -> io::Result<()> {
    if relay_fd == target_fd {
        let rc = unsafe { libc::fcntl(target_fd, libc::F_SETFD, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }

    // dup2 leaves FD_CLOEXEC clear on the new descriptor
    let rc = unsafe { libc::dup2(relay_fd, target_fd) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cpu_limit_rounds_up() {
        let policy = Policy::default().with_cpu_time(Duration::from_millis(1500));
        let limits = WorkerLimits::new(&policy, &RunnerConfig::default());
        assert_eq!(limits.cpu_seconds, 2);
    }

    #[test]
    fn test_sub_second_cpu_limit_is_one_second() {
        let policy = Policy::default().with_cpu_time(Duration::from_millis(100));
        let limits = WorkerLimits::new(&policy, &RunnerConfig::default());
        assert_eq!(limits.cpu_seconds, 1);
    }

    #[test]
    fn test_memory_ceiling_from_policy() {
        let policy = Policy::default().with_memory_limit(64 * 1024 * 1024);
        let limits = WorkerLimits::new(&policy, &RunnerConfig::default());
        assert_eq!(limits.memory_bytes, 64 * 1024 * 1024);
        assert_eq!(limits.open_files, RunnerConfig::default().fd_limit);
    }
}
