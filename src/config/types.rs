/// Core configuration types shared by every stage of a fencebox run
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Capability policy applied to one execution call.
///
/// Immutable for the duration of a call: the pipeline takes a snapshot before
/// extraction starts and attaches that snapshot to the result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Modules importable inside the sandbox (dotted parents grant submodules, `*` grants all)
    pub allowed_modules: BTreeSet<String>,
    /// Explicit blocklist of builtins, functions and attributes (dotted names allowed)
    pub denied_names: BTreeSet<String>,
    /// Forced termination after this much wall-clock time
    #[serde(with = "duration_ms", rename = "max_wall_time_ms")]
    pub max_wall_time: Duration,
    /// Forced termination after this much CPU time
    #[serde(with = "duration_ms", rename = "max_cpu_time_ms")]
    pub max_cpu_time: Duration,
    /// Forced termination if the worker's memory exceeds this many bytes
    pub max_memory_bytes: u64,
    /// Enable the binary artifact relay channel
    pub capture_artifacts: bool,
}

impl Default for Policy {
    fn default() -> Self {
        crate::config::presets::standard()
    }
}

impl Policy {
    /// Load a policy from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let policy: Policy = serde_json::from_str(&raw)?;
        Ok(policy)
    }

    /// Builder: allow an additional module
    pub fn allow_module(mut self, module: impl Into<String>) -> Self {
        self.allowed_modules.insert(module.into());
        self
    }

    /// Builder: deny an additional name
    pub fn deny_name(mut self, name: impl Into<String>) -> Self {
        self.denied_names.insert(name.into());
        self
    }

    pub fn with_wall_time(mut self, limit: Duration) -> Self {
        self.max_wall_time = limit;
        self
    }

    pub fn with_cpu_time(mut self, limit: Duration) -> Self {
        self.max_cpu_time = limit;
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    pub fn with_artifacts(mut self, capture: bool) -> Self {
        self.capture_artifacts = capture;
        self
    }

    /// True when `module` (or one of its dotted parents) is allowed
    pub fn module_allowed(&self, module: &str) -> bool {
        if self.allowed_modules.contains("*") {
            return true;
        }
        let mut prefix = module;
        loop {
            if self.allowed_modules.contains(prefix) {
                return true;
            }
            match prefix.rfind('.') {
                Some(idx) => prefix = &prefix[..idx],
                None => return false,
            }
        }
    }

    pub fn is_denied(&self, name: &str) -> bool {
        self.denied_names.contains(name)
    }
}

/// Worker-side configuration that is not part of the capability policy.
///
/// Owned by a [`crate::Sandbox`] and shared by every call it serves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Interpreter to launch; resolved from `PATH` when unset
    pub interpreter: Option<PathBuf>,
    /// Per-stream stdout cap (bytes)
    pub stdout_limit: usize,
    /// Per-stream stderr cap (bytes)
    pub stderr_limit: usize,
    /// Cap on everything relayed over the artifact channel (bytes)
    pub relay_limit: usize,
    /// Cap on the rendered return summary (characters)
    pub return_summary_limit: usize,
    /// Largest fragment the policy compiler will parse (bytes)
    pub max_fragment_bytes: usize,
    /// Deepest bracket/statement nesting the policy compiler accepts
    pub max_nesting_depth: usize,
    /// Watchdog polling interval
    #[serde(with = "duration_ms", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    /// How long collectors may keep draining after the worker is gone
    #[serde(with = "duration_ms", rename = "collection_timeout_ms")]
    pub collection_timeout: Duration,
    /// Maximum file size the worker may create in its scratch directory (bytes)
    pub file_size_limit: u64,
    /// Open file descriptor ceiling for the worker
    pub fd_limit: u64,
    /// Try to move the worker into fresh user+network namespaces (best-effort)
    pub isolate_network: bool,
    /// Parent directory for per-run scratch directories (system temp when unset)
    pub scratch_root: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: None,
            stdout_limit: 1024 * 1024,   // 1 MiB
            stderr_limit: 256 * 1024,    // 256 KiB
            relay_limit: 32 * 1024 * 1024, // 32 MiB, base64 inflated
            return_summary_limit: 4096,
            max_fragment_bytes: 256 * 1024,
            max_nesting_depth: 100,
            poll_interval: Duration::from_millis(5),
            collection_timeout: Duration::from_millis(2000),
            file_size_limit: 16 * 1024 * 1024,
            fd_limit: 64,
            isolate_network: true,
            scratch_root: None,
        }
    }
}

impl RunnerConfig {
    /// Load a runner configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: RunnerConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }
}

/// Programmer/environment errors. Anything the fragment itself causes is an
/// [`crate::report::ExecutionOutcome`] instead.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid runner config: {0}")]
    InvalidConfig(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("interpreter not found: {0}")]
    InterpreterNotFound(String),

    #[error("worker spawn failed: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Spawn(err.to_string())
    }
}

/// Result type alias for fencebox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Durations travel as integer milliseconds in config files and results.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_membership_covers_dotted_parents() {
        let policy = Policy::default().allow_module("matplotlib");
        assert!(policy.module_allowed("matplotlib"));
        assert!(policy.module_allowed("matplotlib.pyplot"));
        assert!(!policy.module_allowed("matplotlibx"));
        assert!(!policy.module_allowed("os"));
    }

    #[test]
    fn wildcard_allows_every_module() {
        let policy = Policy::default().allow_module("*");
        assert!(policy.module_allowed("socket"));
        assert!(policy.module_allowed("a.b.c"));
    }

    #[test]
    fn policy_json_uses_millisecond_fields() {
        let policy = Policy::default().with_wall_time(Duration::from_millis(1500));
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["max_wall_time_ms"], 1500);

        let back: Policy = serde_json::from_value(json).unwrap();
        assert_eq!(back.max_wall_time, Duration::from_millis(1500));
    }

    #[test]
    fn policy_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let policy = Policy::default().allow_module("numpy");
        std::fs::write(&path, serde_json::to_string_pretty(&policy).unwrap()).unwrap();

        let loaded = Policy::load(&path).unwrap();
        assert_eq!(loaded, policy);
    }

    #[test]
    fn runner_config_defaults_are_bounded() {
        let config = RunnerConfig::default();
        assert!(config.stdout_limit > 0);
        assert!(config.stderr_limit > 0);
        assert!(config.poll_interval < Duration::from_millis(50));
    }
}
