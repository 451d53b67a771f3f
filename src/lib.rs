//! fencebox: run Python found in language-model output inside a contained,
//! resource-bounded worker and get back one structured result
//!
//! # Architecture
//!
//! A call flows through four stages, leaf-first:
//!
//! ## Extraction ([`extract`])
//! - [`extract::Extractor`]: lazy, restartable scan for fenced code regions,
//!   falling back to the whole text when it parses as Python
//! - [`extract::Fragment`]: one candidate block with its span in the raw text
//!
//! ## Policy Compilation ([`policy`])
//! - [`policy::PolicyCompiler`]: syntax-tree vetting against a capability
//!   policy; never executes or imports anything
//! - [`policy::Violation`]: tagged findings, all collected in one pass
//! - [`policy::VettedUnit`]: the only thing the runner accepts
//!
//! ## Isolation ([`runner`])
//! - [`runner::IsolationRunner`]: one `python3` worker per call with rlimits,
//!   a new session, no_new_privs and a cleared environment
//! - [`runner::watchdog`]: wall/CPU/memory enforcement by SIGKILL
//! - [`runner::relay`]: the fd 3 channel for artifacts, return summaries and
//!   exceptions
//!
//! ## Evidence & Outcome ([`verdict`], [`report`])
//! - [`verdict::classify`]: pure classification of the collected evidence
//! - [`report::Run`]: type-state per-call state machine
//! - [`report::ExecutionResult`]: the record returned to the caller
//!
//! ## Configuration ([`config`]) and Observability ([`observability`])
//! - [`config::types`]: `Policy`, `RunnerConfig`, `SandboxError`
//! - [`config::presets`]: named policies
//! - [`config::validator`]: fail-fast validation with warnings
//! - [`observability::metrics`]: process-wide counters, Prometheus export
//!
//! # Guarantees
//!
//! 1. **Vet before run** - a fragment with any violation never reaches a worker
//! 2. **Limits win races** - a breach is reported even if the worker finished
//! 3. **Forced termination** - the watchdog kills the process group, it never asks
//! 4. **Outcomes, not panics** - everything the fragment does is an
//!    [`ExecutionOutcome`]; `Err` is reserved for caller and host problems
//!
//! # Example
//!
//! ```no_run
//! let result = fencebox::run("Sure! ```python\nprint(1+1)\n```", &fencebox::Policy::default())?;
//! assert_eq!(result.stdout(), Some("2\n"));
//! # Ok::<(), fencebox::SandboxError>(())
//! ```

// Configuration & Policy
pub mod config;

// Stages
pub mod extract;
pub mod policy;
pub mod runner;

// Evidence & Outcome
pub mod report;
pub mod verdict;

// Observability
pub mod observability;

mod sandbox;

pub use config::presets;
pub use config::types::{Policy, Result, RunnerConfig, SandboxError};
pub use extract::{extract, Extractor, Fragment};
pub use policy::{PolicyCompiler, VettedUnit, Violation, ViolationRule};
pub use report::{ExecutionOutcome, ExecutionResult, LogEntry, Stage};
pub use runner::relay::Artifact;
pub use runner::watchdog::AbortHandle;
pub use sandbox::{RunRequest, Sandbox};

use once_cell::sync::OnceCell;

static DEFAULT_SANDBOX: OnceCell<Sandbox> = OnceCell::new();

/// Run the first Python fragment in `raw_text` under `policy`
///
/// Uses a process-wide [`Sandbox`] with the default [`RunnerConfig`], built on
/// first use.
pub fn run(raw_text: &str, policy: &Policy) -> Result<ExecutionResult> {
    let sandbox = DEFAULT_SANDBOX.get_or_try_init(|| Sandbox::new(RunnerConfig::default()))?;
    sandbox.run(raw_text, policy)
}
