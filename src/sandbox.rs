//! Pipeline entry point
//!
//! [`Sandbox`] owns the stage configuration and drives one [`RunRequest`]
//! through extraction, policy checking and isolated execution. Requests are
//! independent: a `Sandbox` can be shared across threads and each call gets
//! its own worker.

use crate::config::types::{Policy, Result, RunnerConfig, SandboxError};
use crate::config::validator::{is_identifier, validate_policy, validate_runner_config};
use crate::extract::Extractor;
use crate::policy::PolicyCompiler;
use crate::report::{ExecutionResult, Run};
use crate::runner::bootstrap::RESERVED_NAMES;
use crate::runner::watchdog::AbortHandle;
use crate::runner::IsolationRunner;
use serde_json::{Map, Value};
use std::path::Path;

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while",
    "with", "yield",
];

/// One call's input
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    text: &'a str,
    policy: Policy,
    fragment_index: usize,
    bindings: Map<String, Value>,
    abort: AbortHandle,
}

impl<'a> RunRequest<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            policy: Policy::default(),
            fragment_index: 0,
            bindings: Map::new(),
            abort: AbortHandle::new(),
        }
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Run the fragment at `index` instead of the first one
    pub fn fragment(mut self, index: usize) -> Self {
        self.fragment_index = index;
        self
    }

    /// Inject a global variable into the fragment's namespace
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.insert(name.into(), value.into());
        self
    }

    pub fn abort_handle(mut self, handle: AbortHandle) -> Self {
        self.abort = handle;
        self
    }

    fn validate_bindings(&self) -> Result<()> {
        for name in self.bindings.keys() {
            let problem = if !is_identifier(name) || PYTHON_KEYWORDS.contains(&name.as_str()) {
                "is not a valid identifier"
            } else if RESERVED_NAMES.contains(&name.as_str()) {
                "is reserved by the sandbox"
            } else if self.policy.is_denied(name) {
                "is a denied name"
            } else {
                continue;
            };
            return Err(SandboxError::InvalidRequest(format!(
                "binding {:?} {}",
                name, problem
            )));
        }
        Ok(())
    }
}

pub struct Sandbox {
    extractor: Extractor,
    compiler: PolicyCompiler,
    runner: IsolationRunner,
}

impl Sandbox {
    /// Validate `config` and resolve the interpreter
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let validation = validate_runner_config(&config)?;
        for warning in &validation.warnings {
            log::warn!("runner config: {}", warning);
        }

        let interpreter = match &config.interpreter {
            Some(path) => path.clone(),
            None => which::which("python3")
                .map_err(|e| SandboxError::InterpreterNotFound(format!("python3: {}", e)))?,
        };
        log::info!("fencebox sandbox using interpreter {}", interpreter.display());

        Ok(Self {
            extractor: Extractor::new(),
            compiler: PolicyCompiler::from_config(&config),
            runner: IsolationRunner::new(config, interpreter),
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        self.runner.config()
    }

    pub fn interpreter(&self) -> &Path {
        self.runner.interpreter()
    }

    /// Run the first fragment of `text` under `policy`
    pub fn run(&self, text: &str, policy: &Policy) -> Result<ExecutionResult> {
        self.execute(RunRequest::new(text).policy(policy.clone()))
    }

    pub fn execute(&self, request: RunRequest<'_>) -> Result<ExecutionResult> {
        let validation = validate_policy(&request.policy)?;
        for warning in &validation.warnings {
            log::warn!("policy: {}", warning);
        }
        request.validate_bindings()?;

        let run = Run::start(&request.policy);

        let selected = self
            .extractor
            .scan(request.text)
            .nth(request.fragment_index);
        let fragment = match selected {
            Some(fragment) => fragment,
            None => {
                let found = self.extractor.scan(request.text).count();
                let reason = if found == 0 {
                    "no Python code found in the input".to_string()
                } else {
                    format!(
                        "fragment {} requested but only {} found",
                        request.fragment_index, found
                    )
                };
                return Ok(run.no_fragment(reason, found));
            }
        };

        let run = run.fragment_selected(fragment.clone());
        let unit = match self.compiler.compile(&fragment, &request.policy) {
            Ok(unit) => unit,
            Err(violations) => return Ok(run.denied(violations)),
        };

        let run = run.vetted(&unit);
        let report = self
            .runner
            .run(&unit, &request.policy, &request.bindings, &request.abort)?;
        Ok(run.finished(report))
    }
}
