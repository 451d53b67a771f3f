// Policy and runner configuration validation
// Invalid configuration fails fast, before any pipeline stage runs

use crate::config::types::{Policy, Result, RunnerConfig, SandboxError};
use std::time::Duration;

/// Python interpreter needs this much address space just to start
const INTERPRETER_FLOOR_BYTES: u64 = 16 * 1024 * 1024;

/// Validation result with detailed errors
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a policy; errors are fatal, warnings are returned for logging
pub fn validate_policy(policy: &Policy) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_limits(policy, &mut result);
    validate_names(policy, &mut result);

    if !result.is_valid() {
        return Err(SandboxError::InvalidPolicy(result.errors.join("; ")));
    }

    Ok(result)
}

/// Validate runner configuration
pub fn validate_runner_config(config: &RunnerConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    if config.stdout_limit == 0 {
        result.add_error("stdout_limit cannot be zero".to_string());
    }
    if config.stderr_limit == 0 {
        result.add_error("stderr_limit cannot be zero".to_string());
    }
    if config.relay_limit == 0 {
        result.add_error("relay_limit cannot be zero".to_string());
    }
    if config.max_fragment_bytes == 0 {
        result.add_error("max_fragment_bytes cannot be zero".to_string());
    }
    if config.max_nesting_depth == 0 {
        result.add_error("max_nesting_depth cannot be zero".to_string());
    }
    if config.poll_interval.is_zero() {
        result.add_error("poll_interval cannot be zero".to_string());
    } else if config.poll_interval > Duration::from_millis(100) {
        result.add_warning(format!(
            "poll_interval {:?} is coarse; limit breaches will be detected late",
            config.poll_interval
        ));
    }
    if config.fd_limit < 8 {
        result.add_error(format!(
            "fd_limit {} is too low for the interpreter to start",
            config.fd_limit
        ));
    }
    if let Some(ref interpreter) = config.interpreter {
        if !interpreter.exists() {
            result.add_error(format!("interpreter does not exist: {:?}", interpreter));
        }
    }
    if let Some(ref root) = config.scratch_root {
        if !root.is_dir() {
            result.add_error(format!("scratch_root is not a directory: {:?}", root));
        }
    }

    if !result.is_valid() {
        return Err(SandboxError::InvalidConfig(result.errors.join("; ")));
    }

    Ok(result)
}

/// Validate resource limits
fn validate_limits(policy: &Policy, result: &mut ValidationResult) {
    if policy.max_memory_bytes == 0 {
        result.add_error("max_memory_bytes cannot be zero".to_string());
    } else if policy.max_memory_bytes < INTERPRETER_FLOOR_BYTES {
        result.add_warning(format!(
            "max_memory_bytes {} is below the interpreter floor ({}), every run will exceed it",
            policy.max_memory_bytes, INTERPRETER_FLOOR_BYTES
        ));
    }

    if policy.max_wall_time.is_zero() {
        result.add_error("max_wall_time cannot be zero".to_string());
    }

    if policy.max_cpu_time.is_zero() {
        result.add_error("max_cpu_time cannot be zero".to_string());
    }

    if policy.max_cpu_time > policy.max_wall_time && !policy.max_wall_time.is_zero() {
        result.add_warning(format!(
            "max_cpu_time ({:?}) exceeds max_wall_time ({:?}); wall time will fire first",
            policy.max_cpu_time, policy.max_wall_time
        ));
    }
}

/// Validate module and name lists
fn validate_names(policy: &Policy, result: &mut ValidationResult) {
    for module in &policy.allowed_modules {
        if module == "*" {
            result.add_warning("allowed_modules contains \"*\": every module is importable".to_string());
            continue;
        }
        if !is_dotted_identifier(module) {
            result.add_error(format!("allowed module is not a dotted name: {:?}", module));
        }
    }

    for name in &policy.denied_names {
        if !is_dotted_identifier(name) {
            result.add_error(format!("denied name is not a dotted name: {:?}", name));
        }
    }

    for module in &policy.allowed_modules {
        if policy.denied_names.contains(module) {
            result.add_warning(format!(
                "module {:?} is both allowed and denied; imports of it will be rejected",
                module
            ));
        }
    }
}

/// `foo`, `foo.bar`, `__dunder__`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_alphanumeric())
}

pub fn is_dotted_identifier(name: &str) -> bool {
    !name.is_empty() && name.split('.').all(is_identifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_default_policy() {
        let result = validate_policy(&Policy::default());
        assert!(result.is_ok());
    }

    #[test]
    fn test_zero_memory_limit() {
        let policy = Policy::default().with_memory_limit(0);
        let err = validate_policy(&policy).unwrap_err();
        assert!(err.to_string().contains("max_memory_bytes cannot be zero"));
    }

    #[test]
    fn test_zero_wall_time() {
        let policy = Policy::default().with_wall_time(Duration::ZERO);
        let err = validate_policy(&policy).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidPolicy(_)));
        assert!(err.to_string().contains("max_wall_time"));
    }

    #[test]
    fn test_cpu_above_wall_is_warning() {
        let policy = Policy::default()
            .with_wall_time(Duration::from_secs(1))
            .with_cpu_time(Duration::from_secs(3));
        let result = validate_policy(&policy).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_low_memory_is_warning() {
        let policy = Policy::default().with_memory_limit(1024 * 1024);
        let result = validate_policy(&policy).unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("interpreter floor")));
    }

    #[test]
    fn test_bad_module_name_rejected() {
        let policy = Policy::default().allow_module("os; rm");
        assert!(validate_policy(&policy).is_err());
    }

    #[test]
    fn test_wildcard_module_is_warning() {
        let policy = Policy::default().allow_module("*");
        let result = validate_policy(&policy).unwrap();
        assert!(result.warnings.iter().any(|w| w.contains('*')));
    }

    #[test]
    fn test_runner_config_zero_limit() {
        let config = RunnerConfig {
            stdout_limit: 0,
            ..RunnerConfig::default()
        };
        let err = validate_runner_config(&config).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidConfig(_)));
    }

    #[test]
    fn test_runner_config_missing_interpreter() {
        let config = RunnerConfig {
            interpreter: Some("/nonexistent/python3".into()),
            ..RunnerConfig::default()
        };
        assert!(validate_runner_config(&config).is_err());
    }

    #[test]
    fn test_identifiers() {
        assert!(is_identifier("result"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier(""));
        assert!(is_dotted_identifier("os.path.join"));
        assert!(!is_dotted_identifier("os..path"));
    }
}
