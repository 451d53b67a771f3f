//! Configuration and policy
//!
//! Capability policy, runner configuration, presets and validation.

pub mod presets;
pub mod types;
pub mod validator;
