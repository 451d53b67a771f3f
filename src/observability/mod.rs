//! Observability
//!
//! Process-wide metrics. Per-run structured records live in [`crate::report`].

pub mod metrics;
