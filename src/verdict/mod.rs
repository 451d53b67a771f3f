//! Evidence-backed outcome classification
//!
//! The runner gathers an [`Evidence`] bundle and hands it, with the
//! [`LimitSnapshot`] it ran under, to [`classify`]. Classification is a pure
//! function: the same evidence always yields the same outcome.

mod classify;

pub use classify::{classify, Evidence, LimitSnapshot, VerdictCause};
