//! ChurnWatch Backend Library
//!
//! Exposes the churn pipeline and its configuration for the `churnwatch`
//! binary and integration tests.

pub mod churn;
pub mod config;
