//! Scheduling and publication engine for fleet-wide codebase automation.

pub mod api;
pub mod config;
pub mod error;
pub mod estimator;
pub mod hoster;
pub mod ingress;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod policy;
pub mod publish;
pub mod queue;
pub mod rate_limiter;
pub mod schedule;
pub mod worker_protocol;

pub use error::{Error, Result};
