//! Core library for the agent usage governor
//!
//! This crate provides the core functionality for:
//! - Usage event recording and windowed aggregation
//! - Budget enforcement with calendar-aligned period resets
//! - Per-agent rate limiting with burst tolerance
//! - Statistical anomaly detection with rolling baselines
//! - Hierarchical policy resolution (org -> project -> agent)
//! - Alert routing with deduplication and fan-out
//! - Health checks and observability

pub mod alert;
pub mod anomaly;
pub mod budget;
pub mod error;
pub mod eventlog;
pub mod health;
pub mod ledger;
pub mod models;
pub mod observability;
pub mod policy;
pub mod ratelimit;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod store;

pub use error::{GovernorError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{GovernorMetrics, StructuredLogger};
pub use service::{Governor, GovernorConfig};
