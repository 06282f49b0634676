//! Anomaly detection for agent consumption patterns
//!
//! This module provides:
//! - Rolling baseline maintenance per (agent, model, metric)
//! - Z-score detection with IQR corroboration
//! - Composite 0-100 scoring with severity buckets and sample-size
//!   confidence

mod baseline;
mod detector;
mod score;

pub use baseline::{
    BaselineConfig, BaselineManager, RecomputeReport, SharedBaselines, DEFAULT_MIN_SAMPLES,
    DEFAULT_WINDOW_DAYS,
};
pub use detector::{AnomalyDetector, DetectorConfig, Observation, SpikePoint, SpikeReport};
pub use score::{confidence, severity_for_score};
