//! Composite anomaly scoring
//!
//! A 0-100 score built from four additive components:
//! - magnitude (0-40): how far the observation sits from baseline
//! - frequency (0-20): how often this group has deviated recently
//! - impact (0-30): absolute delta in metric units, not just relative
//! - recency (0-10): decays with time since the group's last anomaly
//!
//! Confidence scales with baseline sample size and is surfaced separately
//! from severity; a high score over a thin baseline stays low-confidence.

use crate::models::{MetricKind, Severity};

/// Sample size at which confidence saturates
const FULL_CONFIDENCE_SAMPLES: usize = 20;

/// Z-score at which the magnitude component saturates
const MAGNITUDE_SATURATION_Z: f64 = 5.0;

/// IQR multiples beyond the fence at which magnitude saturates
const MAGNITUDE_SATURATION_IQR: f64 = 3.0;

/// Points per recent deviation in the frequency component
const FREQUENCY_POINTS_PER_DEVIATION: f64 = 5.0;

/// Magnitude component (0-40) from the z-score, or from the IQR distance
/// when the distribution does not support a z-score
pub fn magnitude(z_abs: Option<f64>, iqr_fence_distance: f64) -> f64 {
    match z_abs {
        Some(z) => (z / MAGNITUDE_SATURATION_Z).min(1.0) * 40.0,
        None => (iqr_fence_distance / MAGNITUDE_SATURATION_IQR).min(1.0) * 40.0,
    }
}

/// Frequency component (0-20) from the count of recent deviations
pub fn frequency(recent_deviations: usize) -> f64 {
    (recent_deviations as f64 * FREQUENCY_POINTS_PER_DEVIATION).min(20.0)
}

/// Impact component (0-30) from the absolute delta, scaled per metric so a
/// 50k-token or 25-cost-unit excursion saturates
pub fn impact(metric: MetricKind, abs_delta: f64) -> f64 {
    let scale = match metric {
        MetricKind::Tokens => 50_000.0,
        MetricKind::Cost => 25.0,
        MetricKind::Calls => 500.0,
        MetricKind::DurationMs => 60_000.0,
    };
    (abs_delta / scale).min(1.0) * 30.0
}

/// Recency component (0-10), decaying linearly over the history window
pub fn recency(secs_since_last: Option<i64>, window_secs: i64) -> f64 {
    match secs_since_last {
        Some(elapsed) if window_secs > 0 => {
            let fraction = 1.0 - (elapsed as f64 / window_secs as f64);
            fraction.clamp(0.0, 1.0) * 10.0
        }
        _ => 0.0,
    }
}

/// Sum the components into the 0-100 composite
pub fn composite(magnitude: f64, frequency: f64, impact: f64, recency: f64) -> f64 {
    (magnitude + frequency + impact + recency).clamp(0.0, 100.0)
}

/// Severity bucket for a composite score
pub fn severity_for_score(score: f64) -> Severity {
    if score > 80.0 {
        Severity::Critical
    } else if score > 60.0 {
        Severity::High
    } else if score > 30.0 {
        Severity::Warning
    } else {
        Severity::Info
    }
}

/// Confidence 0-1 from baseline sample size; saturates at 20 samples
pub fn confidence(sample_size: usize) -> f64 {
    (sample_size as f64 / FULL_CONFIDENCE_SAMPLES as f64).clamp(0.0, 1.0)
}
