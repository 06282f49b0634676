//! Statistical anomaly detection against rolling baselines
//!
//! Z-score is the primary signal (guarding zero variance by skipping, not
//! dividing); IQR fences corroborate, and gate detection outright when the
//! distribution is skewed. Detection itself is a pure function over the
//! observations, current baselines and deviation history; recording
//! detected anomalies back into the history is a separate, explicit step.

use std::collections::VecDeque;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::baseline::SharedBaselines;
use super::score;
use crate::error::{GovernorError, Result};
use crate::models::{
    simple_id, Anomaly, BaselineKey, BaselineMetrics, DetectionMethod, MetricKind, Severity,
};
use crate::stats;

/// Detection thresholds and history window
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// |z| at or above this is informational
    pub z_info: f64,
    /// |z| at or above this is a warning
    pub z_warning: f64,
    /// |z| at or above this is critical
    pub z_critical: f64,
    /// Fence multiplier for IQR outlier detection
    pub iqr_multiplier: f64,
    /// Window for the frequency/recency score components
    pub history_window_secs: i64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            z_info: 2.0,
            z_warning: 3.0,
            z_critical: 5.0,
            iqr_multiplier: 1.5,
            history_window_secs: 24 * 60 * 60,
        }
    }
}

/// One value to test against its group's baseline
#[derive(Debug, Clone)]
pub struct Observation {
    pub agent_id: String,
    pub model: String,
    pub metric: MetricKind,
    pub value: f64,
    pub timestamp: i64,
}

/// A scored point inside a spike report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikePoint {
    pub timestamp: i64,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,
    pub score: f64,
    pub severity: Severity,
}

/// On-demand single-series drill-down report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikeReport {
    pub agent_id: String,
    pub metric: MetricKind,
    pub from: i64,
    pub to: i64,
    pub observations: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub q1: f64,
    pub q3: f64,
    /// Only the points that exceeded the detection thresholds
    pub spikes: Vec<SpikePoint>,
}

/// Detects deviations from baseline behavior
pub struct AnomalyDetector {
    baselines: SharedBaselines,
    config: DetectorConfig,
    /// Recent anomaly timestamps per group, for frequency/recency scoring
    history: DashMap<BaselineKey, VecDeque<i64>>,
}

impl AnomalyDetector {
    pub fn new(baselines: SharedBaselines, config: DetectorConfig) -> Self {
        Self {
            baselines,
            config,
            history: DashMap::new(),
        }
    }

    pub fn baselines(&self) -> &SharedBaselines {
        &self.baselines
    }

    /// Score observations against their baselines. Pure: no history or
    /// baseline mutation happens here.
    pub fn detect(&self, observations: &[Observation]) -> Vec<Anomaly> {
        observations
            .iter()
            .filter_map(|obs| self.evaluate(obs))
            .collect()
    }

    /// Record detected anomalies into the deviation history so later
    /// frequency/recency components see them
    pub fn note_anomalies(&self, anomalies: &[Anomaly]) {
        for anomaly in anomalies {
            let key = BaselineKey {
                agent_id: anomaly.agent_id.clone(),
                model: anomaly.model.clone(),
                metric: anomaly.metric,
            };
            let mut entries = self.history.entry(key).or_insert_with(VecDeque::new);
            let cutoff = anomaly.timestamp - self.config.history_window_secs;
            while let Some(front) = entries.front() {
                if *front < cutoff {
                    entries.pop_front();
                } else {
                    break;
                }
            }
            entries.push_back(anomaly.timestamp);
        }
    }

    fn evaluate(&self, obs: &Observation) -> Option<Anomaly> {
        let key = BaselineKey {
            agent_id: obs.agent_id.clone(),
            model: obs.model.clone(),
            metric: obs.metric,
        };
        let baseline = self.baselines.get(&key)?;

        let min_samples = self.baselines.config().min_samples;
        if baseline.sample_size < min_samples {
            debug!(
                agent_id = %obs.agent_id,
                metric = %obs.metric,
                sample_size = baseline.sample_size,
                required = min_samples,
                "Skipping detection: insufficient baseline data"
            );
            return None;
        }

        // Zero variance cannot support a z-score; skip rather than divide
        if baseline.std_dev < f64::EPSILON {
            return None;
        }

        let z = (obs.value - baseline.mean) / baseline.std_dev;
        let z_severity = self.z_severity(z.abs());
        let iqr_flag = self.iqr_outlier(&baseline, obs.value);

        // A skewed distribution weakens the normality assumption behind
        // the z-score, so the IQR fence must corroborate
        let skewed = (baseline.mean - baseline.median).abs() > baseline.std_dev;
        let detected = match z_severity {
            Some(_) if skewed => iqr_flag,
            Some(_) => true,
            None => false,
        };
        if !detected {
            return None;
        }

        let (recent, last) = self.deviation_history(&key, obs.timestamp);
        let magnitude = score::magnitude(Some(z.abs()), self.iqr_fence_distance(&baseline, obs.value));
        let frequency = score::frequency(recent);
        let impact = score::impact(obs.metric, (obs.value - baseline.mean).abs());
        let recency = score::recency(last, self.config.history_window_secs);
        let composite = score::composite(magnitude, frequency, impact, recency);

        // Z thresholds set a severity floor so a five-sigma excursion is
        // critical even when its absolute impact is small
        let severity = score::severity_for_score(composite)
            .max(z_severity.unwrap_or(Severity::Info));

        Some(Anomaly {
            id: simple_id("anm"),
            timestamp: obs.timestamp,
            agent_id: obs.agent_id.clone(),
            model: obs.model.clone(),
            metric: obs.metric,
            severity,
            score: composite,
            confidence: score::confidence(baseline.sample_size),
            baseline_mean: baseline.mean,
            observed: obs.value,
            deviation: obs.value - baseline.mean,
            z_score: Some(z),
            method: if iqr_flag {
                DetectionMethod::Iqr
            } else {
                DetectionMethod::ZScore
            },
            resolved: false,
        })
    }

    /// Severity implied by |z| alone
    pub fn z_severity(&self, z_abs: f64) -> Option<Severity> {
        if z_abs >= self.config.z_critical {
            Some(Severity::Critical)
        } else if z_abs >= self.config.z_warning {
            Some(Severity::Warning)
        } else if z_abs >= self.config.z_info {
            Some(Severity::Info)
        } else {
            None
        }
    }

    /// True when the value lies outside the IQR fences
    pub fn iqr_outlier(&self, baseline: &BaselineMetrics, value: f64) -> bool {
        if baseline.iqr <= 0.0 {
            return false;
        }
        let low = baseline.q1 - self.config.iqr_multiplier * baseline.iqr;
        let high = baseline.q3 + self.config.iqr_multiplier * baseline.iqr;
        value < low || value > high
    }

    /// Distance beyond the nearest fence, in IQR multiples
    fn iqr_fence_distance(&self, baseline: &BaselineMetrics, value: f64) -> f64 {
        if baseline.iqr <= 0.0 {
            return 0.0;
        }
        let low = baseline.q1 - self.config.iqr_multiplier * baseline.iqr;
        let high = baseline.q3 + self.config.iqr_multiplier * baseline.iqr;
        if value > high {
            (value - high) / baseline.iqr
        } else if value < low {
            (low - value) / baseline.iqr
        } else {
            0.0
        }
    }

    fn deviation_history(&self, key: &BaselineKey, now_ts: i64) -> (usize, Option<i64>) {
        match self.history.get(key) {
            Some(entries) => {
                let cutoff = now_ts - self.config.history_window_secs;
                let recent = entries.iter().filter(|ts| **ts >= cutoff).count();
                let last = entries.back().map(|ts| now_ts - ts);
                (recent, last)
            }
            None => (0, None),
        }
    }

    /// Score a raw series on demand, using the same thresholds and scoring
    /// as the periodic scan. Declines (soft error) below the minimum
    /// sample size rather than inventing a verdict.
    pub fn analyze_spikes(
        &self,
        agent_id: &str,
        metric: MetricKind,
        series: &[(i64, f64)],
        from: i64,
        to: i64,
    ) -> Result<SpikeReport> {
        let min_samples = self.baselines.config().min_samples;
        if series.len() < min_samples {
            return Err(GovernorError::InsufficientData {
                required: min_samples,
                actual: series.len(),
            });
        }

        let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
        let mut sorted = values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mean = stats::mean(&values);
        let std_dev = stats::sample_std_dev(&values);
        let q1 = stats::percentile_sorted(&sorted, 25.0);
        let q3 = stats::percentile_sorted(&sorted, 75.0);
        let iqr = q3 - q1;

        let mut spikes = Vec::new();
        if std_dev < f64::EPSILON {
            return Ok(SpikeReport {
                agent_id: agent_id.to_string(),
                metric,
                from,
                to,
                observations: series.len(),
                mean,
                std_dev,
                q1,
                q3,
                spikes,
            });
        }
        for (timestamp, value) in series {
            let z = (value - mean) / std_dev;
            if let Some(z_severity) = self.z_severity(z.abs()) {
                let fence_distance = if iqr > 0.0 && *value > q3 + self.config.iqr_multiplier * iqr
                {
                    (*value - (q3 + self.config.iqr_multiplier * iqr)) / iqr
                } else {
                    0.0
                };
                let composite = score::composite(
                    score::magnitude(Some(z.abs()), fence_distance),
                    0.0,
                    score::impact(metric, (value - mean).abs()),
                    0.0,
                );
                spikes.push(SpikePoint {
                    timestamp: *timestamp,
                    value: *value,
                    z_score: Some(z),
                    score: composite,
                    severity: score::severity_for_score(composite).max(z_severity),
                });
            }
        }

        Ok(SpikeReport {
            agent_id: agent_id.to_string(),
            metric,
            from,
            to,
            observations: series.len(),
            mean,
            std_dev,
            q1,
            q3,
            spikes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::baseline::{BaselineConfig, BaselineManager};
    use std::sync::Arc;

    fn key(agent: &str) -> BaselineKey {
        BaselineKey {
            agent_id: agent.to_string(),
            model: "gpt-large".to_string(),
            metric: MetricKind::Tokens,
        }
    }

    fn baseline(mean: f64, std_dev: f64, sample_size: usize) -> BaselineMetrics {
        BaselineMetrics {
            mean,
            median: mean,
            std_dev,
            q1: mean - std_dev,
            q3: mean + std_dev,
            iqr: 2.0 * std_dev,
            sample_size,
            window_days: 7,
            last_updated: 1_700_000_000,
        }
    }

    fn detector_with(baselines: Vec<(BaselineKey, BaselineMetrics)>) -> AnomalyDetector {
        let manager = Arc::new(BaselineManager::new(BaselineConfig::default()));
        for (k, b) in baselines {
            manager.upsert(k, b);
        }
        AnomalyDetector::new(manager, DetectorConfig::default())
    }

    fn observation(agent: &str, value: f64) -> Observation {
        Observation {
            agent_id: agent.to_string(),
            model: "gpt-large".to_string(),
            metric: MetricKind::Tokens,
            value,
            timestamp: 1_700_000_100,
        }
    }

    #[test]
    fn test_five_sigma_is_critical() {
        let detector = detector_with(vec![(key("agent-1"), baseline(10.0, 2.0, 50))]);

        let anomalies = detector.detect(&[observation("agent-1", 20.0)]);
        assert_eq!(anomalies.len(), 1);
        let anomaly = &anomalies[0];
        assert_eq!(anomaly.severity, Severity::Critical);
        assert!((anomaly.z_score.unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(anomaly.baseline_mean, 10.0);
        assert_eq!(anomaly.observed, 20.0);
    }

    #[test]
    fn test_half_sigma_is_no_anomaly() {
        let detector = detector_with(vec![(key("agent-1"), baseline(10.0, 2.0, 50))]);
        let anomalies = detector.detect(&[observation("agent-1", 11.0)]);
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_insufficient_samples_never_produce_anomaly() {
        // Enormous deviation, but only 5 baseline samples
        let detector = detector_with(vec![(key("agent-1"), baseline(10.0, 2.0, 5))]);
        let anomalies = detector.detect(&[observation("agent-1", 10_000.0)]);
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_zero_variance_skips_detection() {
        let detector = detector_with(vec![(key("agent-1"), baseline(10.0, 0.0, 50))]);
        let anomalies = detector.detect(&[observation("agent-1", 10_000.0)]);
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_iqr_fences() {
        let detector = detector_with(vec![]);
        let b = BaselineMetrics {
            mean: 10.0,
            median: 10.0,
            std_dev: 2.0,
            q1: 8.0,
            q3: 12.0,
            iqr: 4.0,
            sample_size: 50,
            window_days: 7,
            last_updated: 1_700_000_000,
        };

        // Upper fence is 12 + 1.5 * 4 = 18
        assert!(detector.iqr_outlier(&b, 19.0));
        assert!(!detector.iqr_outlier(&b, 15.0));
        // Lower fence is 8 - 1.5 * 4 = 2
        assert!(detector.iqr_outlier(&b, 1.0));
        assert!(!detector.iqr_outlier(&b, 3.0));
    }

    #[test]
    fn test_skewed_distribution_requires_iqr_corroboration() {
        // mean far from median relative to std_dev: skewed.
        // Upper IQR fence sits at 15 + 1.5 * 10 = 30.
        let skewed = BaselineMetrics {
            mean: 20.0,
            median: 10.0,
            std_dev: 4.0,
            q1: 5.0,
            q3: 15.0,
            iqr: 10.0,
            sample_size: 50,
            window_days: 7,
            last_updated: 1_700_000_000,
        };
        let detector = detector_with(vec![(key("agent-1"), skewed)]);

        // z = 2.25 but inside the fence: suppressed for skewed baselines
        let inside = detector.detect(&[observation("agent-1", 29.0)]);
        assert!(inside.is_empty());

        // z = 2.75 AND beyond the fence: corroborated, detected
        let outside = detector.detect(&[observation("agent-1", 31.0)]);
        assert_eq!(outside.len(), 1);
        assert_eq!(outside[0].method, DetectionMethod::Iqr);
    }

    #[test]
    fn test_frequency_raises_score() {
        let detector = detector_with(vec![(key("agent-1"), baseline(10.0, 2.0, 50))]);

        let first = detector.detect(&[observation("agent-1", 20.0)]);
        detector.note_anomalies(&first);

        let second = detector.detect(&[observation("agent-1", 20.0)]);
        assert!(second[0].score > first[0].score);
    }

    #[test]
    fn test_confidence_reflects_sample_size() {
        let thin = detector_with(vec![(key("agent-1"), baseline(10.0, 2.0, 12))]);
        let thick = detector_with(vec![(key("agent-1"), baseline(10.0, 2.0, 60))]);

        let a = thin.detect(&[observation("agent-1", 20.0)]);
        let b = thick.detect(&[observation("agent-1", 20.0)]);

        assert!(a[0].confidence < b[0].confidence);
        assert_eq!(b[0].confidence, 1.0);
        // Severity is not dampened by low confidence
        assert_eq!(a[0].severity, Severity::Critical);
    }

    #[test]
    fn test_analyze_spikes_declines_below_min_samples() {
        let detector = detector_with(vec![]);
        let series = vec![(1_700_000_000, 1.0); 5];
        let err = detector
            .analyze_spikes("agent-1", MetricKind::Tokens, &series, 0, 1)
            .unwrap_err();
        assert!(matches!(err, GovernorError::InsufficientData { .. }));
    }

    #[test]
    fn test_analyze_spikes_flags_the_spike() {
        let detector = detector_with(vec![]);
        let mut series: Vec<(i64, f64)> = (0..30)
            .map(|i| (1_700_000_000 + i * 60, 100.0 + (i % 5) as f64))
            .collect();
        series.push((1_700_002_000, 500.0));

        let report = detector
            .analyze_spikes("agent-1", MetricKind::Tokens, &series, 1_700_000_000, 1_700_002_000)
            .unwrap();

        assert_eq!(report.observations, 31);
        assert_eq!(report.spikes.len(), 1);
        assert_eq!(report.spikes[0].value, 500.0);
        assert!(report.spikes[0].z_score.unwrap() > 2.0);
    }
}
