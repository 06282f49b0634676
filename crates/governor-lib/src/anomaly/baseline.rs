//! Rolling baseline maintenance
//!
//! Maintains per-(agent, model, metric) statistical summaries of recent
//! normal behavior. Recomputation is a batch operation over a ledger
//! snapshot: groups are independent, so the batch is split across blocking
//! workers and bounded by an overall deadline. On deadline expiry the
//! partial result is returned with `truncated = true`, never dropped
//! silently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::models::{BaselineKey, BaselineMetrics};
use crate::stats;

/// Default rolling window for baselines (7 days)
pub const DEFAULT_WINDOW_DAYS: u32 = 7;

/// Minimum observations before a baseline supports any verdict
pub const DEFAULT_MIN_SAMPLES: usize = 10;

/// Baseline maintenance configuration
#[derive(Debug, Clone)]
pub struct BaselineConfig {
    pub window_days: u32,
    pub min_samples: usize,
    /// Overall deadline for one batch recompute
    pub recompute_deadline: Duration,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            window_days: DEFAULT_WINDOW_DAYS,
            min_samples: DEFAULT_MIN_SAMPLES,
            recompute_deadline: Duration::from_secs(120),
        }
    }
}

/// Result of one batch recompute
#[derive(Debug, Clone)]
pub struct RecomputeReport {
    pub groups_total: usize,
    pub groups_computed: usize,
    pub truncated: bool,
    pub duration_ms: u64,
}

/// Holds current baselines; recomputed from ledger snapshots
pub struct BaselineManager {
    baselines: DashMap<BaselineKey, BaselineMetrics>,
    config: BaselineConfig,
}

impl BaselineManager {
    pub fn new(config: BaselineConfig) -> Self {
        Self {
            baselines: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &BaselineConfig {
        &self.config
    }

    pub fn get(&self, key: &BaselineKey) -> Option<BaselineMetrics> {
        self.baselines.get(key).map(|b| b.clone())
    }

    pub fn upsert(&self, key: BaselineKey, metrics: BaselineMetrics) {
        self.baselines.insert(key, metrics);
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    /// Compute one group's summary from its raw observations
    pub fn compute_group(&self, values: &[f64], now_ts: i64) -> BaselineMetrics {
        compute_baseline(values, self.config.window_days, now_ts)
    }

    /// Recompute baselines from grouped observations.
    ///
    /// Groups are embarrassingly parallel; they are chunked across blocking
    /// workers, each of which stops when the shared deadline expires.
    pub async fn recompute(&self, groups: Vec<(BaselineKey, Vec<f64>)>) -> RecomputeReport {
        let started = Instant::now();
        let deadline = self.config.recompute_deadline;
        let window_days = self.config.window_days;
        let now_ts = Utc::now().timestamp();
        let groups_total = groups.len();

        if groups.is_empty() {
            return RecomputeReport {
                groups_total: 0,
                groups_computed: 0,
                truncated: false,
                duration_ms: 0,
            };
        }

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(groups_total);
        let chunk_size = groups_total.div_ceil(workers);

        let mut chunks: Vec<Vec<(BaselineKey, Vec<f64>)>> = Vec::with_capacity(workers);
        let mut iter = groups.into_iter().peekable();
        while iter.peek().is_some() {
            chunks.push(iter.by_ref().take(chunk_size).collect());
        }

        let mut handles = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            handles.push(tokio::task::spawn_blocking(move || {
                let mut computed = Vec::with_capacity(chunk.len());
                let mut truncated = false;
                for (key, values) in chunk {
                    if started.elapsed() >= deadline {
                        truncated = true;
                        break;
                    }
                    computed.push((key, compute_baseline(&values, window_days, now_ts)));
                }
                (computed, truncated)
            }));
        }

        let mut groups_computed = 0;
        let mut truncated = false;
        for handle in handles {
            match handle.await {
                Ok((computed, chunk_truncated)) => {
                    truncated |= chunk_truncated;
                    for (key, metrics) in computed {
                        self.baselines.insert(key, metrics);
                        groups_computed += 1;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Baseline recompute worker panicked");
                    truncated = true;
                }
            }
        }

        let report = RecomputeReport {
            groups_total,
            groups_computed,
            truncated,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        debug!(
            groups_total = report.groups_total,
            groups_computed = report.groups_computed,
            truncated = report.truncated,
            duration_ms = report.duration_ms,
            "Baseline recompute finished"
        );
        report
    }
}

impl Default for BaselineManager {
    fn default() -> Self {
        Self::new(BaselineConfig::default())
    }
}

/// Summary statistics over one group's observations
fn compute_baseline(values: &[f64], window_days: u32, now_ts: i64) -> BaselineMetrics {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let q1 = stats::percentile_sorted(&sorted, 25.0);
    let q3 = stats::percentile_sorted(&sorted, 75.0);

    BaselineMetrics {
        mean: stats::mean(values),
        median: stats::percentile_sorted(&sorted, 50.0),
        std_dev: stats::sample_std_dev(values),
        q1,
        q3,
        iqr: q3 - q1,
        sample_size: values.len(),
        window_days,
        last_updated: now_ts,
    }
}

/// Shared handle alias used across the detector and service
pub type SharedBaselines = Arc<BaselineManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricKind;

    fn key(agent: &str) -> BaselineKey {
        BaselineKey {
            agent_id: agent.to_string(),
            model: "gpt-large".to_string(),
            metric: MetricKind::Tokens,
        }
    }

    #[test]
    fn test_compute_baseline_statistics() {
        let manager = BaselineManager::default();
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let baseline = manager.compute_group(&values, 1_700_000_000);

        assert!((baseline.mean - 50.5).abs() < 1e-9);
        assert_eq!(baseline.median, 51.0);
        assert_eq!(baseline.q1, 26.0);
        assert_eq!(baseline.q3, 75.0);
        assert_eq!(baseline.iqr, 49.0);
        assert_eq!(baseline.sample_size, 100);
        assert!(baseline.std_dev > 0.0);
    }

    #[tokio::test]
    async fn test_recompute_all_groups() {
        let manager = BaselineManager::default();
        let groups: Vec<(BaselineKey, Vec<f64>)> = (0..20)
            .map(|i| {
                (
                    key(&format!("agent-{}", i)),
                    (1..=50).map(|v| v as f64).collect(),
                )
            })
            .collect();

        let report = manager.recompute(groups).await;
        assert_eq!(report.groups_total, 20);
        assert_eq!(report.groups_computed, 20);
        assert!(!report.truncated);
        assert_eq!(manager.len(), 20);
    }

    #[tokio::test]
    async fn test_recompute_deadline_truncates() {
        let manager = BaselineManager::new(BaselineConfig {
            recompute_deadline: Duration::ZERO,
            ..BaselineConfig::default()
        });
        let groups = vec![(key("agent-1"), vec![1.0, 2.0, 3.0])];

        let report = manager.recompute(groups).await;
        assert!(report.truncated);
        assert_eq!(report.groups_computed, 0);
    }

    #[tokio::test]
    async fn test_recompute_empty_snapshot() {
        let manager = BaselineManager::default();
        let report = manager.recompute(Vec::new()).await;
        assert_eq!(report.groups_total, 0);
        assert!(!report.truncated);
    }
}
