//! Background worker for periodic governance work
//!
//! Runs budget reset sweeps, anomaly scans, baseline recomputation,
//! policy sync and store flushes on their own intervals, off the hot
//! path. Shutdown arrives over a broadcast channel, the same way the
//! request-serving side is stopped.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{info, warn};

use crate::service::Governor;

/// Scheduler intervals
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Budget reset sweep cadence
    pub reset_sweep_interval: Duration,
    /// Periodic anomaly scan cadence
    pub scan_interval: Duration,
    /// Baseline recompute cadence (daily by default)
    pub baseline_interval: Duration,
    /// Policy sync cadence
    pub policy_sync_interval: Duration,
    /// Store flush cadence
    pub flush_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reset_sweep_interval: Duration::from_secs(60),
            scan_interval: Duration::from_secs(5 * 60),
            baseline_interval: Duration::from_secs(24 * 60 * 60),
            policy_sync_interval: Duration::from_secs(10 * 60),
            flush_interval: Duration::from_secs(60),
        }
    }
}

/// Periodic worker driving the governor's batch operations
pub struct Scheduler {
    governor: Arc<Governor>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(governor: Arc<Governor>, config: SchedulerConfig) -> Self {
        Self { governor, config }
    }

    /// Run until the shutdown channel fires. Each tick's failure is
    /// isolated; the worker keeps going.
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            reset_sweep_secs = self.config.reset_sweep_interval.as_secs(),
            scan_secs = self.config.scan_interval.as_secs(),
            baseline_secs = self.config.baseline_interval.as_secs(),
            policy_sync_secs = self.config.policy_sync_interval.as_secs(),
            "Starting governor scheduler"
        );

        let mut reset_ticker = interval(self.config.reset_sweep_interval);
        let mut scan_ticker = interval(self.config.scan_interval);
        let mut baseline_ticker = interval(self.config.baseline_interval);
        let mut policy_ticker = interval(self.config.policy_sync_interval);
        let mut flush_ticker = interval(self.config.flush_interval);

        // The first tick of a tokio interval fires immediately; consume
        // them so startup does not trigger every batch at once
        reset_ticker.tick().await;
        scan_ticker.tick().await;
        baseline_ticker.tick().await;
        policy_ticker.tick().await;
        flush_ticker.tick().await;

        loop {
            tokio::select! {
                _ = reset_ticker.tick() => {
                    let reset = self.governor.budgets().sweep_resets();
                    if reset > 0 {
                        info!(budgets_reset = reset, "Budget period boundaries applied");
                    }
                }
                _ = scan_ticker.tick() => {
                    let anomalies = self.governor.scan().await;
                    if !anomalies.is_empty() {
                        info!(count = anomalies.len(), "Periodic anomaly scan found deviations");
                    }
                }
                _ = baseline_ticker.tick() => {
                    self.governor.recompute_baselines().await;
                }
                _ = policy_ticker.tick() => {
                    let report = self.governor.sync_policies(false, None);
                    if !report.failures.is_empty() {
                        warn!(failures = report.failures.len(), "Policy sync skipped conflicted subtrees");
                    }
                }
                _ = flush_ticker.tick() => {
                    if let Err(e) = self.governor.persist() {
                        warn!(error = %e, "Store flush failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down governor scheduler");
                    if let Err(e) = self.governor.persist() {
                        warn!(error = %e, "Final store flush failed");
                    }
                    break;
                }
            }
        }
    }
}
