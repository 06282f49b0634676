//! Usage ledger: append-only event recording and windowed aggregation
//!
//! Events are held in retention-bounded per-agent series. Aggregation scans
//! only the events inside the requested window; baseline recomputation reads
//! a grouped snapshot and may run concurrently with new recordings.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

use crate::error::{GovernorError, Result};
use crate::models::{Aggregate, BaselineKey, MetricKind, UsageEvent};
use crate::stats;

/// Default retention for in-memory series (7 days)
const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Cap on events held per agent regardless of retention
const DEFAULT_MAX_EVENTS_PER_AGENT: usize = 100_000;

/// Metrics that produce per-event observations for baselines
const BASELINE_METRICS: [MetricKind; 3] =
    [MetricKind::Tokens, MetricKind::Cost, MetricKind::DurationMs];

/// Configuration for the usage ledger
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub retention: Duration,
    pub max_events_per_agent: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            max_events_per_agent: DEFAULT_MAX_EVENTS_PER_AGENT,
        }
    }
}

/// Append-only usage event ledger with windowed aggregates
pub struct UsageLedger {
    series: DashMap<String, VecDeque<UsageEvent>>,
    config: LedgerConfig,
}

impl UsageLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            series: DashMap::new(),
            config,
        }
    }

    /// Record a usage event. Fails only on malformed input.
    pub fn record(&self, event: UsageEvent) -> Result<()> {
        if event.agent_id.trim().is_empty() {
            return Err(GovernorError::validation("agent_id must not be empty"));
        }
        if event.model.trim().is_empty() {
            return Err(GovernorError::validation("model must not be empty"));
        }
        if event.cost_units < 0.0 {
            return Err(GovernorError::validation("cost_units must not be negative"));
        }
        if event.timestamp <= 0 {
            return Err(GovernorError::validation("timestamp must be positive"));
        }

        let retention_secs = self.config.retention.as_secs() as i64;
        let max_events = self.config.max_events_per_agent;

        let mut series = self
            .series
            .entry(event.agent_id.clone())
            .or_insert_with(VecDeque::new);

        let cutoff = event.timestamp - retention_secs;
        while let Some(front) = series.front() {
            if front.timestamp < cutoff {
                series.pop_front();
            } else {
                break;
            }
        }

        series.push_back(event);
        while series.len() > max_events {
            series.pop_front();
        }

        Ok(())
    }

    /// Aggregate an agent's metric over the trailing window ending now
    pub fn aggregate(&self, agent_id: &str, metric: MetricKind, window: Duration) -> Aggregate {
        self.aggregate_at(agent_id, metric, window, Utc::now().timestamp())
    }

    /// Aggregate over the window ending at `now_ts`.
    ///
    /// Returns a zero-aggregate (not an error) when no events fall inside
    /// the window.
    pub fn aggregate_at(
        &self,
        agent_id: &str,
        metric: MetricKind,
        window: Duration,
        now_ts: i64,
    ) -> Aggregate {
        let from = now_ts - window.as_secs() as i64;

        let values: Vec<f64> = match self.series.get(agent_id) {
            Some(series) => series
                .iter()
                .filter(|e| e.timestamp > from && e.timestamp <= now_ts)
                .map(|e| e.metric_value(metric))
                .collect(),
            None => return Aggregate::zero(),
        };

        if values.is_empty() {
            return Aggregate::zero();
        }

        let mut sorted = values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Aggregate {
            count: values.len() as u64,
            sum: values.iter().sum(),
            mean: stats::mean(&values),
            std_dev: stats::sample_std_dev(&values),
            p25: stats::percentile_sorted(&sorted, 25.0),
            p50: stats::percentile_sorted(&sorted, 50.0),
            p75: stats::percentile_sorted(&sorted, 75.0),
        }
    }

    /// Raw (timestamp, value) observations for drill-down, oldest first
    pub fn observations(
        &self,
        agent_id: &str,
        metric: MetricKind,
        from: i64,
        to: i64,
    ) -> Vec<(i64, f64)> {
        match self.series.get(agent_id) {
            Some(series) => series
                .iter()
                .filter(|e| e.timestamp >= from && e.timestamp <= to)
                .map(|e| (e.timestamp, e.metric_value(metric)))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Snapshot of per-(agent, model, metric) observations inside the window,
    /// feeding baseline recomputation. Reads a point-in-time copy; recording
    /// may continue concurrently.
    pub fn snapshot_groups(&self, window: Duration, now_ts: i64) -> Vec<(BaselineKey, Vec<f64>)> {
        let from = now_ts - window.as_secs() as i64;
        let mut groups: HashMap<BaselineKey, Vec<f64>> = HashMap::new();

        for entry in self.series.iter() {
            for event in entry.value().iter() {
                if event.timestamp <= from || event.timestamp > now_ts {
                    continue;
                }
                for metric in BASELINE_METRICS {
                    let key = BaselineKey {
                        agent_id: event.agent_id.clone(),
                        model: event.model.clone(),
                        metric,
                    };
                    groups.entry(key).or_default().push(event.metric_value(metric));
                }
            }
        }

        groups.into_iter().collect()
    }

    /// Agents with at least one retained event
    pub fn agents_tracked(&self) -> usize {
        self.series.len()
    }

    /// Total retained events across all agents
    pub fn total_events(&self) -> usize {
        self.series.iter().map(|e| e.value().len()).sum()
    }
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Outcome;

    fn event(agent: &str, tokens: u64, ts: i64) -> UsageEvent {
        UsageEvent {
            agent_id: agent.to_string(),
            model: "gpt-large".to_string(),
            tokens,
            cost_units: tokens as f64 * 0.0003,
            duration_ms: 800,
            outcome: Outcome::Success,
            timestamp: ts,
        }
    }

    #[test]
    fn test_record_rejects_malformed_input() {
        let ledger = UsageLedger::default();

        let mut missing_agent = event("agent-1", 10, 1_700_000_000);
        missing_agent.agent_id = "".to_string();
        assert!(matches!(
            ledger.record(missing_agent),
            Err(GovernorError::Validation(_))
        ));

        let mut negative_cost = event("agent-1", 10, 1_700_000_000);
        negative_cost.cost_units = -1.0;
        assert!(matches!(
            ledger.record(negative_cost),
            Err(GovernorError::Validation(_))
        ));
    }

    #[test]
    fn test_zero_aggregate_when_empty() {
        let ledger = UsageLedger::default();
        let agg = ledger.aggregate_at(
            "missing",
            MetricKind::Tokens,
            Duration::from_secs(3600),
            1_700_000_000,
        );
        assert_eq!(agg.count, 0);
        assert_eq!(agg.sum, 0.0);
    }

    #[test]
    fn test_aggregate_over_window() {
        let ledger = UsageLedger::default();
        let now = 1_700_000_000;

        for i in 0..10 {
            ledger.record(event("agent-1", 100 * (i + 1), now - 100 + i as i64 * 10)).unwrap();
        }
        // Outside the window
        ledger.record(event("agent-1", 99_999, now - 10_000)).unwrap();

        let agg = ledger.aggregate_at("agent-1", MetricKind::Tokens, Duration::from_secs(200), now);
        assert_eq!(agg.count, 10);
        assert_eq!(agg.sum, 5500.0);
        assert!((agg.mean - 550.0).abs() < 1e-9);
        // Nearest-rank at p50 over 10 samples lands on the 6th value
        assert_eq!(agg.p50, 600.0);
        assert!(agg.std_dev > 0.0);
    }

    #[test]
    fn test_retention_expiry() {
        let ledger = UsageLedger::new(LedgerConfig {
            retention: Duration::from_secs(100),
            max_events_per_agent: 1000,
        });
        let now = 1_700_000_000;

        ledger.record(event("agent-1", 1, now - 500)).unwrap();
        ledger.record(event("agent-1", 2, now)).unwrap();

        // The expired event is gone even for an unbounded query window
        let obs = ledger.observations("agent-1", MetricKind::Tokens, 0, now);
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].1, 2.0);
    }

    #[test]
    fn test_max_events_cap() {
        let ledger = UsageLedger::new(LedgerConfig {
            retention: Duration::from_secs(1_000_000),
            max_events_per_agent: 5,
        });
        let now = 1_700_000_000;

        for i in 0..10 {
            ledger.record(event("agent-1", i, now + i as i64)).unwrap();
        }

        let obs = ledger.observations("agent-1", MetricKind::Tokens, 0, now + 100);
        assert_eq!(obs.len(), 5);
        assert_eq!(obs[0].1, 5.0);
    }

    #[test]
    fn test_snapshot_groups_by_model_and_metric() {
        let ledger = UsageLedger::default();
        let now = 1_700_000_000;

        ledger.record(event("agent-1", 100, now - 10)).unwrap();
        let mut other_model = event("agent-1", 200, now - 5);
        other_model.model = "gpt-small".to_string();
        ledger.record(other_model).unwrap();

        let groups = ledger.snapshot_groups(Duration::from_secs(3600), now);
        // 2 models x 3 baseline metrics
        assert_eq!(groups.len(), 6);

        let tokens_large = groups
            .iter()
            .find(|(k, _)| k.model == "gpt-large" && k.metric == MetricKind::Tokens)
            .unwrap();
        assert_eq!(tokens_large.1, vec![100.0]);
    }
}
