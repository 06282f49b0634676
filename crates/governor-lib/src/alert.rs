//! Alert routing for anomalies and budget threshold crossings
//!
//! Handles:
//! - Route lookup by severity (channels, hour/day throttles, task creation)
//! - Deduplication of identical (agent, metric, severity) alerts within a
//!   configurable window
//! - Fan-out to sinks with per-sink failure isolation
//! - Webhook payload formatting for external alert managers

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{
    simple_id, Alert, Anomaly, CrossingKind, DeliveryOutcome, FollowUpTask, MetricKind, Severity,
    ThresholdCrossing,
};

/// Default deduplication window (15 minutes)
const DEFAULT_DEDUP_WINDOW_SECS: u64 = 15 * 60;

/// Delivery target for one channel
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Channel name this sink serves
    fn name(&self) -> &str;

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Route configuration for one severity level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRoute {
    pub channels: Vec<String>,
    pub max_per_hour: u32,
    pub max_per_day: u32,
    pub create_task: bool,
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub dedup_window: Duration,
    pub routes: HashMap<Severity, AlertRoute>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let mut routes = HashMap::new();
        routes.insert(
            Severity::Info,
            AlertRoute {
                channels: vec!["log".to_string()],
                max_per_hour: 10,
                max_per_day: 50,
                create_task: false,
            },
        );
        routes.insert(
            Severity::Warning,
            AlertRoute {
                channels: vec!["log".to_string()],
                max_per_hour: 10,
                max_per_day: 50,
                create_task: false,
            },
        );
        routes.insert(
            Severity::High,
            AlertRoute {
                channels: vec!["log".to_string()],
                max_per_hour: 20,
                max_per_day: 100,
                create_task: true,
            },
        );
        routes.insert(
            Severity::Critical,
            AlertRoute {
                channels: vec!["log".to_string()],
                max_per_hour: 30,
                max_per_day: 200,
                create_task: true,
            },
        );
        Self {
            dedup_window: Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS),
            routes,
        }
    }
}

/// Key for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    agent_id: String,
    metric: MetricKind,
    severity: Severity,
}

/// Hour/day emission counters for one severity
#[derive(Debug, Default)]
struct WindowCounters {
    hour_bucket: i64,
    hour_count: u32,
    day_bucket: i64,
    day_count: u32,
}

/// Routes alerts to sinks with dedup and throttling
pub struct AlertRouter {
    config: RouterConfig,
    sinks: HashMap<String, Arc<dyn AlertSink>>,
    /// Recent alerts for deduplication (key -> last emission time)
    recent: RwLock<HashMap<DedupKey, Instant>>,
    windows: RwLock<HashMap<Severity, WindowCounters>>,
    tasks: Mutex<Vec<FollowUpTask>>,
}

impl AlertRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            sinks: HashMap::new(),
            recent: RwLock::new(HashMap::new()),
            windows: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a sink for its channel name
    pub fn register_sink(&mut self, sink: Arc<dyn AlertSink>) {
        self.sinks.insert(sink.name().to_string(), sink);
    }

    /// Route an anomaly. Returns `None` when deduplicated or throttled.
    pub async fn route_anomaly(&self, anomaly: &Anomaly) -> Option<Alert> {
        let title = format!(
            "Usage anomaly: {} {} for agent {}",
            anomaly.severity, anomaly.metric, anomaly.agent_id
        );
        let body = format!(
            "Observed {:.2} against baseline {:.2} (deviation {:+.2}{}). Score {:.0}/100, confidence {:.0}%.",
            anomaly.observed,
            anomaly.baseline_mean,
            anomaly.deviation,
            anomaly
                .z_score
                .map(|z| format!(", z-score {:.1}", z))
                .unwrap_or_default(),
            anomaly.score,
            anomaly.confidence * 100.0,
        );

        self.route(
            anomaly.severity,
            &anomaly.agent_id,
            anomaly.metric,
            title,
            body,
            Some(anomaly.baseline_mean),
            Some(anomaly.observed),
            anomaly.timestamp,
        )
        .await
    }

    /// Route a budget threshold crossing
    pub async fn route_crossing(&self, crossing: &ThresholdCrossing) -> Option<Alert> {
        let severity = match crossing.kind {
            CrossingKind::AlertThreshold => Severity::Warning,
            CrossingKind::LimitReached => Severity::High,
        };
        let title = format!(
            "Budget {}: {} {} budget for {}",
            match crossing.kind {
                CrossingKind::AlertThreshold => "threshold crossed",
                CrossingKind::LimitReached => "limit reached",
            },
            crossing.period,
            crossing.metric,
            crossing.scope,
        );
        let body = format!(
            "Budget {} is at {:.1}% of its limit.",
            crossing.budget_id, crossing.percent_used
        );

        self.route(
            severity,
            crossing.scope.key(),
            crossing.metric,
            title,
            body,
            None,
            Some(crossing.percent_used),
            crossing.timestamp,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn route(
        &self,
        severity: Severity,
        agent_id: &str,
        metric: MetricKind,
        title: String,
        body: String,
        baseline: Option<f64>,
        observed: Option<f64>,
        timestamp: i64,
    ) -> Option<Alert> {
        let route = self.config.routes.get(&severity)?.clone();

        let key = DedupKey {
            agent_id: agent_id.to_string(),
            metric,
            severity,
        };
        if self.should_suppress(&key) {
            return None;
        }
        if !self.admit_window(severity, timestamp, &route) {
            warn!(severity = %severity, agent_id = %agent_id, "Alert throttled by route rate limit");
            return None;
        }

        let mut alert = Alert {
            id: simple_id("alr"),
            timestamp,
            severity,
            agent_id: agent_id.to_string(),
            metric,
            title,
            body,
            baseline,
            observed,
            channels: route.channels.clone(),
            deliveries: Vec::new(),
        };

        // Fan out concurrently; one channel's failure never blocks the rest
        let mut handles = Vec::with_capacity(route.channels.len());
        for channel in &route.channels {
            match self.sinks.get(channel) {
                Some(sink) => {
                    let sink = sink.clone();
                    let payload = alert.clone();
                    let channel = channel.clone();
                    handles.push(tokio::spawn(async move {
                        match sink.deliver(&payload).await {
                            Ok(()) => DeliveryOutcome {
                                channel,
                                delivered: true,
                                error: None,
                            },
                            Err(e) => DeliveryOutcome {
                                channel,
                                delivered: false,
                                error: Some(e.to_string()),
                            },
                        }
                    }));
                }
                None => alert.deliveries.push(DeliveryOutcome {
                    channel: channel.clone(),
                    delivered: false,
                    error: Some("no sink registered".to_string()),
                }),
            }
        }
        for handle in handles {
            match handle.await {
                Ok(outcome) => alert.deliveries.push(outcome),
                Err(e) => warn!(error = %e, "Alert delivery task panicked"),
            }
        }

        self.record_emission(key);

        if route.create_task {
            let task = FollowUpTask {
                id: simple_id("tsk"),
                title: alert.title.clone(),
                body: alert.body.clone(),
                severity,
                agent_id: agent_id.to_string(),
                created_at: timestamp,
            };
            self.tasks.lock().unwrap().push(task);
        }

        Some(alert)
    }

    fn should_suppress(&self, key: &DedupKey) -> bool {
        let recent = self.recent.read().unwrap();
        match recent.get(key) {
            Some(last) => last.elapsed() < self.config.dedup_window,
            None => false,
        }
    }

    fn record_emission(&self, key: DedupKey) {
        let mut recent = self.recent.write().unwrap();
        recent.insert(key, Instant::now());
        let window = self.config.dedup_window;
        recent.retain(|_, time| time.elapsed() < window);
    }

    /// Check and count against the route's hour/day ceilings
    fn admit_window(&self, severity: Severity, timestamp: i64, route: &AlertRoute) -> bool {
        let mut windows = self.windows.write().unwrap();
        let counters = windows.entry(severity).or_default();

        let hour_bucket = timestamp / 3600;
        let day_bucket = timestamp / 86_400;
        if counters.hour_bucket != hour_bucket {
            counters.hour_bucket = hour_bucket;
            counters.hour_count = 0;
        }
        if counters.day_bucket != day_bucket {
            counters.day_bucket = day_bucket;
            counters.day_count = 0;
        }

        if counters.hour_count >= route.max_per_hour || counters.day_count >= route.max_per_day {
            return false;
        }
        counters.hour_count += 1;
        counters.day_count += 1;
        true
    }

    /// Take the follow-up work items accumulated so far
    pub fn drain_tasks(&self) -> Vec<FollowUpTask> {
        std::mem::take(&mut *self.tasks.lock().unwrap())
    }

    /// Clear expired deduplication entries
    pub fn cleanup_dedup_cache(&self) {
        let mut recent = self.recent.write().unwrap();
        let window = self.config.dedup_window;
        recent.retain(|_, time| time.elapsed() < window);
    }
}

/// Sink that writes alerts to the structured log
pub struct TracingSink;

#[async_trait]
impl AlertSink for TracingSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        match alert.severity {
            Severity::High | Severity::Critical => warn!(
                event = "alert",
                alert_id = %alert.id,
                severity = %alert.severity,
                agent_id = %alert.agent_id,
                metric = %alert.metric,
                baseline = ?alert.baseline,
                observed = ?alert.observed,
                "{}",
                alert.title
            ),
            _ => info!(
                event = "alert",
                alert_id = %alert.id,
                severity = %alert.severity,
                agent_id = %alert.agent_id,
                metric = %alert.metric,
                baseline = ?alert.baseline,
                observed = ?alert.observed,
                "{}",
                alert.title
            ),
        }
        Ok(())
    }
}

/// Test/inspection sink that records delivered alerts in memory and can
/// be told to fail
pub struct RecordingSink {
    channel: String,
    fail: bool,
    delivered: Mutex<Vec<Alert>>,
}

impl RecordingSink {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            fail: false,
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            fail: true,
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn delivered(&self) -> Vec<Alert> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    fn name(&self) -> &str {
        &self.channel
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("sink {} unavailable", self.channel);
        }
        self.delivered.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Webhook alert format for external alert managers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Alert status (firing or resolved)
    pub status: String,
    /// Labels for routing and grouping
    pub labels: HashMap<String, String>,
    /// Annotations with details
    pub annotations: HashMap<String, String>,
    /// Start time in RFC3339 format
    pub starts_at: String,
}

impl WebhookPayload {
    pub fn from_alert(alert: &Alert) -> Self {
        let mut labels = HashMap::new();
        labels.insert("alertname".to_string(), "AgentUsageAlert".to_string());
        labels.insert("severity".to_string(), alert.severity.to_string());
        labels.insert("agent_id".to_string(), alert.agent_id.clone());
        labels.insert("metric".to_string(), alert.metric.to_string());

        let mut annotations = HashMap::new();
        annotations.insert("summary".to_string(), alert.title.clone());
        annotations.insert("description".to_string(), alert.body.clone());
        if let Some(baseline) = alert.baseline {
            annotations.insert("baseline".to_string(), format!("{:.4}", baseline));
        }
        if let Some(observed) = alert.observed {
            annotations.insert("observed".to_string(), format!("{:.4}", observed));
        }

        let starts_at = chrono::DateTime::from_timestamp(alert.timestamp, 0)
            .unwrap_or_else(Utc::now)
            .to_rfc3339();

        Self {
            status: "firing".to_string(),
            labels,
            annotations,
            starts_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DetectionMethod;

    fn anomaly(agent: &str, severity: Severity) -> Anomaly {
        Anomaly {
            id: simple_id("anm"),
            timestamp: 1_700_000_000,
            agent_id: agent.to_string(),
            model: "gpt-large".to_string(),
            metric: MetricKind::Tokens,
            severity,
            score: 75.0,
            confidence: 0.9,
            baseline_mean: 100.0,
            observed: 400.0,
            deviation: 300.0,
            z_score: Some(4.2),
            method: DetectionMethod::ZScore,
            resolved: false,
        }
    }

    fn router_with(sinks: Vec<Arc<dyn AlertSink>>, config: RouterConfig) -> AlertRouter {
        let mut router = AlertRouter::new(config);
        for sink in sinks {
            router.register_sink(sink);
        }
        router
    }

    fn single_channel_config(channel: &str) -> RouterConfig {
        let mut config = RouterConfig::default();
        for route in config.routes.values_mut() {
            route.channels = vec![channel.to_string()];
        }
        config
    }

    #[tokio::test]
    async fn test_alert_carries_baseline_and_observed() {
        let sink = Arc::new(RecordingSink::new("test"));
        let router = router_with(vec![sink.clone() as Arc<dyn AlertSink>], single_channel_config("test"));

        let alert = router
            .route_anomaly(&anomaly("agent-1", Severity::High))
            .await
            .unwrap();

        assert_eq!(alert.baseline, Some(100.0));
        assert_eq!(alert.observed, Some(400.0));
        assert_eq!(sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_deduplication_window() {
        let sink = Arc::new(RecordingSink::new("test"));
        let mut config = single_channel_config("test");
        config.dedup_window = Duration::from_millis(100);
        let router = router_with(vec![sink.clone() as Arc<dyn AlertSink>], config);

        let first = router.route_anomaly(&anomaly("agent-1", Severity::High)).await;
        assert!(first.is_some());

        let suppressed = router.route_anomaly(&anomaly("agent-1", Severity::High)).await;
        assert!(suppressed.is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;

        let after_window = router.route_anomaly(&anomaly("agent-1", Severity::High)).await;
        assert!(after_window.is_some());
        assert_eq!(sink.delivered().len(), 2);
    }

    #[tokio::test]
    async fn test_different_severities_not_deduplicated() {
        let sink = Arc::new(RecordingSink::new("test"));
        let router = router_with(vec![sink.clone() as Arc<dyn AlertSink>], single_channel_config("test"));

        assert!(router
            .route_anomaly(&anomaly("agent-1", Severity::High))
            .await
            .is_some());
        assert!(router
            .route_anomaly(&anomaly("agent-1", Severity::Critical))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_block_others() {
        let good = Arc::new(RecordingSink::new("good"));
        let bad = Arc::new(RecordingSink::failing("bad"));

        let mut config = RouterConfig::default();
        config.routes.get_mut(&Severity::High).unwrap().channels =
            vec!["bad".to_string(), "good".to_string()];

        let router = router_with(vec![good.clone() as Arc<dyn AlertSink>, bad], config);
        let alert = router
            .route_anomaly(&anomaly("agent-1", Severity::High))
            .await
            .unwrap();

        assert_eq!(good.delivered().len(), 1);
        let bad_outcome = alert
            .deliveries
            .iter()
            .find(|d| d.channel == "bad")
            .unwrap();
        assert!(!bad_outcome.delivered);
        assert!(bad_outcome.error.is_some());
        let good_outcome = alert
            .deliveries
            .iter()
            .find(|d| d.channel == "good")
            .unwrap();
        assert!(good_outcome.delivered);
    }

    #[tokio::test]
    async fn test_route_rate_limit_throttles() {
        let sink = Arc::new(RecordingSink::new("test"));
        let mut config = single_channel_config("test");
        config.dedup_window = Duration::ZERO;
        config.routes.get_mut(&Severity::High).unwrap().max_per_hour = 2;
        let router = router_with(vec![sink.clone() as Arc<dyn AlertSink>], config);

        assert!(router.route_anomaly(&anomaly("a-1", Severity::High)).await.is_some());
        assert!(router.route_anomaly(&anomaly("a-2", Severity::High)).await.is_some());
        assert!(router.route_anomaly(&anomaly("a-3", Severity::High)).await.is_none());
        assert_eq!(sink.delivered().len(), 2);
    }

    #[tokio::test]
    async fn test_follow_up_task_for_configured_routes() {
        let sink = Arc::new(RecordingSink::new("test"));
        let router = router_with(vec![sink as Arc<dyn AlertSink>], single_channel_config("test"));

        router.route_anomaly(&anomaly("agent-1", Severity::Critical)).await;
        router.route_anomaly(&anomaly("agent-2", Severity::Info)).await;

        let tasks = router.drain_tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].agent_id, "agent-1");
        assert!(router.drain_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_crossing_route_severity() {
        let sink = Arc::new(RecordingSink::new("test"));
        let router = router_with(vec![sink as Arc<dyn AlertSink>], single_channel_config("test"));

        let crossing = ThresholdCrossing {
            budget_id: "bgt-1".to_string(),
            scope: crate::models::BudgetScope::Agent("agent-1".to_string()),
            metric: MetricKind::Cost,
            period: crate::models::BudgetPeriod::Day,
            kind: CrossingKind::LimitReached,
            percent_used: 100.0,
            timestamp: 1_700_000_000,
        };

        let alert = router.route_crossing(&crossing).await.unwrap();
        assert_eq!(alert.severity, Severity::High);
        assert!(alert.title.contains("limit reached"));
    }

    #[test]
    fn test_webhook_payload_format() {
        let mut a = anomaly("agent-1", Severity::Critical);
        a.id = "anm-test".to_string();
        let alert = Alert {
            id: "alr-test".to_string(),
            timestamp: 1_700_000_000,
            severity: a.severity,
            agent_id: a.agent_id.clone(),
            metric: a.metric,
            title: "Usage anomaly".to_string(),
            body: "details".to_string(),
            baseline: Some(100.0),
            observed: Some(400.0),
            channels: vec!["webhook".to_string()],
            deliveries: Vec::new(),
        };

        let payload = WebhookPayload::from_alert(&alert);
        assert_eq!(payload.status, "firing");
        assert_eq!(payload.labels.get("severity").unwrap(), "critical");
        assert_eq!(payload.labels.get("agent_id").unwrap(), "agent-1");
        assert_eq!(payload.annotations.get("baseline").unwrap(), "100.0000");
        assert!(payload.starts_at.starts_with("2023-11-14T"));
    }
}
