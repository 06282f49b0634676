//! Observability infrastructure for the usage governor
//!
//! Provides:
//! - Prometheus metrics (hot-path latencies, denial/anomaly/alert counters,
//!   active budget and agent gauges)
//! - Structured JSON logging with tracing

use prometheus::{register_histogram, register_int_gauge, Histogram, IntGauge};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<GovernorMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct GovernorMetricsInner {
    record_latency_seconds: Histogram,
    budget_check_latency_seconds: Histogram,
    ratelimit_check_latency_seconds: Histogram,
    budgets_active: IntGauge,
    agents_tracked: IntGauge,
    usage_events: IntGauge,
    budget_denials: IntGauge,
    ratelimit_denials: IntGauge,
    anomalies_detected: IntGauge,
    alerts_dispatched: IntGauge,
    alerts_suppressed: IntGauge,
}

impl GovernorMetricsInner {
    fn new() -> Self {
        Self {
            record_latency_seconds: register_histogram!(
                "usage_governor_record_latency_seconds",
                "Time spent recording usage events",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register record_latency_seconds"),

            budget_check_latency_seconds: register_histogram!(
                "usage_governor_budget_check_latency_seconds",
                "Time spent in budget check-and-consume",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register budget_check_latency_seconds"),

            ratelimit_check_latency_seconds: register_histogram!(
                "usage_governor_ratelimit_check_latency_seconds",
                "Time spent in rate limit admission checks",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register ratelimit_check_latency_seconds"),

            budgets_active: register_int_gauge!(
                "usage_governor_budgets_active",
                "Number of configured budgets"
            )
            .expect("Failed to register budgets_active"),

            agents_tracked: register_int_gauge!(
                "usage_governor_agents_tracked",
                "Number of agents with retained usage history"
            )
            .expect("Failed to register agents_tracked"),

            usage_events: register_int_gauge!(
                "usage_governor_usage_events_total",
                "Total usage events recorded"
            )
            .expect("Failed to register usage_events_total"),

            budget_denials: register_int_gauge!(
                "usage_governor_budget_denials_total",
                "Total budget check denials"
            )
            .expect("Failed to register budget_denials_total"),

            ratelimit_denials: register_int_gauge!(
                "usage_governor_ratelimit_denials_total",
                "Total rate limit denials"
            )
            .expect("Failed to register ratelimit_denials_total"),

            anomalies_detected: register_int_gauge!(
                "usage_governor_anomalies_detected_total",
                "Total anomalies detected"
            )
            .expect("Failed to register anomalies_detected_total"),

            alerts_dispatched: register_int_gauge!(
                "usage_governor_alerts_dispatched_total",
                "Total alerts dispatched to sinks"
            )
            .expect("Failed to register alerts_dispatched_total"),

            alerts_suppressed: register_int_gauge!(
                "usage_governor_alerts_suppressed_total",
                "Total alerts suppressed by dedup or throttling"
            )
            .expect("Failed to register alerts_suppressed_total"),
        }
    }
}

/// Governor metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct GovernorMetrics {
    _private: (),
}

impl Default for GovernorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GovernorMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(GovernorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &GovernorMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_record_latency(&self, duration_secs: f64) {
        self.inner().record_latency_seconds.observe(duration_secs);
    }

    pub fn observe_budget_check_latency(&self, duration_secs: f64) {
        self.inner()
            .budget_check_latency_seconds
            .observe(duration_secs);
    }

    pub fn observe_ratelimit_check_latency(&self, duration_secs: f64) {
        self.inner()
            .ratelimit_check_latency_seconds
            .observe(duration_secs);
    }

    pub fn set_budgets_active(&self, count: i64) {
        self.inner().budgets_active.set(count);
    }

    pub fn set_agents_tracked(&self, count: i64) {
        self.inner().agents_tracked.set(count);
    }

    pub fn inc_usage_events(&self) {
        self.inner().usage_events.inc();
    }

    pub fn inc_budget_denials(&self) {
        self.inner().budget_denials.inc();
    }

    pub fn inc_ratelimit_denials(&self) {
        self.inner().ratelimit_denials.inc();
    }

    pub fn inc_anomalies_detected(&self) {
        self.inner().anomalies_detected.inc();
    }

    pub fn inc_alerts_dispatched(&self) {
        self.inner().alerts_dispatched.inc();
    }

    pub fn inc_alerts_suppressed(&self) {
        self.inner().alerts_suppressed.inc();
    }
}

/// Structured logger for governance events
///
/// Provides consistent JSON-formatted logging for denials, anomalies,
/// policy syncs and lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a budget denial with the limiting factor
    pub fn log_budget_denied(
        &self,
        agent_id: &str,
        metric: &str,
        limiting_factor: &str,
        percent_used: f64,
    ) {
        info!(
            event = "budget_denied",
            instance = %self.instance,
            agent_id = %agent_id,
            metric = %metric,
            limiting_factor = %limiting_factor,
            percent_used = percent_used,
            "Budget check denied"
        );
    }

    /// Log a rate limit denial
    pub fn log_ratelimit_denied(&self, agent_id: &str, limiting_factor: &str, retry_after: f64) {
        info!(
            event = "ratelimit_denied",
            instance = %self.instance,
            agent_id = %agent_id,
            limiting_factor = %limiting_factor,
            retry_after_seconds = retry_after,
            "Rate limit denied"
        );
    }

    /// Log an anomaly detection event
    pub fn log_anomaly(
        &self,
        agent_id: &str,
        metric: &str,
        severity: &str,
        score: f64,
        baseline: f64,
        observed: f64,
    ) {
        match severity {
            "critical" | "high" => {
                warn!(
                    event = "anomaly_detected",
                    instance = %self.instance,
                    agent_id = %agent_id,
                    metric = %metric,
                    severity = %severity,
                    score = score,
                    baseline = baseline,
                    observed = observed,
                    "Anomaly detected"
                );
            }
            _ => {
                info!(
                    event = "anomaly_detected",
                    instance = %self.instance,
                    agent_id = %agent_id,
                    metric = %metric,
                    severity = %severity,
                    score = score,
                    baseline = baseline,
                    observed = observed,
                    "Anomaly detected"
                );
            }
        }
    }

    /// Log a baseline recompute pass
    pub fn log_baseline_recompute(&self, groups: usize, computed: usize, truncated: bool) {
        if truncated {
            warn!(
                event = "baseline_recompute",
                instance = %self.instance,
                groups = groups,
                computed = computed,
                truncated = true,
                "Baseline recompute hit its deadline, partial results kept"
            );
        } else {
            info!(
                event = "baseline_recompute",
                instance = %self.instance,
                groups = groups,
                computed = computed,
                truncated = false,
                "Baseline recompute completed"
            );
        }
    }

    /// Log a policy sync pass
    pub fn log_policy_sync(&self, dry_run: bool, changed: usize, failures: usize) {
        info!(
            event = "policy_sync",
            instance = %self.instance,
            dry_run = dry_run,
            changed = changed,
            failures = failures,
            "Policy sync completed"
        );
    }

    /// Log governor startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "governor_started",
            instance = %self.instance,
            version = %version,
            "Usage governor started"
        );
    }

    /// Log governor shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "governor_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Usage governor shutting down"
        );
    }
}
