//! Core data models for the usage governor

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Resource metric tracked per usage event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Tokens,
    Cost,
    Calls,
    DurationMs,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Tokens => write!(f, "tokens"),
            MetricKind::Cost => write!(f, "cost"),
            MetricKind::Calls => write!(f, "calls"),
            MetricKind::DurationMs => write!(f, "duration_ms"),
        }
    }
}

/// Outcome of the agent call that produced a usage event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Error,
}

/// A discrete usage record; immutable once recorded, append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub agent_id: String,
    pub model: String,
    pub tokens: u64,
    pub cost_units: f64,
    pub duration_ms: u64,
    pub outcome: Outcome,
    pub timestamp: i64,
}

impl UsageEvent {
    /// Value of this event for a given metric (calls count as 1 each)
    pub fn metric_value(&self, metric: MetricKind) -> f64 {
        match metric {
            MetricKind::Tokens => self.tokens as f64,
            MetricKind::Cost => self.cost_units,
            MetricKind::Calls => 1.0,
            MetricKind::DurationMs => self.duration_ms as f64,
        }
    }
}

/// Windowed aggregate over a usage series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
}

impl Aggregate {
    /// Zero-aggregate returned when no events fall inside the window
    pub fn zero() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            mean: 0.0,
            std_dev: 0.0,
            p25: 0.0,
            p50: 0.0,
            p75: 0.0,
        }
    }
}

/// What a budget applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetScope {
    Global,
    Agent(String),
}

impl BudgetScope {
    /// Stable key for lookups and dedup
    pub fn key(&self) -> &str {
        match self {
            BudgetScope::Global => "global",
            BudgetScope::Agent(id) => id,
        }
    }
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Recurring reset cadence for a budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Hour,
    Day,
    Week,
    Month,
    /// Never resets
    Total,
}

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetPeriod::Hour => write!(f, "hourly"),
            BudgetPeriod::Day => write!(f, "daily"),
            BudgetPeriod::Week => write!(f, "weekly"),
            BudgetPeriod::Month => write!(f, "monthly"),
            BudgetPeriod::Total => write!(f, "total"),
        }
    }
}

/// A configured ceiling on a metric over a recurring period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub id: String,
    pub scope: BudgetScope,
    pub metric: MetricKind,
    pub limit: f64,
    pub period: BudgetPeriod,
    /// Fraction of the limit at which a threshold crossing is emitted
    pub alert_threshold: f64,
    /// Hard-enforce (deny past the limit) vs warn-only
    pub enforce_limit: bool,
    pub current: f64,
    /// Next period boundary; `None` for `Total` budgets
    pub reset_at: Option<i64>,
    pub created_at: i64,
}

impl Budget {
    pub fn percent_used(&self) -> f64 {
        if self.limit <= 0.0 {
            return 0.0;
        }
        self.current / self.limit * 100.0
    }
}

/// Result of an atomic budget check-and-consume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub remaining: f64,
    pub percent_used: f64,
    /// Which limit denied the call, e.g. "hourly tokens budget"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limiting_factor: Option<String>,
}

/// Point-in-time view of a budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub budget_id: String,
    pub scope: BudgetScope,
    pub metric: MetricKind,
    pub period: BudgetPeriod,
    pub current: f64,
    pub limit: f64,
    pub percent_used: f64,
    pub enforce_limit: bool,
    pub reset_at: Option<i64>,
}

/// Kind of budget threshold event surfaced to the alert router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossingKind {
    AlertThreshold,
    LimitReached,
}

/// A budget crossing its alert threshold or its limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdCrossing {
    pub budget_id: String,
    pub scope: BudgetScope,
    pub metric: MetricKind,
    pub period: BudgetPeriod,
    pub kind: CrossingKind,
    pub percent_used: f64,
    pub timestamp: i64,
}

/// Per-agent rate limit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub agent_id: String,
    pub max_calls_per_minute: u32,
    pub max_calls_per_hour: u32,
    /// One-time extra credits, replenished after a full idle window
    pub burst_allowance: u32,
}

/// Result of a rate-limit admission check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmitDecision {
    pub allowed: bool,
    pub retry_after_seconds: f64,
    /// Which bucket denied the call, e.g. "per-minute rate limit"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limiting_factor: Option<String>,
}

/// Identifies one baseline group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaselineKey {
    pub agent_id: String,
    pub model: String,
    pub metric: MetricKind,
}

/// Statistical summary of recent normal behavior for one baseline group.
/// Recomputed from the ledger; never hand-edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineMetrics {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub q1: f64,
    pub q3: f64,
    pub iqr: f64,
    pub sample_size: usize,
    pub window_days: u32,
    pub last_updated: i64,
}

/// Discrete anomaly classification derived from score and z thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Which statistical method produced a detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    ZScore,
    Iqr,
}

/// A detected deviation from baseline behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub timestamp: i64,
    pub agent_id: String,
    pub model: String,
    pub metric: MetricKind,
    pub severity: Severity,
    /// Composite score 0-100
    pub score: f64,
    /// Confidence 0-1, scales with baseline sample size; independent of severity
    pub confidence: f64,
    pub baseline_mean: f64,
    pub observed: f64,
    pub deviation: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,
    pub method: DetectionMethod,
    /// Flagged by downstream consumers; never mutated otherwise
    pub resolved: bool,
}

/// Policy scope level in the inheritance tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScope {
    Org,
    Project,
    Agent,
}

impl PolicyScope {
    /// Conventional priority for the scope level (higher wins among siblings)
    pub fn default_priority(&self) -> u32 {
        match self {
            PolicyScope::Org => 100,
            PolicyScope::Project => 80,
            PolicyScope::Agent => 60,
        }
    }
}

impl std::fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyScope::Org => write!(f, "org"),
            PolicyScope::Project => write!(f, "project"),
            PolicyScope::Agent => write!(f, "agent"),
        }
    }
}

/// How a policy's fields combine with its parent's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InheritanceMode {
    /// No opinion; parent values pass through
    Inherit,
    /// Child fields fully replace parent fields
    Override,
    /// Stricter numeric limit wins; channel sets union
    Merge,
}

/// One budget limit carried by a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetRule {
    pub metric: MetricKind,
    pub period: BudgetPeriod,
    pub limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforce_limit: Option<bool>,
}

impl BudgetRule {
    /// Stable key for merge/override resolution across scopes
    pub fn key(&self) -> String {
        format!("{}/{}", self.metric, self.period)
    }
}

/// Rate limit carried by a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_calls_per_minute: u32,
    pub max_calls_per_hour: u32,
    pub burst_allowance: u32,
}

/// Administrator-managed policy; versioned, never silently overwritten
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub scope: PolicyScope,
    pub scope_id: String,
    pub priority: u32,
    pub version: u32,
    pub mode: InheritanceMode,
    pub budgets: Vec<BudgetRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitRule>,
    pub alert_channels: BTreeSet<String>,
}

/// The resolved, materialized policy for one agent.
///
/// Purely derived from the current policy set plus inheritance rules;
/// deterministic field ordering so repeated resolution is byte-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub agent_id: String,
    /// Keyed by `metric/period`
    pub budgets: BTreeMap<String, BudgetRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitRule>,
    pub alert_channels: BTreeSet<String>,
}

impl EffectivePolicy {
    pub fn empty(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            budgets: BTreeMap::new(),
            rate_limit: None,
            alert_channels: BTreeSet::new(),
        }
    }
}

/// Delivery outcome for one alert channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub channel: String,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A routed notification carrying enough context to judge plausibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub timestamp: i64,
    pub severity: Severity,
    pub agent_id: String,
    pub metric: MetricKind,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<f64>,
    pub channels: Vec<String>,
    pub deliveries: Vec<DeliveryOutcome>,
}

/// Follow-up work item emitted for routes configured with `create_task`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpTask {
    pub id: String,
    pub title: String,
    pub body: String,
    pub severity: Severity,
    pub agent_id: String,
    pub created_at: i64,
}

/// Generate a short unique id with a type prefix
pub fn simple_id(prefix: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}-{:x}{:x}", prefix, now.as_secs(), now.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_value_mapping() {
        let event = UsageEvent {
            agent_id: "agent-1".to_string(),
            model: "gpt-large".to_string(),
            tokens: 1200,
            cost_units: 0.36,
            duration_ms: 900,
            outcome: Outcome::Success,
            timestamp: 1_700_000_000,
        };

        assert_eq!(event.metric_value(MetricKind::Tokens), 1200.0);
        assert_eq!(event.metric_value(MetricKind::Cost), 0.36);
        assert_eq!(event.metric_value(MetricKind::Calls), 1.0);
        assert_eq!(event.metric_value(MetricKind::DurationMs), 900.0);
    }

    #[test]
    fn test_budget_percent_used() {
        let budget = Budget {
            id: "b-1".to_string(),
            scope: BudgetScope::Agent("agent-1".to_string()),
            metric: MetricKind::Tokens,
            limit: 1000.0,
            period: BudgetPeriod::Day,
            alert_threshold: 0.8,
            enforce_limit: true,
            current: 250.0,
            reset_at: Some(1_700_000_000),
            created_at: 1_699_900_000,
        };

        assert!((budget.percent_used() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_scope_keys() {
        assert_eq!(BudgetScope::Global.key(), "global");
        assert_eq!(BudgetScope::Agent("a-1".to_string()).key(), "a-1");
    }

    #[test]
    fn test_effective_policy_serialization_is_deterministic() {
        let mut policy = EffectivePolicy::empty("agent-1");
        policy.budgets.insert(
            "tokens/daily".to_string(),
            BudgetRule {
                metric: MetricKind::Tokens,
                period: BudgetPeriod::Day,
                limit: 500.0,
                alert_threshold: None,
                enforce_limit: None,
            },
        );
        policy.alert_channels.insert("slack".to_string());
        policy.alert_channels.insert("email".to_string());

        let a = serde_json::to_string(&policy).unwrap();
        let b = serde_json::to_string(&policy.clone()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_simple_id_prefix() {
        let id = simple_id("anm");
        assert!(id.starts_with("anm-"));
    }
}
