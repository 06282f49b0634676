//! Governor facade: explicit wiring of every component and the external
//! call surface
//!
//! Components are constructed once here and shared by reference; nothing
//! reaches for a global. The facade owns the data flow: usage recording
//! feeds the ledger, budget checks consume atomically and surface
//! threshold crossings to the alert router, periodic detection scores
//! ledger aggregates against baselines and routes what it finds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_tz::Tz;

use crate::alert::{AlertRouter, AlertSink, RouterConfig, TracingSink};
use crate::anomaly::{
    AnomalyDetector, BaselineConfig, BaselineManager, DetectorConfig, Observation, RecomputeReport,
    SpikeReport,
};
use crate::budget::BudgetLedger;
use crate::error::Result;
use crate::eventlog::EventLog;
use crate::ledger::{LedgerConfig, UsageLedger};
use crate::models::{
    Anomaly, AdmitDecision, Budget, BudgetDecision, BudgetScope, BudgetStatus, EffectivePolicy,
    MetricKind, Policy, PolicyScope, ThresholdCrossing, UsageEvent,
};
use crate::observability::{GovernorMetrics, StructuredLogger};
use crate::policy::{PolicyResolver, SyncReport};
use crate::ratelimit::{RateLimiter, RateLimiterDefaults};
use crate::store::Store;

/// Top-level governor configuration
#[derive(Clone)]
pub struct GovernorConfig {
    pub instance: String,
    /// Timezone for period-aligned budget resets
    pub timezone: Tz,
    pub ledger: LedgerConfig,
    pub baseline: BaselineConfig,
    pub detector: DetectorConfig,
    pub limiter_defaults: RateLimiterDefaults,
    pub router: RouterConfig,
    /// Window over which `detect_anomalies` aggregates observations
    pub detection_window: Duration,
    /// Directory for the append-only event log; disabled when unset
    pub event_log_dir: Option<std::path::PathBuf>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            instance: "usage-governor".to_string(),
            timezone: chrono_tz::UTC,
            ledger: LedgerConfig::default(),
            baseline: BaselineConfig::default(),
            detector: DetectorConfig::default(),
            limiter_defaults: RateLimiterDefaults::default(),
            router: RouterConfig::default(),
            detection_window: Duration::from_secs(3600),
            event_log_dir: None,
        }
    }
}

/// The assembled governor core
pub struct Governor {
    config: GovernorConfig,
    ledger: UsageLedger,
    event_log: Option<EventLog>,
    budgets: BudgetLedger,
    limiter: RateLimiter,
    detector: AnomalyDetector,
    resolver: PolicyResolver,
    anomalies: Arc<dyn Store<Anomaly>>,
    router: AlertRouter,
    metrics: GovernorMetrics,
    logger: StructuredLogger,
}

impl Governor {
    /// Wire the core once at startup. The log sink is always registered;
    /// additional sinks serve the channels named by alert routes.
    pub fn new(
        config: GovernorConfig,
        budget_store: Arc<dyn Store<Budget>>,
        policy_store: Arc<dyn Store<Policy>>,
        anomaly_store: Arc<dyn Store<Anomaly>>,
        extra_sinks: Vec<Arc<dyn AlertSink>>,
    ) -> Self {
        let baselines = Arc::new(BaselineManager::new(config.baseline.clone()));

        let mut router = AlertRouter::new(config.router.clone());
        router.register_sink(Arc::new(TracingSink));
        for sink in extra_sinks {
            router.register_sink(sink);
        }

        Self {
            ledger: UsageLedger::new(config.ledger.clone()),
            event_log: config.event_log_dir.clone().map(EventLog::new),
            budgets: BudgetLedger::new(budget_store, config.timezone),
            limiter: RateLimiter::new(config.limiter_defaults.clone()),
            detector: AnomalyDetector::new(baselines, config.detector.clone()),
            resolver: PolicyResolver::new(policy_store),
            anomalies: anomaly_store,
            router,
            metrics: GovernorMetrics::new(),
            logger: StructuredLogger::new(config.instance.clone()),
            config,
        }
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn budgets(&self) -> &BudgetLedger {
        &self.budgets
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    pub fn router(&self) -> &AlertRouter {
        &self.router
    }

    /// Register an agent's position in the scope tree
    pub fn register_agent(&self, agent_id: &str, project_id: &str, org_id: &str) {
        self.resolver.tree().register_agent(agent_id, project_id, org_id);
    }

    /// Record a usage event into the ledger and the append-only log
    pub fn record_usage(&self, event: UsageEvent) -> Result<()> {
        let start = Instant::now();
        let durable = self.event_log.as_ref().map(|_| event.clone());
        self.ledger.record(event)?;
        if let (Some(log), Some(event)) = (&self.event_log, durable) {
            // Durability is best-effort on the hot path; aggregation and
            // enforcement never wait on disk
            if let Err(e) = log.append(&event) {
                tracing::warn!(error = %e, "Event log append failed");
            }
        }
        self.metrics.inc_usage_events();
        self.metrics
            .set_agents_tracked(self.ledger.agents_tracked() as i64);
        self.metrics
            .observe_record_latency(start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Check and consume `amount` against every budget covering the
    /// agent's metric (agent-scoped first, then global). All must admit;
    /// on denial, earlier consumption is rolled back and the decision
    /// names the limiting budget. No configured budget means unlimited.
    pub async fn check_budget(
        &self,
        agent_id: &str,
        metric: MetricKind,
        amount: f64,
    ) -> Result<BudgetDecision> {
        let start = Instant::now();
        let now_ts = Utc::now().timestamp();

        let matching = self.budgets.matching(agent_id, metric);
        if matching.is_empty() {
            return Ok(BudgetDecision {
                allowed: true,
                remaining: f64::MAX,
                percent_used: 0.0,
                limiting_factor: None,
            });
        }

        let mut consumed: Vec<String> = Vec::new();
        let mut crossings: Vec<ThresholdCrossing> = Vec::new();
        let mut tightest: Option<BudgetDecision> = None;
        let mut denial: Option<BudgetDecision> = None;

        for budget in &matching {
            let outcome = self.budgets.check_and_consume_at(&budget.id, amount, now_ts)?;
            if outcome.decision.allowed {
                consumed.push(budget.id.clone());
                if let Some(crossing) = outcome.crossing {
                    crossings.push(crossing);
                }
                let is_tighter = tightest
                    .as_ref()
                    .map(|t| outcome.decision.remaining < t.remaining)
                    .unwrap_or(true);
                if is_tighter {
                    tightest = Some(outcome.decision);
                }
            } else {
                for id in &consumed {
                    self.budgets.release(id, amount)?;
                }
                if let Some(crossing) = outcome.crossing {
                    crossings = vec![crossing];
                }
                denial = Some(outcome.decision);
                break;
            }
        }

        for crossing in &crossings {
            if self.router.route_crossing(crossing).await.is_some() {
                self.metrics.inc_alerts_dispatched();
            } else {
                self.metrics.inc_alerts_suppressed();
            }
        }

        let decision = match denial {
            Some(decision) => {
                self.metrics.inc_budget_denials();
                self.logger.log_budget_denied(
                    agent_id,
                    &metric.to_string(),
                    decision.limiting_factor.as_deref().unwrap_or("budget"),
                    decision.percent_used,
                );
                decision
            }
            None => tightest.expect("at least one budget was consumed"),
        };

        self.metrics
            .observe_budget_check_latency(start.elapsed().as_secs_f64());
        Ok(decision)
    }

    /// Rate limit admission for one agent call
    pub fn check_rate_limit(&self, agent_id: &str) -> AdmitDecision {
        let start = Instant::now();
        let decision = self.limiter.check_and_admit(agent_id);
        if !decision.allowed {
            self.metrics.inc_ratelimit_denials();
            self.logger.log_ratelimit_denied(
                agent_id,
                decision.limiting_factor.as_deref().unwrap_or("rate limit"),
                decision.retry_after_seconds,
            );
        }
        self.metrics
            .observe_ratelimit_check_latency(start.elapsed().as_secs_f64());
        decision
    }

    /// Status of every budget covering the agent's metric, including
    /// global ones
    pub fn budget_status(&self, agent_id: &str, metric: MetricKind) -> Vec<BudgetStatus> {
        let mut statuses = self.budgets.status(agent_id, metric);
        statuses.extend(self.budgets.status("global", metric));
        statuses
    }

    /// Score current ledger aggregates against baselines, route what is
    /// found, and return the anomalies
    pub async fn detect_anomalies(&self, window: Duration) -> Vec<Anomaly> {
        let now_ts = Utc::now().timestamp();
        let observations: Vec<Observation> = self
            .ledger
            .snapshot_groups(window, now_ts)
            .into_iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(key, values)| Observation {
                agent_id: key.agent_id,
                model: key.model,
                metric: key.metric,
                value: crate::stats::mean(&values),
                timestamp: now_ts,
            })
            .collect();

        let anomalies = self.detector.detect(&observations);
        self.detector.note_anomalies(&anomalies);

        for anomaly in &anomalies {
            self.anomalies.put(&anomaly.id, anomaly.clone());
            self.metrics.inc_anomalies_detected();
            self.logger.log_anomaly(
                &anomaly.agent_id,
                &anomaly.metric.to_string(),
                &anomaly.severity.to_string(),
                anomaly.score,
                anomaly.baseline_mean,
                anomaly.observed,
            );
            if self.router.route_anomaly(anomaly).await.is_some() {
                self.metrics.inc_alerts_dispatched();
            } else {
                self.metrics.inc_alerts_suppressed();
            }
        }

        anomalies
    }

    /// Periodic anomaly scan over the configured detection window
    pub async fn scan(&self) -> Vec<Anomaly> {
        self.detect_anomalies(self.config.detection_window).await
    }

    /// On-demand drill-down over one agent's metric series
    pub fn analyze_spikes(
        &self,
        agent_id: &str,
        metric: MetricKind,
        from: i64,
        to: i64,
    ) -> Result<SpikeReport> {
        let series = self.ledger.observations(agent_id, metric, from, to);
        self.detector.analyze_spikes(agent_id, metric, &series, from, to)
    }

    /// Recompute baselines from a ledger snapshot
    pub async fn recompute_baselines(&self) -> RecomputeReport {
        let window = Duration::from_secs(
            self.config.baseline.window_days as u64 * 24 * 60 * 60,
        );
        let groups = self.ledger.snapshot_groups(window, Utc::now().timestamp());
        let report = self.detector.baselines().recompute(groups).await;
        self.logger.log_baseline_recompute(
            report.groups_total,
            report.groups_computed,
            report.truncated,
        );
        report
    }

    /// Resolve the effective policy for an agent (pure, uncached)
    pub fn effective_policy(&self, agent_id: &str) -> Result<EffectivePolicy> {
        self.resolver.effective_policy(agent_id)
    }

    /// Recompute effective policies; committing a real run reconfigures
    /// the budget ledger and rate limiter without touching the hot path
    pub fn sync_policies(
        &self,
        dry_run: bool,
        scope: Option<(PolicyScope, String)>,
    ) -> SyncReport {
        let report = self.resolver.sync(dry_run, scope);

        if !dry_run {
            for diff in &report.changed {
                self.apply_effective(&diff.agent_id, &diff.after);
            }
        }

        self.logger
            .log_policy_sync(dry_run, report.changed.len(), report.failures.len());
        self.metrics
            .set_budgets_active(self.budgets.list().len() as i64);
        report
    }

    /// Previously detected anomalies, newest first
    pub fn anomaly_history(&self, limit: usize) -> Vec<Anomaly> {
        let mut history = self.anomalies.list();
        history.sort_by_key(|a| std::cmp::Reverse(a.timestamp));
        history.truncate(limit);
        history
    }

    /// Flush budget, policy and anomaly stores; called periodically and
    /// at shutdown
    pub fn persist(&self) -> Result<()> {
        self.budgets.persist()?;
        self.resolver.persist()?;
        self.anomalies.flush()
    }

    fn apply_effective(&self, agent_id: &str, effective: &EffectivePolicy) {
        for rule in effective.budgets.values() {
            let result = self.budgets.apply_limit(
                BudgetScope::Agent(agent_id.to_string()),
                rule.metric,
                rule.period,
                rule.limit,
                rule.alert_threshold.unwrap_or(0.8),
                rule.enforce_limit.unwrap_or(true),
            );
            if let Err(e) = result {
                tracing::warn!(agent_id = %agent_id, error = %e, "Failed to apply budget rule");
            }
        }

        if let Some(ref rule) = effective.rate_limit {
            let result = self.limiter.configure(crate::models::RateLimitConfig {
                agent_id: agent_id.to_string(),
                max_calls_per_minute: rule.max_calls_per_minute,
                max_calls_per_hour: rule.max_calls_per_hour,
                burst_allowance: rule.burst_allowance,
            });
            if let Err(e) = result {
                tracing::warn!(agent_id = %agent_id, error = %e, "Failed to apply rate limit rule");
            }
        }
    }
}
