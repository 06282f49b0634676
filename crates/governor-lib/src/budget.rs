//! Budget enforcement with periodic, calendar-aligned resets
//!
//! `check_and_consume` is the only mutation path for consumption and runs
//! check-then-increment inside the store's per-key entry lock, so two
//! concurrent callers can never both take the last unit of headroom.
//! Period boundaries are calendar-aligned in the configured timezone
//! (midnight for daily budgets, Monday midnight for weekly, the first of
//! the month for monthly), not "N hours after creation".

use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::debug;

use crate::error::{GovernorError, Result};
use crate::models::{
    simple_id, Budget, BudgetDecision, BudgetPeriod, BudgetScope, BudgetStatus, CrossingKind,
    MetricKind, ThresholdCrossing,
};
use crate::store::Store;

/// Outcome of one consume call: the decision plus any threshold crossing
/// the alert router should see
#[derive(Debug, Clone)]
pub struct BudgetConsume {
    pub decision: BudgetDecision,
    pub crossing: Option<ThresholdCrossing>,
}

/// Budget ledger; owns all budget state mutation
pub struct BudgetLedger {
    store: Arc<dyn Store<Budget>>,
    timezone: Tz,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn Store<Budget>>, timezone: Tz) -> Self {
        Self { store, timezone }
    }

    /// Create a budget. Fails with `Validation` if the limit is not
    /// positive or the alert threshold is outside [0, 1].
    pub fn create_budget(
        &self,
        scope: BudgetScope,
        metric: MetricKind,
        limit: f64,
        period: BudgetPeriod,
        alert_threshold: f64,
        enforce_limit: bool,
    ) -> Result<Budget> {
        self.create_budget_at(
            scope,
            metric,
            limit,
            period,
            alert_threshold,
            enforce_limit,
            Utc::now().timestamp(),
        )
    }

    pub fn create_budget_at(
        &self,
        scope: BudgetScope,
        metric: MetricKind,
        limit: f64,
        period: BudgetPeriod,
        alert_threshold: f64,
        enforce_limit: bool,
        now_ts: i64,
    ) -> Result<Budget> {
        if limit <= 0.0 {
            return Err(GovernorError::validation("budget limit must be positive"));
        }
        if !(0.0..=1.0).contains(&alert_threshold) {
            return Err(GovernorError::validation(
                "alert_threshold must be within [0, 1]",
            ));
        }

        let budget = Budget {
            id: simple_id("bgt"),
            scope,
            metric,
            limit,
            period,
            alert_threshold,
            enforce_limit,
            current: 0.0,
            reset_at: next_boundary(period, now_ts, self.timezone),
            created_at: now_ts,
        };

        self.store.put(&budget.id, budget.clone());
        debug!(budget_id = %budget.id, scope = %budget.scope, metric = %metric, "Budget created");
        Ok(budget)
    }

    /// Atomically check headroom and consume `amount`.
    ///
    /// Denial is a normal `allowed = false` decision, never an error; only
    /// a malformed amount or a missing budget fails. Warn-only budgets
    /// always admit and let `current` run past the limit.
    pub fn check_and_consume(&self, budget_id: &str, amount: f64) -> Result<BudgetConsume> {
        self.check_and_consume_at(budget_id, amount, Utc::now().timestamp())
    }

    pub fn check_and_consume_at(
        &self,
        budget_id: &str,
        amount: f64,
        now_ts: i64,
    ) -> Result<BudgetConsume> {
        if amount < 0.0 {
            return Err(GovernorError::validation("amount must not be negative"));
        }

        let timezone = self.timezone;
        let mut decision = None;
        let mut crossing = None;

        self.store.update(budget_id, &mut |budget| {
            reset_if_due(budget, now_ts, timezone);

            let before_pct = budget.percent_used();
            let would = budget.current + amount;
            let allowed = !budget.enforce_limit || would <= budget.limit;

            if allowed {
                budget.current = would;
            }

            let after_pct = budget.percent_used();
            let threshold_pct = budget.alert_threshold * 100.0;

            let kind = if (!allowed) || (before_pct < 100.0 && after_pct >= 100.0) {
                Some(CrossingKind::LimitReached)
            } else if before_pct < threshold_pct && after_pct >= threshold_pct {
                Some(CrossingKind::AlertThreshold)
            } else {
                None
            };

            crossing = kind.map(|kind| ThresholdCrossing {
                budget_id: budget.id.clone(),
                scope: budget.scope.clone(),
                metric: budget.metric,
                period: budget.period,
                kind,
                percent_used: after_pct,
                timestamp: now_ts,
            });

            decision = Some(BudgetDecision {
                allowed,
                remaining: budget.limit - budget.current,
                percent_used: after_pct,
                limiting_factor: if allowed {
                    None
                } else {
                    Some(format!("{} {} budget", budget.period, budget.metric))
                },
            });
        })?;

        Ok(BudgetConsume {
            decision: decision.expect("update closure ran"),
            crossing,
        })
    }

    /// Return previously consumed headroom, e.g. to roll back the earlier
    /// budgets of a multi-budget admission when a later one denies
    pub fn release(&self, budget_id: &str, amount: f64) -> Result<()> {
        self.store.update(budget_id, &mut |budget| {
            budget.current = (budget.current - amount).max(0.0);
        })?;
        Ok(())
    }

    /// Point-in-time status for every budget matching the scope and metric
    pub fn status(&self, scope_key: &str, metric: MetricKind) -> Vec<BudgetStatus> {
        self.status_at(scope_key, metric, Utc::now().timestamp())
    }

    pub fn status_at(&self, scope_key: &str, metric: MetricKind, now_ts: i64) -> Vec<BudgetStatus> {
        let timezone = self.timezone;
        self.list()
            .into_iter()
            .filter(|b| b.scope.key() == scope_key && b.metric == metric)
            .map(|b| {
                // Lazily apply a due reset so a status read near the
                // boundary never shows a stale period's consumption
                let refreshed = self
                    .store
                    .update(&b.id, &mut |budget| reset_if_due(budget, now_ts, timezone))
                    .unwrap_or(b);

                BudgetStatus {
                    budget_id: refreshed.id.clone(),
                    scope: refreshed.scope.clone(),
                    metric: refreshed.metric,
                    period: refreshed.period,
                    current: refreshed.current,
                    limit: refreshed.limit,
                    percent_used: refreshed.percent_used(),
                    enforce_limit: refreshed.enforce_limit,
                    reset_at: refreshed.reset_at,
                }
            })
            .collect()
    }

    /// Budgets applicable to one agent's metric: agent-scoped first, then
    /// global, so the denial message names the most specific limit
    pub fn matching(&self, agent_id: &str, metric: MetricKind) -> Vec<Budget> {
        let mut budgets: Vec<Budget> = self
            .list()
            .into_iter()
            .filter(|b| {
                b.metric == metric
                    && match &b.scope {
                        BudgetScope::Global => true,
                        BudgetScope::Agent(id) => id == agent_id,
                    }
            })
            .collect();
        budgets.sort_by_key(|b| matches!(b.scope, BudgetScope::Global));
        budgets
    }

    pub fn get(&self, budget_id: &str) -> Result<Budget> {
        self.store
            .get(budget_id)
            .ok_or_else(|| GovernorError::not_found("budget", budget_id))
    }

    pub fn list(&self) -> Vec<Budget> {
        self.store.list()
    }

    pub fn delete_budget(&self, budget_id: &str) -> Result<Budget> {
        self.store.remove(budget_id)
    }

    /// Create or reconfigure the budget for (scope, metric, period) from a
    /// policy rule; used by policy sync commits
    pub fn apply_limit(
        &self,
        scope: BudgetScope,
        metric: MetricKind,
        period: BudgetPeriod,
        limit: f64,
        alert_threshold: f64,
        enforce_limit: bool,
    ) -> Result<Budget> {
        if limit <= 0.0 {
            return Err(GovernorError::validation("budget limit must be positive"));
        }

        let existing = self
            .list()
            .into_iter()
            .find(|b| b.scope == scope && b.metric == metric && b.period == period);

        match existing {
            Some(budget) => self.store.update(&budget.id, &mut |b| {
                b.limit = limit;
                b.alert_threshold = alert_threshold;
                b.enforce_limit = enforce_limit;
            }),
            None => self.create_budget(scope, metric, limit, period, alert_threshold, enforce_limit),
        }
    }

    /// Persist pending budget changes through the store
    pub fn persist(&self) -> Result<()> {
        self.store.flush()
    }

    /// Apply due resets across all budgets; invoked by the background
    /// scheduler so correctness does not depend on read timing
    pub fn sweep_resets(&self) -> usize {
        self.sweep_resets_at(Utc::now().timestamp())
    }

    pub fn sweep_resets_at(&self, now_ts: i64) -> usize {
        let timezone = self.timezone;
        let mut reset = 0;
        for budget in self.list() {
            let due = matches!(budget.reset_at, Some(at) if now_ts >= at);
            if due
                && self
                    .store
                    .update(&budget.id, &mut |b| reset_if_due(b, now_ts, timezone))
                    .is_ok()
            {
                reset += 1;
            }
        }
        reset
    }
}

/// Zero the counter and advance the boundary when a period has elapsed
fn reset_if_due(budget: &mut Budget, now_ts: i64, timezone: Tz) {
    if let Some(reset_at) = budget.reset_at {
        if now_ts >= reset_at {
            budget.current = 0.0;
            budget.reset_at = next_boundary(budget.period, now_ts, timezone);
        }
    }
}

/// Next calendar-aligned boundary strictly after `now_ts`, in `tz`.
/// `Total` budgets never reset.
fn next_boundary(period: BudgetPeriod, now_ts: i64, tz: Tz) -> Option<i64> {
    let local = tz.timestamp_opt(now_ts, 0).single()?;
    let date = local.date_naive();

    let naive_next = match period {
        BudgetPeriod::Hour => {
            date.and_hms_opt(local.hour(), 0, 0)? + chrono::Duration::hours(1)
        }
        BudgetPeriod::Day => date.succ_opt()?.and_hms_opt(0, 0, 0)?,
        BudgetPeriod::Week => {
            let days_ahead = 7 - date.weekday().num_days_from_monday() as i64;
            (date + chrono::Duration::days(days_ahead)).and_hms_opt(0, 0, 0)?
        }
        BudgetPeriod::Month => {
            let (year, month) = if date.month() == 12 {
                (date.year() + 1, 1)
            } else {
                (date.year(), date.month() + 1)
            };
            NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?
        }
        BudgetPeriod::Total => return None,
    };

    resolve_local(tz, naive_next)
}

/// Map a local wall-clock time to a timestamp, stepping over DST gaps
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<i64> {
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return Some(dt.timestamp());
    }
    tz.from_local_datetime(&(naive + chrono::Duration::hours(1)))
        .earliest()
        .map(|dt| dt.timestamp())
}
