//! Hierarchical policy resolution
//!
//! Policies form a tree: organization (priority 100) -> project (80) ->
//! agent (60). Resolution walks the chain root to leaf, applying each
//! policy's inheritance mode per field. Equal-priority siblings at one
//! scope are rejected at creation time, never resolved silently.
//!
//! `effective_policy` is a pure function of the current policy set and the
//! scope tree: resolving twice without intervening changes yields
//! byte-identical output. `sync` recomputes effective policies for the
//! affected agents and reports a diff; dry runs produce the same diff and
//! skip only the commit.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GovernorError, Result};
use crate::models::{
    simple_id, BudgetRule, EffectivePolicy, InheritanceMode, Policy, PolicyScope, RateLimitRule,
};
use crate::store::Store;

/// Scope membership: agent -> project -> organization
pub struct ScopeTree {
    agent_project: DashMap<String, String>,
    project_org: DashMap<String, String>,
}

impl ScopeTree {
    pub fn new() -> Self {
        Self {
            agent_project: DashMap::new(),
            project_org: DashMap::new(),
        }
    }

    pub fn register_agent(&self, agent_id: &str, project_id: &str, org_id: &str) {
        self.agent_project
            .insert(agent_id.to_string(), project_id.to_string());
        self.project_org
            .insert(project_id.to_string(), org_id.to_string());
    }

    /// Scope chain for an agent, root first. Unregistered agents resolve
    /// against their own scope only.
    pub fn chain(&self, agent_id: &str) -> Vec<(PolicyScope, String)> {
        let mut chain = Vec::with_capacity(3);
        if let Some(project) = self.agent_project.get(agent_id) {
            if let Some(org) = self.project_org.get(project.value()) {
                chain.push((PolicyScope::Org, org.value().clone()));
            }
            chain.push((PolicyScope::Project, project.value().clone()));
        }
        chain.push((PolicyScope::Agent, agent_id.to_string()));
        chain
    }

    pub fn agents(&self) -> Vec<String> {
        self.agent_project.iter().map(|e| e.key().clone()).collect()
    }

    /// Agents living under a scope node
    pub fn agents_under(&self, scope: PolicyScope, scope_id: &str) -> Vec<String> {
        match scope {
            PolicyScope::Agent => vec![scope_id.to_string()],
            PolicyScope::Project => self
                .agent_project
                .iter()
                .filter(|e| e.value() == scope_id)
                .map(|e| e.key().clone())
                .collect(),
            PolicyScope::Org => {
                let projects: Vec<String> = self
                    .project_org
                    .iter()
                    .filter(|e| e.value() == scope_id)
                    .map(|e| e.key().clone())
                    .collect();
                self.agent_project
                    .iter()
                    .filter(|e| projects.contains(e.value()))
                    .map(|e| e.key().clone())
                    .collect()
            }
        }
    }
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

/// One agent's before/after in a sync report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDiff {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<EffectivePolicy>,
    pub after: EffectivePolicy,
}

/// A subtree whose resolution failed; other subtrees proceed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFailure {
    pub agent_id: String,
    pub error: String,
}

/// Outcome of a policy sync pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub dry_run: bool,
    pub scanned: usize,
    pub changed: Vec<PolicyDiff>,
    pub unchanged: usize,
    pub failures: Vec<SyncFailure>,
}

/// Resolves effective policies from the policy store and scope tree
pub struct PolicyResolver {
    store: Arc<dyn Store<Policy>>,
    tree: ScopeTree,
    cache: DashMap<String, EffectivePolicy>,
}

impl PolicyResolver {
    pub fn new(store: Arc<dyn Store<Policy>>) -> Self {
        Self {
            store,
            tree: ScopeTree::new(),
            cache: DashMap::new(),
        }
    }

    pub fn tree(&self) -> &ScopeTree {
        &self.tree
    }

    /// Create a policy. Rejects malformed rules and equal-priority
    /// siblings at the same scope node.
    #[allow(clippy::too_many_arguments)]
    pub fn create_policy(
        &self,
        scope: PolicyScope,
        scope_id: &str,
        priority: u32,
        mode: InheritanceMode,
        budgets: Vec<BudgetRule>,
        rate_limit: Option<RateLimitRule>,
        alert_channels: BTreeSet<String>,
    ) -> Result<Policy> {
        if scope_id.trim().is_empty() {
            return Err(GovernorError::validation("scope_id must not be empty"));
        }
        for rule in &budgets {
            if rule.limit <= 0.0 {
                return Err(GovernorError::validation(format!(
                    "budget rule {} limit must be positive",
                    rule.key()
                )));
            }
            if let Some(threshold) = rule.alert_threshold {
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(GovernorError::validation(format!(
                        "budget rule {} alert_threshold must be within [0, 1]",
                        rule.key()
                    )));
                }
            }
        }
        if let Some(ref rule) = rate_limit {
            if rule.max_calls_per_minute == 0 || rule.max_calls_per_hour == 0 {
                return Err(GovernorError::validation(
                    "rate limit ceilings must be positive",
                ));
            }
        }

        let sibling_conflict = self
            .store
            .list()
            .into_iter()
            .any(|p| p.scope == scope && p.scope_id == scope_id && p.priority == priority);
        if sibling_conflict {
            return Err(GovernorError::PolicyConflict {
                scope: scope.to_string(),
                scope_id: scope_id.to_string(),
                priority,
            });
        }

        let policy = Policy {
            id: simple_id("pol"),
            scope,
            scope_id: scope_id.to_string(),
            priority,
            version: 1,
            mode,
            budgets,
            rate_limit,
            alert_channels,
        };

        self.store.put(&policy.id, policy.clone());
        debug!(policy_id = %policy.id, scope = %policy.scope, scope_id = %policy.scope_id, "Policy created");
        Ok(policy)
    }

    /// Replace a policy's contents, bumping its version
    pub fn update_policy(&self, updated: Policy) -> Result<Policy> {
        let existing = self
            .store
            .get(&updated.id)
            .ok_or_else(|| GovernorError::not_found("policy", &updated.id))?;

        self.store.update(&updated.id, &mut |p| {
            *p = Policy {
                version: existing.version + 1,
                ..updated.clone()
            };
        })
    }

    pub fn get_policy(&self, policy_id: &str) -> Result<Policy> {
        self.store
            .get(policy_id)
            .ok_or_else(|| GovernorError::not_found("policy", policy_id))
    }

    pub fn list_policies(&self) -> Vec<Policy> {
        self.store.list()
    }

    pub fn delete_policy(&self, policy_id: &str) -> Result<Policy> {
        self.store.remove(policy_id)
    }

    /// Persist pending policy changes through the store
    pub fn persist(&self) -> Result<()> {
        self.store.flush()
    }

    /// Resolve the effective policy for one agent. Pure over the current
    /// policy set and scope tree; idempotent between policy changes.
    pub fn effective_policy(&self, agent_id: &str) -> Result<EffectivePolicy> {
        if agent_id.trim().is_empty() {
            return Err(GovernorError::validation("agent_id must not be empty"));
        }

        let policies = self.store.list();
        let mut effective = EffectivePolicy::empty(agent_id);

        for (scope, scope_id) in self.tree.chain(agent_id) {
            if let Some(policy) = select_for_node(&policies, scope, &scope_id)? {
                apply_policy(&mut effective, &policy);
            }
        }

        Ok(effective)
    }

    /// Last committed effective policy, if any sync has run
    pub fn cached_effective(&self, agent_id: &str) -> Option<EffectivePolicy> {
        self.cache.get(agent_id).map(|e| e.clone())
    }

    /// Recompute effective policies for the affected agents and diff
    /// against the committed cache. A conflicted subtree is reported and
    /// skipped; the rest proceed. Dry runs produce the identical diff and
    /// skip only the cache commit.
    pub fn sync(&self, dry_run: bool, scope: Option<(PolicyScope, String)>) -> SyncReport {
        let agents = match scope {
            Some((scope, ref scope_id)) => self.tree.agents_under(scope, scope_id),
            None => self.tree.agents(),
        };

        let mut changed = Vec::new();
        let mut unchanged = 0;
        let mut failures = Vec::new();

        for agent_id in &agents {
            match self.effective_policy(agent_id) {
                Ok(after) => {
                    let before = self.cached_effective(agent_id);
                    if before.as_ref() == Some(&after) {
                        unchanged += 1;
                    } else {
                        changed.push(PolicyDiff {
                            agent_id: agent_id.clone(),
                            before,
                            after,
                        });
                    }
                }
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Policy resolution failed, skipping subtree");
                    failures.push(SyncFailure {
                        agent_id: agent_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if !dry_run {
            for diff in &changed {
                self.cache
                    .insert(diff.agent_id.clone(), diff.after.clone());
            }
        }

        SyncReport {
            dry_run,
            scanned: agents.len(),
            changed,
            unchanged,
            failures,
        }
    }
}

/// Highest-priority policy at a scope node; equal top priorities are a
/// conflict (defense in depth behind the creation-time check, for policy
/// sets loaded from storage)
fn select_for_node(
    policies: &[Policy],
    scope: PolicyScope,
    scope_id: &str,
) -> Result<Option<Policy>> {
    let mut candidates: Vec<&Policy> = policies
        .iter()
        .filter(|p| p.scope == scope && p.scope_id == scope_id)
        .collect();
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

    if candidates.len() >= 2 && candidates[0].priority == candidates[1].priority {
        return Err(GovernorError::PolicyConflict {
            scope: scope.to_string(),
            scope_id: scope_id.to_string(),
            priority: candidates[0].priority,
        });
    }

    Ok(candidates.first().map(|p| (*p).clone()))
}

/// Fold one policy into the accumulated effective policy
fn apply_policy(effective: &mut EffectivePolicy, policy: &Policy) {
    match policy.mode {
        InheritanceMode::Inherit => {
            // No opinion: contribute only where nothing is set yet
            for rule in &policy.budgets {
                effective.budgets.entry(rule.key()).or_insert_with(|| rule.clone());
            }
            if effective.rate_limit.is_none() {
                effective.rate_limit = policy.rate_limit.clone();
            }
            if effective.alert_channels.is_empty() {
                effective.alert_channels = policy.alert_channels.clone();
            }
        }
        InheritanceMode::Override => {
            for rule in &policy.budgets {
                effective.budgets.insert(rule.key(), rule.clone());
            }
            if policy.rate_limit.is_some() {
                effective.rate_limit = policy.rate_limit.clone();
            }
            if !policy.alert_channels.is_empty() {
                effective.alert_channels = policy.alert_channels.clone();
            }
        }
        InheritanceMode::Merge => {
            for rule in &policy.budgets {
                effective
                    .budgets
                    .entry(rule.key())
                    .and_modify(|existing| {
                        // Stricter (lower) limit wins
                        if rule.limit < existing.limit {
                            *existing = rule.clone();
                        }
                    })
                    .or_insert_with(|| rule.clone());
            }
            effective.rate_limit = match (&effective.rate_limit, &policy.rate_limit) {
                (Some(a), Some(b)) => Some(RateLimitRule {
                    max_calls_per_minute: a.max_calls_per_minute.min(b.max_calls_per_minute),
                    max_calls_per_hour: a.max_calls_per_hour.min(b.max_calls_per_hour),
                    burst_allowance: a.burst_allowance.min(b.burst_allowance),
                }),
                (None, Some(b)) => Some(b.clone()),
                (a, None) => a.clone(),
            };
            effective
                .alert_channels
                .extend(policy.alert_channels.iter().cloned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BudgetPeriod, MetricKind};
    use crate::store::MemoryStore;

    fn resolver() -> PolicyResolver {
        let resolver = PolicyResolver::new(Arc::new(MemoryStore::new("policy")));
        resolver.tree().register_agent("agent-1", "proj-1", "org-1");
        resolver
    }

    fn daily_tokens(limit: f64) -> BudgetRule {
        BudgetRule {
            metric: MetricKind::Tokens,
            period: BudgetPeriod::Day,
            limit,
            alert_threshold: None,
            enforce_limit: None,
        }
    }

    fn channels(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_equal_priority_siblings_rejected_at_creation() {
        let resolver = resolver();
        resolver
            .create_policy(
                PolicyScope::Org,
                "org-1",
                100,
                InheritanceMode::Inherit,
                vec![daily_tokens(1000.0)],
                None,
                BTreeSet::new(),
            )
            .unwrap();

        let err = resolver
            .create_policy(
                PolicyScope::Org,
                "org-1",
                100,
                InheritanceMode::Override,
                vec![daily_tokens(500.0)],
                None,
                BTreeSet::new(),
            )
            .unwrap_err();
        assert!(matches!(err, GovernorError::PolicyConflict { .. }));
    }

    #[test]
    fn test_override_replaces_parent_limit() {
        let resolver = resolver();
        resolver
            .create_policy(
                PolicyScope::Org,
                "org-1",
                100,
                InheritanceMode::Inherit,
                vec![daily_tokens(1000.0)],
                None,
                BTreeSet::new(),
            )
            .unwrap();
        resolver
            .create_policy(
                PolicyScope::Project,
                "proj-1",
                80,
                InheritanceMode::Override,
                vec![daily_tokens(500.0)],
                None,
                BTreeSet::new(),
            )
            .unwrap();

        let effective = resolver.effective_policy("agent-1").unwrap();
        assert_eq!(effective.budgets["tokens/daily"].limit, 500.0);
    }

    #[test]
    fn test_merge_takes_the_stricter_limit() {
        let resolver = resolver();
        resolver
            .create_policy(
                PolicyScope::Org,
                "org-1",
                100,
                InheritanceMode::Inherit,
                vec![daily_tokens(1000.0)],
                None,
                BTreeSet::new(),
            )
            .unwrap();
        resolver
            .create_policy(
                PolicyScope::Project,
                "proj-1",
                80,
                InheritanceMode::Override,
                vec![daily_tokens(500.0)],
                None,
                BTreeSet::new(),
            )
            .unwrap();
        // Agent asks for 800 under merge: the stricter 500 stands
        resolver
            .create_policy(
                PolicyScope::Agent,
                "agent-1",
                60,
                InheritanceMode::Merge,
                vec![daily_tokens(800.0)],
                None,
                BTreeSet::new(),
            )
            .unwrap();

        let effective = resolver.effective_policy("agent-1").unwrap();
        assert_eq!(effective.budgets["tokens/daily"].limit, 500.0);
    }

    #[test]
    fn test_merge_unions_alert_channels() {
        let resolver = resolver();
        resolver
            .create_policy(
                PolicyScope::Org,
                "org-1",
                100,
                InheritanceMode::Inherit,
                vec![],
                None,
                channels(&["email"]),
            )
            .unwrap();
        resolver
            .create_policy(
                PolicyScope::Agent,
                "agent-1",
                60,
                InheritanceMode::Merge,
                vec![],
                None,
                channels(&["slack"]),
            )
            .unwrap();

        let effective = resolver.effective_policy("agent-1").unwrap();
        assert_eq!(effective.alert_channels, channels(&["email", "slack"]));
    }

    #[test]
    fn test_merge_rate_limits_field_by_field() {
        let resolver = resolver();
        resolver
            .create_policy(
                PolicyScope::Org,
                "org-1",
                100,
                InheritanceMode::Inherit,
                vec![],
                Some(RateLimitRule {
                    max_calls_per_minute: 30,
                    max_calls_per_hour: 500,
                    burst_allowance: 5,
                }),
                BTreeSet::new(),
            )
            .unwrap();
        resolver
            .create_policy(
                PolicyScope::Agent,
                "agent-1",
                60,
                InheritanceMode::Merge,
                vec![],
                Some(RateLimitRule {
                    max_calls_per_minute: 60,
                    max_calls_per_hour: 200,
                    burst_allowance: 10,
                }),
                BTreeSet::new(),
            )
            .unwrap();

        let effective = resolver.effective_policy("agent-1").unwrap();
        let rule = effective.rate_limit.unwrap();
        assert_eq!(rule.max_calls_per_minute, 30);
        assert_eq!(rule.max_calls_per_hour, 200);
        assert_eq!(rule.burst_allowance, 5);
    }

    #[test]
    fn test_effective_policy_is_idempotent() {
        let resolver = resolver();
        resolver
            .create_policy(
                PolicyScope::Org,
                "org-1",
                100,
                InheritanceMode::Inherit,
                vec![daily_tokens(1000.0)],
                None,
                channels(&["email", "slack"]),
            )
            .unwrap();

        let a = serde_json::to_vec(&resolver.effective_policy("agent-1").unwrap()).unwrap();
        let b = serde_json::to_vec(&resolver.effective_policy("agent-1").unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sync_dry_run_matches_real_run_minus_commit() {
        let resolver = resolver();
        resolver
            .create_policy(
                PolicyScope::Org,
                "org-1",
                100,
                InheritanceMode::Inherit,
                vec![daily_tokens(1000.0)],
                None,
                BTreeSet::new(),
            )
            .unwrap();

        let dry = resolver.sync(true, None);
        assert!(dry.dry_run);
        assert_eq!(dry.changed.len(), 1);
        assert!(resolver.cached_effective("agent-1").is_none());

        let real = resolver.sync(false, None);
        assert_eq!(
            serde_json::to_vec(&real.changed).unwrap(),
            serde_json::to_vec(&dry.changed).unwrap()
        );
        assert!(resolver.cached_effective("agent-1").is_some());

        // Nothing moved: a second sync reports no changes
        let again = resolver.sync(false, None);
        assert!(again.changed.is_empty());
        assert_eq!(again.unchanged, 1);
    }

    #[test]
    fn test_sync_conflict_aborts_only_the_affected_subtree() {
        let resolver = resolver();
        resolver.tree().register_agent("agent-2", "proj-2", "org-1");

        // Conflicting siblings on proj-1, injected directly into the store
        // to bypass the creation-time guard
        for limit in [100.0, 200.0] {
            let policy = Policy {
                id: simple_id("pol"),
                scope: PolicyScope::Project,
                scope_id: "proj-1".to_string(),
                priority: 80,
                version: 1,
                mode: InheritanceMode::Override,
                budgets: vec![daily_tokens(limit)],
                rate_limit: None,
                alert_channels: BTreeSet::new(),
            };
            let policy_id = policy.id.clone();
            resolver.store.put(&policy_id, policy);
            // Distinct ids require distinct creation instants
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let report = resolver.sync(false, None);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].agent_id, "agent-1");
        // agent-2's subtree proceeded
        assert_eq!(report.scanned, 2);
        assert_eq!(report.changed.len() + report.unchanged, 1);
    }

    #[test]
    fn test_scoped_sync_touches_only_the_subtree() {
        let resolver = resolver();
        resolver.tree().register_agent("agent-2", "proj-2", "org-2");

        resolver
            .create_policy(
                PolicyScope::Project,
                "proj-1",
                80,
                InheritanceMode::Override,
                vec![daily_tokens(500.0)],
                None,
                BTreeSet::new(),
            )
            .unwrap();

        let report = resolver.sync(false, Some((PolicyScope::Project, "proj-1".to_string())));
        assert_eq!(report.scanned, 1);
        assert_eq!(report.changed[0].agent_id, "agent-1");
    }

    #[test]
    fn test_update_policy_bumps_version() {
        let resolver = resolver();
        let policy = resolver
            .create_policy(
                PolicyScope::Agent,
                "agent-1",
                60,
                InheritanceMode::Override,
                vec![daily_tokens(100.0)],
                None,
                BTreeSet::new(),
            )
            .unwrap();

        let mut updated = policy.clone();
        updated.budgets = vec![daily_tokens(200.0)];
        let stored = resolver.update_policy(updated).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.budgets[0].limit, 200.0);
    }
}
