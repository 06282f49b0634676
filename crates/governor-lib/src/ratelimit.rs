//! Per-agent rate limiting with burst tolerance
//!
//! Each agent carries two independent token buckets (per-minute and
//! per-hour) with continuous refill, plus burst credits that replenish
//! only after a full idle window. A call must pass BOTH buckets; the
//! denial names the tightest constraint. Admission is O(1): the per-agent
//! entry lock is held for a handful of arithmetic operations, never a scan
//! over historical events.

use chrono::Utc;
use dashmap::DashMap;

use crate::error::{GovernorError, Result};
use crate::models::{AdmitDecision, RateLimitConfig};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;

/// Fallback limits for agents without an explicit configuration
#[derive(Debug, Clone)]
pub struct RateLimiterDefaults {
    pub max_calls_per_minute: u32,
    pub max_calls_per_hour: u32,
    pub burst_allowance: u32,
}

impl Default for RateLimiterDefaults {
    fn default() -> Self {
        Self {
            max_calls_per_minute: 60,
            max_calls_per_hour: 1000,
            burst_allowance: 10,
        }
    }
}

/// One token bucket: continuous refill plus idle-replenished burst credits
#[derive(Debug)]
struct Bucket {
    label: &'static str,
    capacity: f64,
    refill_per_ms: f64,
    window_ms: i64,
    tokens: f64,
    burst_capacity: u32,
    burst_credits: u32,
    last_refill_ms: i64,
    last_call_ms: i64,
}

impl Bucket {
    fn new(label: &'static str, capacity: u32, window_ms: i64, burst: u32, now_ms: i64) -> Self {
        Self {
            label,
            capacity: capacity as f64,
            refill_per_ms: capacity as f64 / window_ms as f64,
            window_ms,
            tokens: capacity as f64,
            burst_capacity: burst,
            burst_credits: burst,
            last_refill_ms: now_ms,
            last_call_ms: now_ms - window_ms,
        }
    }

    fn refill(&mut self, now_ms: i64) {
        let elapsed = (now_ms - self.last_refill_ms).max(0);
        self.tokens = (self.tokens + elapsed as f64 * self.refill_per_ms).min(self.capacity);
        self.last_refill_ms = now_ms;

        // Burst credits come back only after a full idle window
        if now_ms - self.last_call_ms >= self.window_ms {
            self.burst_credits = self.burst_capacity;
        }
    }

    fn can_admit(&self) -> bool {
        self.tokens >= 1.0 || self.burst_credits > 0
    }

    fn admit(&mut self, now_ms: i64) {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
        } else {
            self.burst_credits -= 1;
        }
        self.last_call_ms = now_ms;
    }

    /// Seconds until one base token refills
    fn retry_after_seconds(&self) -> f64 {
        ((1.0 - self.tokens) / self.refill_per_ms / 1000.0).max(0.0)
    }
}

/// Dual-bucket state for one agent
struct AgentLimits {
    minute: Bucket,
    hour: Bucket,
}

impl AgentLimits {
    fn new(per_minute: u32, per_hour: u32, burst: u32, now_ms: i64) -> Self {
        Self {
            minute: Bucket::new("per-minute rate limit", per_minute, MINUTE_MS, burst, now_ms),
            hour: Bucket::new("per-hour rate limit", per_hour, HOUR_MS, burst, now_ms),
        }
    }
}

/// Sliding-window rate limiter; owns all per-agent admission state
pub struct RateLimiter {
    agents: DashMap<String, AgentLimits>,
    defaults: RateLimiterDefaults,
}

impl RateLimiter {
    pub fn new(defaults: RateLimiterDefaults) -> Self {
        Self {
            agents: DashMap::new(),
            defaults,
        }
    }

    /// Install or replace an agent's limits. Resets the agent's bucket
    /// state to a cold window.
    pub fn configure(&self, config: RateLimitConfig) -> Result<()> {
        self.configure_at(config, Utc::now().timestamp_millis())
    }

    pub fn configure_at(&self, config: RateLimitConfig, now_ms: i64) -> Result<()> {
        if config.agent_id.trim().is_empty() {
            return Err(GovernorError::validation("agent_id must not be empty"));
        }
        if config.max_calls_per_minute == 0 || config.max_calls_per_hour == 0 {
            return Err(GovernorError::validation(
                "rate limit ceilings must be positive",
            ));
        }

        self.agents.insert(
            config.agent_id.clone(),
            AgentLimits::new(
                config.max_calls_per_minute,
                config.max_calls_per_hour,
                config.burst_allowance,
                now_ms,
            ),
        );
        Ok(())
    }

    /// Admit or deny one call. Both buckets must pass; on denial the
    /// decision names the tightest constraint and how long to wait.
    pub fn check_and_admit(&self, agent_id: &str) -> AdmitDecision {
        self.check_and_admit_at(agent_id, Utc::now().timestamp_millis())
    }

    pub fn check_and_admit_at(&self, agent_id: &str, now_ms: i64) -> AdmitDecision {
        let mut limits = self.agents.entry(agent_id.to_string()).or_insert_with(|| {
            AgentLimits::new(
                self.defaults.max_calls_per_minute,
                self.defaults.max_calls_per_hour,
                self.defaults.burst_allowance,
                now_ms,
            )
        });

        limits.minute.refill(now_ms);
        limits.hour.refill(now_ms);

        let minute_ok = limits.minute.can_admit();
        let hour_ok = limits.hour.can_admit();

        if minute_ok && hour_ok {
            limits.minute.admit(now_ms);
            limits.hour.admit(now_ms);
            return AdmitDecision {
                allowed: true,
                retry_after_seconds: 0.0,
                limiting_factor: None,
            };
        }

        // Tightest constraint wins the denial message
        let minute_wait = if minute_ok {
            0.0
        } else {
            limits.minute.retry_after_seconds()
        };
        let hour_wait = if hour_ok {
            0.0
        } else {
            limits.hour.retry_after_seconds()
        };

        let (label, wait) = if hour_wait > minute_wait {
            (limits.hour.label, hour_wait)
        } else {
            (limits.minute.label, minute_wait)
        };

        AdmitDecision {
            allowed: false,
            retry_after_seconds: wait,
            limiting_factor: Some(label.to_string()),
        }
    }

    /// Drop an agent's limiter state
    pub fn remove(&self, agent_id: &str) {
        self.agents.remove(agent_id);
    }

    /// Agents with live limiter state
    pub fn agents_tracked(&self) -> usize {
        self.agents.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterDefaults::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(agent: &str, per_minute: u32, per_hour: u32, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            agent_id: agent.to_string(),
            max_calls_per_minute: per_minute,
            max_calls_per_hour: per_hour,
            burst_allowance: burst,
        }
    }

    #[test]
    fn test_configure_validation() {
        let limiter = RateLimiter::default();
        assert!(limiter.configure(config("agent-1", 0, 100, 2)).is_err());
        assert!(limiter.configure(config("", 10, 100, 2)).is_err());
        assert!(limiter.configure(config("agent-1", 10, 100, 2)).is_ok());
    }

    #[test]
    fn test_burst_admits_exactly_base_plus_burst_cold() {
        let limiter = RateLimiter::default();
        let now = 1_700_000_000_000;
        limiter
            .configure_at(config("agent-1", 10, 10_000, 2), now)
            .unwrap();

        // 10 base + 2 burst admitted back to back
        for i in 0..12 {
            let decision = limiter.check_and_admit_at("agent-1", now + i);
            assert!(decision.allowed, "call {} should be admitted", i + 1);
        }

        let denied = limiter.check_and_admit_at("agent-1", now + 12);
        assert!(!denied.allowed);
        assert!(denied.retry_after_seconds > 0.0);
        assert_eq!(
            denied.limiting_factor.as_deref(),
            Some("per-minute rate limit")
        );
    }

    #[test]
    fn test_continuous_refill() {
        let limiter = RateLimiter::default();
        let now = 1_700_000_000_000;
        limiter
            .configure_at(config("agent-1", 10, 10_000, 0), now)
            .unwrap();

        for i in 0..10 {
            assert!(limiter.check_and_admit_at("agent-1", now + i).allowed);
        }
        assert!(!limiter.check_and_admit_at("agent-1", now + 10).allowed);

        // 6 seconds refills one token at 10/minute
        assert!(limiter.check_and_admit_at("agent-1", now + 6_100).allowed);
        assert!(!limiter.check_and_admit_at("agent-1", now + 6_150).allowed);
    }

    #[test]
    fn test_burst_replenishes_after_full_idle_window() {
        let limiter = RateLimiter::default();
        let now = 1_700_000_000_000;
        limiter
            .configure_at(config("agent-1", 2, 10_000, 1), now)
            .unwrap();

        // Drain base and burst
        for i in 0..3 {
            assert!(limiter.check_and_admit_at("agent-1", now + i).allowed);
        }
        assert!(!limiter.check_and_admit_at("agent-1", now + 3).allowed);

        // Half a window idle: base refills (1.5 tokens) but burst does not
        let later = now + 45_000;
        assert!(limiter.check_and_admit_at("agent-1", later).allowed);
        assert!(!limiter.check_and_admit_at("agent-1", later + 1).allowed);

        // A full idle minute brings the burst credit back: 2 base + 1 burst
        let idle = later + 60_001;
        assert!(limiter.check_and_admit_at("agent-1", idle).allowed);
        assert!(limiter.check_and_admit_at("agent-1", idle + 1).allowed);
        assert!(limiter.check_and_admit_at("agent-1", idle + 2).allowed);
        assert!(!limiter.check_and_admit_at("agent-1", idle + 3).allowed);
    }

    #[test]
    fn test_hourly_bucket_is_independent() {
        let limiter = RateLimiter::default();
        let now = 1_700_000_000_000;
        // Generous minute limit, tiny hourly limit
        limiter
            .configure_at(config("agent-1", 100, 3, 0), now)
            .unwrap();

        for i in 0..3 {
            assert!(limiter.check_and_admit_at("agent-1", now + i).allowed);
        }

        let denied = limiter.check_and_admit_at("agent-1", now + 3);
        assert!(!denied.allowed);
        assert_eq!(
            denied.limiting_factor.as_deref(),
            Some("per-hour rate limit")
        );
    }

    #[test]
    fn test_unconfigured_agent_gets_defaults() {
        let limiter = RateLimiter::new(RateLimiterDefaults {
            max_calls_per_minute: 1,
            max_calls_per_hour: 100,
            burst_allowance: 0,
        });
        let now = 1_700_000_000_000;

        assert!(limiter.check_and_admit_at("unseen", now).allowed);
        assert!(!limiter.check_and_admit_at("unseen", now + 1).allowed);
        assert_eq!(limiter.agents_tracked(), 1);
    }

    #[test]
    fn test_agents_are_isolated() {
        let limiter = RateLimiter::default();
        let now = 1_700_000_000_000;
        limiter
            .configure_at(config("agent-1", 1, 100, 0), now)
            .unwrap();
        limiter
            .configure_at(config("agent-2", 1, 100, 0), now)
            .unwrap();

        assert!(limiter.check_and_admit_at("agent-1", now).allowed);
        assert!(!limiter.check_and_admit_at("agent-1", now + 1).allowed);
        // agent-2 is untouched by agent-1's consumption
        assert!(limiter.check_and_admit_at("agent-2", now + 2).allowed);
    }

    #[test]
    fn test_concurrent_admissions_respect_capacity() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::default());
        let now = 1_700_000_000_000;
        limiter
            .configure_at(config("agent-1", 50, 10_000, 0), now)
            .unwrap();

        let admitted = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let admitted = admitted.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    if limiter.check_and_admit_at("agent-1", now).allowed {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // 200 simultaneous attempts, zero elapsed time: exactly 50 pass
        assert_eq!(admitted.load(Ordering::SeqCst), 50);
    }
}
