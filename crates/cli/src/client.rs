//! API client for communicating with the governor daemon

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use url::Url;

/// API client for the governor daemon
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    /// Make a POST request with JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub budget_id: String,
    pub scope: serde_json::Value,
    pub metric: String,
    pub period: String,
    pub current: f64,
    pub limit: f64,
    pub percent_used: f64,
    pub enforce_limit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub timestamp: i64,
    pub agent_id: String,
    pub model: String,
    pub metric: String,
    pub severity: String,
    pub score: f64,
    pub confidence: f64,
    pub baseline_mean: f64,
    pub observed: f64,
    pub deviation: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,
    pub method: String,
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikePoint {
    pub timestamp: i64,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,
    pub score: f64,
    pub severity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikeReport {
    pub agent_id: String,
    pub metric: String,
    pub from: i64,
    pub to: i64,
    pub observations: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub q1: f64,
    pub q3: f64,
    pub spikes: Vec<SpikePoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetRule {
    pub metric: String,
    pub period: String,
    pub limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforce_limit: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_calls_per_minute: u32,
    pub max_calls_per_hour: u32,
    pub burst_allowance: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub agent_id: String,
    pub budgets: BTreeMap<String, BudgetRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitRule>,
    pub alert_channels: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDiff {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<EffectivePolicy>,
    pub after: EffectivePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFailure {
    pub agent_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub dry_run: bool,
    pub scanned: usize,
    pub changed: Vec<PolicyDiff>,
    pub unchanged: usize,
    pub failures: Vec<SyncFailure>,
}
