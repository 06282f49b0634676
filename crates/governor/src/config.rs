//! Daemon configuration

use anyhow::Result;
use serde::Deserialize;

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Instance name used in structured logs
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for the governance surface and health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Timezone for period-aligned budget resets (IANA name)
    #[serde(default = "default_reset_timezone")]
    pub reset_timezone: String,

    /// Directory for persisted budgets/policies; in-memory when unset
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Window for the periodic anomaly scan in seconds
    #[serde(default = "default_detection_window")]
    pub detection_window_secs: u64,

    /// Periodic anomaly scan cadence in seconds
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Baseline recompute cadence in seconds
    #[serde(default = "default_baseline_interval")]
    pub baseline_interval_secs: u64,

    /// Policy sync cadence in seconds
    #[serde(default = "default_policy_sync_interval")]
    pub policy_sync_interval_secs: u64,
}

fn default_instance_name() -> String {
    std::env::var("INSTANCE_NAME").unwrap_or_else(|_| "usage-governor".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_reset_timezone() -> String {
    "UTC".to_string()
}

fn default_detection_window() -> u64 {
    3600
}

fn default_scan_interval() -> u64 {
    300
}

fn default_baseline_interval() -> u64 {
    24 * 60 * 60
}

fn default_policy_sync_interval() -> u64 {
    600
}

impl DaemonConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("GOVERNOR"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|_| DaemonConfig {
            instance_name: default_instance_name(),
            api_port: default_api_port(),
            reset_timezone: default_reset_timezone(),
            data_dir: None,
            detection_window_secs: default_detection_window(),
            scan_interval_secs: default_scan_interval(),
            baseline_interval_secs: default_baseline_interval(),
            policy_sync_interval_secs: default_policy_sync_interval(),
        }))
    }

    /// Parse the configured reset timezone
    pub fn timezone(&self) -> Result<chrono_tz::Tz> {
        self.reset_timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid reset_timezone {:?}: {}", self.reset_timezone, e))
    }
}
