//! Anomaly inspection commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{Anomaly, ApiClient, SpikeReport};
use crate::output::{
    color_severity, format_confidence, format_timestamp, print_info, OutputFormat,
};

/// Row for the anomaly list table
#[derive(Tabled)]
struct AnomalyRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Agent")]
    agent: String,
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Confidence")]
    confidence: String,
    #[tabled(rename = "Baseline")]
    baseline: String,
    #[tabled(rename = "Observed")]
    observed: String,
}

/// Row for the spike drill-down table
#[derive(Tabled)]
struct SpikeRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Z")]
    z: String,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Severity")]
    severity: String,
}

/// List anomalies detected over a window
pub async fn list(client: &ApiClient, window_secs: Option<u64>, format: OutputFormat) -> Result<()> {
    let path = match window_secs {
        Some(secs) => format!("v1/anomalies?window_secs={}", secs),
        None => "v1/anomalies".to_string(),
    };
    let anomalies: Vec<Anomaly> = client.get(&path).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&anomalies)?);
        }
        OutputFormat::Table => {
            if anomalies.is_empty() {
                print_info("No anomalies detected");
                return Ok(());
            }

            let rows: Vec<AnomalyRow> = anomalies
                .iter()
                .map(|a| AnomalyRow {
                    time: format_timestamp(a.timestamp),
                    agent: a.agent_id.clone(),
                    model: a.model.clone(),
                    metric: a.metric.clone(),
                    severity: color_severity(&a.severity),
                    score: format!("{:.0}", a.score),
                    confidence: format_confidence(a.confidence),
                    baseline: format!("{:.2}", a.baseline_mean),
                    observed: format!("{:.2}", a.observed),
                })
                .collect();

            let table = tabled::Table::new(rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
        }
    }

    Ok(())
}

/// Drill into one agent's metric series
pub async fn spikes(
    client: &ApiClient,
    agent: &str,
    metric: &str,
    since_hours: u64,
    format: OutputFormat,
) -> Result<()> {
    let to = chrono::Utc::now().timestamp();
    let from = to - since_hours as i64 * 3600;
    let path = format!(
        "v1/anomalies/spikes?agent_id={}&metric={}&from={}&to={}",
        agent, metric, from, to
    );
    let report: SpikeReport = client.get(&path).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => {
            println!("{}", "Spike Analysis".bold());
            println!("{}", "=".repeat(50));
            println!("Agent:                  {}", report.agent_id.cyan());
            println!("Metric:                 {}", report.metric);
            println!(
                "Range:                  {} .. {}",
                format_timestamp(report.from),
                format_timestamp(report.to)
            );
            println!("Observations:           {}", report.observations);
            println!(
                "Baseline:               mean {:.2}, stddev {:.2}, q1 {:.2}, q3 {:.2}",
                report.mean, report.std_dev, report.q1, report.q3
            );
            println!();

            if report.spikes.is_empty() {
                print_info("No spikes in range");
                return Ok(());
            }

            let rows: Vec<SpikeRow> = report
                .spikes
                .iter()
                .map(|p| SpikeRow {
                    time: format_timestamp(p.timestamp),
                    value: format!("{:.2}", p.value),
                    z: p
                        .z_score
                        .map(|z| format!("{:+.1}", z))
                        .unwrap_or_else(|| "-".to_string()),
                    score: format!("{:.0}", p.score),
                    severity: color_severity(&p.severity),
                })
                .collect();

            let table = tabled::Table::new(rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
        }
    }

    Ok(())
}
