//! Policy inspection and sync commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, EffectivePolicy, SyncReport, SyncRequest};
use crate::output::{print_info, print_warning, OutputFormat};

/// Row for the effective budget rules table
#[derive(Tabled)]
struct RuleRow {
    #[tabled(rename = "Rule")]
    rule: String,
    #[tabled(rename = "Limit")]
    limit: String,
    #[tabled(rename = "Alert@")]
    alert_threshold: String,
    #[tabled(rename = "Mode")]
    mode: String,
}

/// Show the resolved effective policy for an agent
pub async fn effective(client: &ApiClient, agent: &str, format: OutputFormat) -> Result<()> {
    let path = format!("v1/policies/effective/{}", agent);
    let policy: EffectivePolicy = client.get(&path).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&policy)?);
        }
        OutputFormat::Table => {
            println!("{}", "Effective Policy".bold());
            println!("{}", "=".repeat(50));
            println!("Agent:                  {}", policy.agent_id.cyan());

            if let Some(ref rl) = policy.rate_limit {
                println!(
                    "Rate limit:             {}/min, {}/hour, burst {}",
                    rl.max_calls_per_minute, rl.max_calls_per_hour, rl.burst_allowance
                );
            } else {
                println!("Rate limit:             defaults");
            }

            if policy.alert_channels.is_empty() {
                println!("Alert channels:         log");
            } else {
                let channels: Vec<&str> =
                    policy.alert_channels.iter().map(|s| s.as_str()).collect();
                println!("Alert channels:         {}", channels.join(", "));
            }
            println!();

            if policy.budgets.is_empty() {
                print_info("No budget rules apply");
                return Ok(());
            }

            let rows: Vec<RuleRow> = policy
                .budgets
                .iter()
                .map(|(key, rule)| RuleRow {
                    rule: key.clone(),
                    limit: format!("{:.1}", rule.limit),
                    alert_threshold: rule
                        .alert_threshold
                        .map(|t| format!("{:.0}%", t * 100.0))
                        .unwrap_or_else(|| "-".to_string()),
                    mode: match rule.enforce_limit {
                        Some(false) => "warn".yellow().to_string(),
                        _ => "enforce".to_string(),
                    },
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

/// Run a policy sync, optionally scoped and as a dry run
pub async fn sync(
    client: &ApiClient,
    dry_run: bool,
    scope: Option<String>,
    scope_id: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let request = SyncRequest {
        dry_run,
        scope,
        scope_id,
    };
    let report: SyncReport = client.post("v1/policies/sync", &request).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => {
            let mode = if report.dry_run {
                "dry-run".yellow().to_string()
            } else {
                "committed".green().to_string()
            };
            println!("{} ({})", "Policy Sync".bold(), mode);
            println!("{}", "=".repeat(50));
            println!("Agents scanned:         {}", report.scanned);
            println!("Changed:                {}", report.changed.len());
            println!("Unchanged:              {}", report.unchanged);

            for diff in &report.changed {
                let kind = if diff.before.is_some() {
                    "updated"
                } else {
                    "new"
                };
                println!("  {} {} ({})", "→".cyan(), diff.agent_id, kind);
            }

            if !report.failures.is_empty() {
                println!();
                for failure in &report.failures {
                    print_warning(&format!("{}: {}", failure.agent_id, failure.error));
                }
            }
        }
    }

    Ok(())
}
