//! Budget-related CLI commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, BudgetStatus};
use crate::output::{color_percent, format_timestamp, print_info, OutputFormat};

/// Row for the budget status table
#[derive(Tabled)]
struct BudgetRow {
    #[tabled(rename = "Budget")]
    id: String,
    #[tabled(rename = "Scope")]
    scope: String,
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Period")]
    period: String,
    #[tabled(rename = "Used")]
    used: String,
    #[tabled(rename = "Limit")]
    limit: String,
    #[tabled(rename = "Used%")]
    percent: String,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Resets")]
    resets: String,
}

/// Show budget status for an agent's metric
pub async fn status(
    client: &ApiClient,
    agent: &str,
    metric: &str,
    format: OutputFormat,
) -> Result<()> {
    let path = format!("v1/budgets/status?agent_id={}&metric={}", agent, metric);
    let statuses: Vec<BudgetStatus> = client.get(&path).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        OutputFormat::Table => {
            if statuses.is_empty() {
                print_info(&format!("No budgets cover {} for agent {}", metric, agent));
                return Ok(());
            }

            let rows: Vec<BudgetRow> = statuses
                .iter()
                .map(|s| BudgetRow {
                    id: s.budget_id.clone(),
                    scope: scope_label(&s.scope),
                    metric: s.metric.clone(),
                    period: s.period.clone(),
                    used: format!("{:.1}", s.current),
                    limit: format!("{:.1}", s.limit),
                    percent: color_percent(s.percent_used),
                    mode: if s.enforce_limit {
                        "enforce".to_string()
                    } else {
                        "warn".yellow().to_string()
                    },
                    resets: s
                        .reset_at
                        .map(format_timestamp)
                        .unwrap_or_else(|| "never".to_string()),
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

/// Render the budget scope (either "global" or an agent binding)
fn scope_label(scope: &serde_json::Value) -> String {
    match scope {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .get("agent")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| scope.to_string()),
        other => other.to_string(),
    }
}
