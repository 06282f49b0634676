//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a success message
#[allow(dead_code)]
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format a unix timestamp for display
pub fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Format percent-used with a color reflecting headroom
pub fn color_percent(percent: f64) -> String {
    let formatted = format!("{:.1}%", percent);
    if percent >= 100.0 {
        formatted.red().bold().to_string()
    } else if percent >= 80.0 {
        formatted.yellow().to_string()
    } else {
        formatted.green().to_string()
    }
}

/// Color a severity label
pub fn color_severity(severity: &str) -> String {
    match severity.to_lowercase().as_str() {
        "info" => severity.blue().to_string(),
        "warning" => severity.yellow().to_string(),
        "high" => severity.red().to_string(),
        "critical" => severity.red().bold().to_string(),
        _ => severity.to_string(),
    }
}

/// Format confidence as percentage
pub fn format_confidence(confidence: f64) -> String {
    format!("{:.0}%", confidence * 100.0)
}
