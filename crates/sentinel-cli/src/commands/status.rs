//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    running: bool,
    components: HashMap<String, ComponentStatus>,
}

#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    message: Option<String>,
}

/// Show health and key metrics of a running process.
pub async fn run(url: &str, metrics_url: &str) -> Result<()> {
    println!("Checking health at {}...\n", url);

    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => print_health_status(&health, status_code.as_u16()),
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs sentinel running?");
            println!("Start it with: sentinel run --config <path-to-config>");
            return Ok(());
        }
    }

    let metrics_url = format!("{}/metrics", metrics_url.trim_end_matches('/'));
    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => println!("Failed to fetch metrics: {}", e),
    }

    Ok(())
}

fn status_tag(status: &str) -> &'static str {
    match status {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    }
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    println!(
        "{} Overall Status: {} (HTTP {}){}",
        status_tag(&health.status),
        health.status.to_uppercase(),
        status_code,
        if health.running { "" } else { " - not running" }
    );
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        let sorted: BTreeMap<_, _> = health.components.iter().collect();
        for (name, status) in sorted {
            match &status.message {
                Some(msg) => println!("  {} {}: {} ({})", status_tag(&status.status), name, status.status, msg),
                None => println!("  {} {}: {}", status_tag(&status.status), name, status.status),
            }
        }
    }
}

/// Unlabelled samples only; labelled series are summarised per metric.
fn parse_metrics(metrics_text: &str) -> HashMap<&str, f64> {
    let mut values = HashMap::new();
    for line in metrics_text.lines() {
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        if let (Some(name), Some(value)) = (parts.next(), parts.next()) {
            if let Ok(value) = value.parse::<f64>() {
                let name = name.split('{').next().unwrap_or(name);
                *values.entry(name).or_insert(0.0) += value;
            }
        }
    }
    values
}

fn print_metrics(metrics_text: &str) {
    let values = parse_metrics(metrics_text);
    if values.is_empty() {
        println!("No metrics available yet.");
        return;
    }

    let rows = [
        ("sentinel_events_captured_total", "Events Captured:   "),
        ("sentinel_events_published_total", "Events Published:  "),
        ("sentinel_events_applied_total", "Events Applied:    "),
        ("sentinel_events_already_applied_total", "Already Applied:   "),
        ("sentinel_dead_letters_total", "Dead Letters:      "),
        ("sentinel_retries_total", "Apply Retries:     "),
        ("sentinel_errors_total", "Errors:            "),
        ("sentinel_partition_lag", "Total Lag:         "),
    ];
    for (metric, label) in rows {
        if let Some(v) = values.get(metric) {
            println!("{}{}", label, format_number(*v as u64));
        }
    }
    if let Some(state) = values.get("sentinel_circuit_breaker_state") {
        let name = match *state as u64 {
            0 => "closed",
            1 => "open",
            _ => "half-open",
        };
        println!("Circuit Breaker:   {}", name);
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metrics_sums_labelled_series() {
        let text = "# HELP sentinel_partition_lag Lag\n\
                    sentinel_partition_lag{partition=\"0\"} 5\n\
                    sentinel_partition_lag{partition=\"1\"} 7\n\
                    sentinel_events_applied_total 42\n";
        let values = parse_metrics(text);
        assert_eq!(values.get("sentinel_partition_lag"), Some(&12.0));
        assert_eq!(values.get("sentinel_events_applied_total"), Some(&42.0));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_500), "1.50K");
        assert_eq!(format_number(2_000_000), "2.00M");
    }
}
