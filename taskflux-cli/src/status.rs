use crate::check;
use crate::processes::{ThreatEvent, tier_color};
use colored::*;
use reqwest::Client;
use serde::Deserialize;
use std::error::Error;

#[derive(Deserialize, Debug)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    cycle: u64,
    processes: usize,
    health_score: f64,
    health_status: String,
    last_log_seq: u64,
    threat_events: usize,
    #[serde(default)]
    recent_threats: Vec<ThreatEvent>,
    settings: Settings,
    metrics: Metrics,
}

#[derive(Deserialize, Debug)]
struct Settings {
    refresh_interval_ms: u64,
}

#[derive(Deserialize, Debug)]
struct Metrics {
    cycles_failed: u64,
    ticks_skipped: u64,
    last_cycle_ms: u64,
    actions_succeeded: u64,
    actions_failed: u64,
    last_error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Health {
    top_issues: Vec<Issue>,
}

#[derive(Deserialize, Debug)]
struct Issue {
    tier: String,
    summary: String,
}

pub fn health_color(status: &str) -> Color {
    match status {
        "healthy" => Color::Green,
        "normal" => Color::Cyan,
        "watch" => Color::Yellow,
        "risky" => Color::Magenta,
        _ => Color::Red,
    }
}

pub async fn run_status(client: &Client, url: &str) -> Result<(), Box<dyn Error>> {
    let status: StatusResponse = check(client.get(format!("{url}/status")).send().await?)
        .await?
        .json()
        .await?;
    let health: Health = check(client.get(format!("{url}/health")).send().await?)
        .await?
        .json()
        .await?;

    println!(
        "{} v{} (up {}s)",
        "taskfluxd".bold(),
        status.version,
        status.uptime_secs
    );
    println!(
        "health:    {} {}",
        format!("{:.0}", status.health_score).bold(),
        status
            .health_status
            .to_uppercase()
            .color(health_color(&status.health_status))
    );
    println!(
        "cycle:     {} ({} processes, {} ms, every {} ms)",
        status.cycle,
        status.processes,
        status.metrics.last_cycle_ms,
        status.settings.refresh_interval_ms
    );
    println!(
        "skipped:   {} ticks, {} failed cycles",
        status.metrics.ticks_skipped, status.metrics.cycles_failed
    );
    println!(
        "actions:   {} ok, {} failed",
        status.metrics.actions_succeeded, status.metrics.actions_failed
    );
    println!(
        "events:    {} threats, log seq {}",
        status.threat_events, status.last_log_seq
    );
    if let Some(err) = status.metrics.last_error {
        println!("{} {}", "last error:".red(), err);
    }

    if !health.top_issues.is_empty() {
        println!();
        println!("{}", "Top issues".bold());
        for issue in health.top_issues {
            println!(
                "  {:<10} {}",
                issue.tier.to_uppercase().color(tier_color(&issue.tier)),
                issue.summary
            );
        }
    }

    if !status.recent_threats.is_empty() {
        println!();
        println!("{}", "Latest threats".bold());
        for event in status.recent_threats {
            println!(
                "  {:<10} {}",
                event.tier.to_uppercase().color(tier_color(&event.tier)),
                event.reason
            );
        }
    }
    Ok(())
}
