use crate::check;
use colored::*;
use reqwest::Client;
use serde::Deserialize;
use std::error::Error;

#[derive(Debug, Deserialize)]
pub struct ProcessRow {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub name: String,
    pub cpu_percent: Option<f32>,
    pub memory_bytes: Option<u64>,
    pub score: Option<f64>,
    pub tier: String,
    #[serde(default)]
    pub reasons: Vec<Reason>,
}

#[derive(Debug, Deserialize)]
pub struct Reason {
    pub heuristic: String,
}

#[derive(Debug, Deserialize)]
pub struct ThreatEvent {
    pub pid: Option<u32>,
    pub name: String,
    pub tier: String,
    pub reason: String,
    pub timestamp: String,
}

pub fn tier_color(tier: &str) -> Color {
    match tier {
        "dangerous" => Color::BrightRed,
        "high" => Color::Red,
        "medium" => Color::Yellow,
        "low" => Color::Blue,
        _ => Color::Green,
    }
}

pub async fn run_processes(
    client: &Client,
    url: &str,
    suspicious: bool,
    limit: Option<usize>,
) -> Result<(), Box<dyn Error>> {
    let mut request = client
        .get(format!("{url}/processes"))
        .query(&[("suspicious", suspicious)]);
    if let Some(limit) = limit {
        request = request.query(&[("limit", limit)]);
    }
    let processes: Vec<ProcessRow> = check(request.send().await?).await?.json().await?;

    println!(
        "{:<8} {:<8} {:<6} {:<9} {:<6} {:<10} NAME",
        "PID", "PPID", "CPU%", "MEM MiB", "SCORE", "TIER"
    );
    for p in processes {
        let reasons: Vec<&str> = p.reasons.iter().map(|r| r.heuristic.as_str()).collect();
        println!(
            "{:<8} {:<8} {:<6} {:<9} {:<6} {:<10} {}{}",
            p.pid,
            p.ppid.map_or_else(|| "-".to_string(), |v| v.to_string()),
            format_pct(p.cpu_percent),
            format_mib(p.memory_bytes),
            p.score.map_or_else(|| "-".to_string(), |s| format!("{s:.0}")),
            p.tier.to_uppercase().color(tier_color(&p.tier)),
            p.name,
            if reasons.is_empty() {
                String::new()
            } else {
                format!(" [{}]", reasons.join(", ")).dimmed().to_string()
            }
        );
    }
    Ok(())
}

pub async fn run_threats(
    client: &Client,
    url: &str,
    min_tier: &str,
    limit: Option<usize>,
) -> Result<(), Box<dyn Error>> {
    let mut request = client
        .get(format!("{url}/threats"))
        .query(&[("min_tier", min_tier)]);
    if let Some(limit) = limit {
        request = request.query(&[("limit", limit)]);
    }
    let events: Vec<ThreatEvent> = check(request.send().await?).await?.json().await?;

    if events.is_empty() {
        println!("{}", "No threat events.".dimmed());
        return Ok(());
    }
    for event in events {
        println!(
            "{} {:<10} {:<8} {:<16} {}",
            event.timestamp.dimmed(),
            event.tier.to_uppercase().color(tier_color(&event.tier)),
            event.pid.map_or_else(|| "-".to_string(), |v| v.to_string()),
            event.name,
            event.reason
        );
    }
    Ok(())
}

fn format_pct(opt: Option<f32>) -> String {
    match opt {
        Some(value) => format!("{value:.1}"),
        None => "-".to_string(),
    }
}

fn format_mib(opt: Option<u64>) -> String {
    match opt {
        Some(bytes) => format!("{:.1}", bytes as f64 / (1024.0 * 1024.0)),
        None => "-".to_string(),
    }
}
