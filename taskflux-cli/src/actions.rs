use crate::check;
use colored::*;
use reqwest::Client;
use reqwest::header::CONTENT_DISPOSITION;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
struct KillReport {
    pid: u32,
    name: String,
    outcome: String,
}

#[derive(Debug, Deserialize)]
struct TreeMember {
    pid: u32,
    outcome: String,
}

#[derive(Debug, Deserialize)]
struct TreeReport {
    pid: u32,
    name: String,
    cycle: u64,
    outcome: String,
    descendants: Vec<TreeMember>,
}

#[derive(Debug, Deserialize)]
struct Location {
    executable: String,
    directory: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    show_system_processes: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auto_sort: Option<bool>,
}

fn outcome_label(outcome: &str) -> ColoredString {
    match outcome {
        "terminated" => outcome.green(),
        "escalated" => outcome.yellow(),
        _ => outcome.dimmed(),
    }
}

pub async fn run_kill(client: &Client, url: &str, pid: u32) -> Result<(), Box<dyn Error>> {
    let resp = client
        .post(format!("{url}/processes/{pid}/kill"))
        .send()
        .await?;
    let report: KillReport = check(resp).await?.json().await?;
    println!(
        "{} (PID {}): {}",
        report.name,
        report.pid,
        outcome_label(&report.outcome)
    );
    Ok(())
}

pub async fn run_kill_tree(client: &Client, url: &str, pid: u32) -> Result<(), Box<dyn Error>> {
    let resp = client
        .post(format!("{url}/processes/{pid}/kill-tree"))
        .send()
        .await?;
    let report: TreeReport = check(resp).await?.json().await?;
    for member in &report.descendants {
        println!("  PID {:<8} {}", member.pid, outcome_label(&member.outcome));
    }
    println!(
        "{} (PID {}): {} with {} descendant(s), tree from cycle {}",
        report.name,
        report.pid,
        outcome_label(&report.outcome),
        report.descendants.len(),
        report.cycle
    );
    Ok(())
}

pub async fn run_locate(client: &Client, url: &str, pid: u32) -> Result<(), Box<dyn Error>> {
    let resp = client
        .get(format!("{url}/processes/{pid}/location"))
        .send()
        .await?;
    let location: Location = check(resp).await?.json().await?;
    println!("{}", location.executable);
    println!("{} {}", "directory:".dimmed(), location.directory);
    Ok(())
}

fn suggested_name(disposition: Option<&str>) -> Option<String> {
    let value = disposition?;
    let start = value.find("filename=\"")? + "filename=\"".len();
    let end = value[start..].find('"')? + start;
    Some(value[start..end].to_string())
}

pub async fn run_export(
    client: &Client,
    url: &str,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let resp = check(client.get(format!("{url}/export")).send().await?).await?;
    let suggested = suggested_name(
        resp.headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok()),
    );
    let body = resp.bytes().await?;
    let path = output
        .or_else(|| suggested.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("taskflux-snapshot.json"));
    std::fs::write(&path, &body)?;
    println!("Exported {} bytes to {}", body.len(), path.display());
    Ok(())
}

pub async fn run_settings(
    client: &Client,
    url: &str,
    refresh_ms: Option<u64>,
    show_system: Option<bool>,
    auto_sort: Option<bool>,
) -> Result<(), Box<dyn Error>> {
    let patch = Settings {
        refresh_interval_ms: refresh_ms,
        show_system_processes: show_system,
        auto_sort,
    };
    let request = if refresh_ms.is_none() && show_system.is_none() && auto_sort.is_none() {
        client.get(format!("{url}/settings"))
    } else {
        client.put(format!("{url}/settings")).json(&patch)
    };
    let settings: Settings = check(request.send().await?).await?.json().await?;
    let show = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
    println!(
        "refresh_interval_ms   {}",
        show(settings.refresh_interval_ms.map(|v| v.to_string()))
    );
    println!(
        "show_system_processes {}",
        show(settings.show_system_processes.map(|v| v.to_string()))
    );
    println!(
        "auto_sort             {}",
        show(settings.auto_sort.map(|v| v.to_string()))
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_attachment_filename() {
        assert_eq!(
            suggested_name(Some("attachment; filename=\"taskflux-snapshot-9.json\"")),
            Some("taskflux-snapshot-9.json".to_string())
        );
        assert_eq!(suggested_name(Some("inline")), None);
        assert_eq!(suggested_name(None), None);
    }
}
