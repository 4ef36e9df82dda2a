use crate::check;
use colored::*;
use reqwest::Client;
use serde::Deserialize;
use std::error::Error;
use std::time::Duration;

const FOLLOW_POLL: Duration = Duration::from_secs(1);
/// Lines shown before following when no `--limit` is given.
const DEFAULT_TAIL: usize = 50;

/// Which end of the log a request reads from.
enum Page {
    /// The newest `n` matching entries.
    Newest(usize),
    /// Everything after the cursor.
    After(u64),
}

#[derive(Debug, Default, Clone)]
pub struct LogQuery {
    pub category: Option<String>,
    pub text: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct LogsResponse {
    last_seq: u64,
    entries: Vec<LogEntry>,
}

#[derive(Debug, Deserialize)]
struct LogEntry {
    seq: u64,
    timestamp: String,
    category: String,
    level: String,
    message: String,
}

impl LogEntry {
    fn pretty(&self) -> String {
        let level = match self.level.as_str() {
            "error" => "ERROR".red().bold(),
            "warn" => "WARN ".yellow(),
            _ => "INFO ".normal(),
        };
        format!(
            "{:>6} {} {} {:<13} {}",
            self.seq,
            self.timestamp.dimmed(),
            level,
            self.category,
            self.message
        )
    }
}

async fn fetch(
    client: &Client,
    url: &str,
    query: &LogQuery,
    page: Page,
) -> Result<LogsResponse, Box<dyn Error>> {
    let mut params: Vec<(&str, String)> = Vec::new();
    if let Some(category) = &query.category {
        params.push(("category", category.clone()));
    }
    if let Some(text) = &query.text {
        params.push(("text", text.clone()));
    }
    match page {
        Page::Newest(n) => params.push(("tail", n.to_string())),
        Page::After(after) => {
            params.push(("after", after.to_string()));
            if let Some(limit) = query.limit {
                params.push(("limit", limit.to_string()));
            }
        }
    }
    let resp = client
        .get(format!("{url}/logs"))
        .query(&params)
        .send()
        .await?;
    Ok(check(resp).await?.json().await?)
}

pub async fn run_logs(
    client: &Client,
    url: &str,
    query: LogQuery,
    follow: bool,
) -> Result<(), Box<dyn Error>> {
    let newest = Page::Newest(query.limit.unwrap_or(DEFAULT_TAIL));
    let first = fetch(client, url, &query, newest).await?;
    for entry in &first.entries {
        println!("{}", entry.pretty());
    }
    if !follow {
        return Ok(());
    }

    let mut cursor = first.last_seq;
    loop {
        tokio::time::sleep(FOLLOW_POLL).await;
        match fetch(client, url, &query, Page::After(cursor)).await {
            Ok(page) => {
                for entry in &page.entries {
                    println!("{}", entry.pretty());
                }
                cursor = cursor.max(page.last_seq);
            }
            Err(e) => eprintln!("Error polling logs: {e}"),
        }
    }
}
