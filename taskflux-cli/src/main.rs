use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde::Deserialize;
use std::error::Error;
use std::path::PathBuf;

mod actions;
mod logs;
mod processes;
mod status;

#[derive(clap::Parser, Debug)]
#[command(version, about = "Client for the taskfluxd process monitor")]
struct Args {
    /// Base URL of the taskfluxd API
    #[clap(long, default_value = "http://127.0.0.1:3000")]
    url: String,

    /// Disable colorized output
    #[clap(long)]
    no_color: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Daemon status and the current health score
    Status,
    /// List processes of the latest cycle with their suspicion scores
    Processes {
        /// Only processes classified above Low
        #[clap(long)]
        suspicious: bool,
        /// Show at most this many rows
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Show recent threat events
    Threats {
        /// Lowest tier to include (low, medium, high, dangerous)
        #[clap(long, default_value = "low")]
        min_tier: String,
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Query the event log
    Logs {
        /// process, threat or system_action
        #[clap(long)]
        category: Option<String>,
        /// Case-insensitive substring match
        #[clap(long)]
        text: Option<String>,
        #[clap(long)]
        limit: Option<usize>,
        /// Keep polling for new entries
        #[clap(long)]
        follow: bool,
    },
    /// Terminate a process, escalating if it ignores the request
    Kill { pid: u32 },
    /// Terminate a process and all of its descendants
    KillTree { pid: u32 },
    /// Print the executable path and directory of a process
    Locate { pid: u32 },
    /// Save the latest cycle and threat history as JSON
    Export {
        /// Output file (default: the name suggested by the daemon)
        #[clap(long)]
        output: Option<PathBuf>,
    },
    /// Show or change runtime settings
    Settings {
        #[clap(long)]
        refresh_ms: Option<u64>,
        #[clap(long)]
        show_system: Option<bool>,
        #[clap(long)]
        auto_sort: Option<bool>,
    },
}

#[derive(Deserialize, Debug)]
struct ApiErrorBody {
    error: String,
    message: String,
    #[serde(default)]
    failed: Vec<FailedPid>,
}

#[derive(Deserialize, Debug)]
struct FailedPid {
    pid: u32,
    error: String,
}

/// Turn a non-2xx response into an error carrying the daemon's message.
pub(crate) async fn check(resp: Response) -> Result<Response, Box<dyn Error>> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match resp.json::<ApiErrorBody>().await {
        Ok(body) => {
            let mut message = format!("{} ({}): {}", body.error, status.as_u16(), body.message);
            for failed in body.failed {
                message.push_str(&format!("\n  PID {}: {}", failed.pid, failed.error));
            }
            Err(message.into())
        }
        Err(_) => Err(format!("request failed: {status}").into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let client = Client::new();
    if args.no_color {
        colored::control::set_override(false);
    }
    let url = args.url.trim_end_matches('/');

    match args.command {
        Command::Status => status::run_status(&client, url).await?,
        Command::Processes { suspicious, limit } => {
            processes::run_processes(&client, url, suspicious, limit).await?
        }
        Command::Threats { min_tier, limit } => {
            processes::run_threats(&client, url, &min_tier, limit).await?
        }
        Command::Logs {
            category,
            text,
            limit,
            follow,
        } => {
            let query = logs::LogQuery {
                category,
                text,
                limit,
            };
            logs::run_logs(&client, url, query, follow).await?
        }
        Command::Kill { pid } => actions::run_kill(&client, url, pid).await?,
        Command::KillTree { pid } => actions::run_kill_tree(&client, url, pid).await?,
        Command::Locate { pid } => actions::run_locate(&client, url, pid).await?,
        Command::Export { output } => actions::run_export(&client, url, output).await?,
        Command::Settings {
            refresh_ms,
            show_system,
            auto_sort,
        } => actions::run_settings(&client, url, refresh_ms, show_system, auto_sort).await?,
    }
    Ok(())
}
