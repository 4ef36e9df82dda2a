use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use taskfluxd::api::{self, AppState};
use taskfluxd::bus::LogBus;
use taskfluxd::executor::{ActionExecutor, SignalControl};
use taskfluxd::pipeline::PipelineHandles;
use taskfluxd::sampler::{SignaturePolicy, SysinfoSource};
use taskfluxd::threats::ThreatFeed;
use taskfluxd::{Config, Metrics, Pipeline, SettingsStore};

#[derive(Parser, Debug)]
#[command(version, about = "Host process monitor daemon")]
struct Args {
    /// Path to the TOML configuration (default: $TASKFLUX_CONFIG or /etc/taskflux/taskflux.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the API listen address
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::load_from(args.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = args.listen {
        config.api.listen = listen;
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
    info!(
        "[taskfluxd] starting v{} (refresh {} ms)",
        env!("CARGO_PKG_VERSION"),
        config.runtime.refresh_interval_ms
    );

    let metrics = Arc::new(Metrics::new());
    let bus = Arc::new(LogBus::new(&config.bus).with_metrics(Arc::clone(&metrics)));
    let threats = Arc::new(ThreatFeed::new(config.bus.threat_capacity));
    let settings =
        SettingsStore::new(config.runtime.clone()).context("validating runtime settings")?;
    let handles = PipelineHandles {
        bus: Arc::clone(&bus),
        threats: Arc::clone(&threats),
        metrics: Arc::clone(&metrics),
        settings: settings.clone(),
    };

    let source = SysinfoSource::new(SignaturePolicy::new(
        config.scoring.trusted_prefixes.clone(),
    ));
    let (pipeline, cycles) = Pipeline::new(source, &config, handles);

    let executor = ActionExecutor::new(
        Arc::new(SignalControl),
        cycles.clone(),
        Arc::clone(&bus),
        Arc::clone(&metrics),
        config.actions.clone(),
    );
    let state = AppState {
        cycles,
        bus,
        threats,
        executor: Arc::new(executor),
        metrics,
        settings,
        thresholds: config.thresholds,
        started: Instant::now(),
    };

    let pipeline_task = tokio::spawn(pipeline.run());
    let listen = config.api.listen.clone();
    let server = api::serve(&listen, state, async {
        let _ = tokio::signal::ctrl_c().await;
    });

    tokio::select! {
        res = server => {
            res.with_context(|| format!("serving API on {listen}"))?;
            info!("[taskfluxd] shutdown requested");
        }
        res = pipeline_task => {
            match res {
                Ok(Ok(())) => warn!("[taskfluxd] pipeline exited"),
                Ok(Err(err)) => {
                    error!("[taskfluxd] pipeline stopped: {err}");
                    return Err(err).context("sampling pipeline");
                }
                Err(join) => return Err(join).context("pipeline task panicked"),
            }
        }
    }
    Ok(())
}
