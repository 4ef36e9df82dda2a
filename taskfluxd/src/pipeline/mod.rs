//! The periodic sample -> score -> classify -> aggregate cycle and its
//! publication.
//!
//! [`Pipeline::run_cycle`] executes the stages strictly in order on one
//! thread. The finished [`CycleResult`] replaces the previous one in a
//! `watch` channel, so readers always see a whole cycle. History and
//! last-emitted tiers live inside the pipeline and are touched by nothing
//! else.

use crate::bus::{LogBus, LogLevel, LogRecord, log_once};
use crate::classifier::{ThreatClassifier, Tier};
use crate::config::{Config, RuntimeConfig, SettingsStore};
use crate::error::PipelineError;
use crate::health::{HealthAggregator, HealthScore};
use crate::history::ProcessHistory;
use crate::metrics::Metrics;
use crate::sampler::{ProcessSource, Sampler};
use crate::scoring::{ScoreRecord, ScoringEngine};
use crate::threats::ThreatFeed;
use crate::types::{Pid, ProcessSnapshot, SystemSnapshot};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

pub mod cadence;

pub use cadence::Cadence;

/// Everything one cycle produced.
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub system: SystemSnapshot,
    /// Processes after the publication filters, in display order.
    pub processes: Vec<ProcessSnapshot>,
    /// Scores of `processes`, same order.
    pub scores: Vec<ScoreRecord>,
    pub health: HealthScore,
    /// Every sampled process, unfiltered. Actions resolve PIDs here.
    #[serde(skip)]
    pub process_table: Vec<ProcessSnapshot>,
}

impl CycleResult {
    /// Placeholder published before the first cycle completes.
    pub fn empty() -> Self {
        Self::with_table(0, Vec::new())
    }

    pub fn with_table(cycle: u64, mut process_table: Vec<ProcessSnapshot>) -> Self {
        process_table.sort_by_key(|p| p.pid);
        Self {
            cycle,
            timestamp: Utc::now(),
            system: SystemSnapshot::default(),
            processes: process_table.clone(),
            scores: Vec::new(),
            health: HealthScore::perfect(),
            process_table,
        }
    }

    pub fn process(&self, pid: Pid) -> Option<&ProcessSnapshot> {
        self.process_table.iter().find(|p| p.pid == pid)
    }

    pub fn process_table(&self) -> &[ProcessSnapshot] {
        &self.process_table
    }

    pub fn score(&self, pid: Pid) -> Option<&ScoreRecord> {
        self.scores.iter().find(|s| s.pid == pid)
    }
}

/// Shared structures the pipeline writes into besides its own output.
#[derive(Clone)]
pub struct PipelineHandles {
    pub bus: Arc<LogBus>,
    pub threats: Arc<ThreatFeed>,
    pub metrics: Arc<Metrics>,
    pub settings: SettingsStore,
}

pub struct Pipeline<S> {
    sampler: Sampler<S>,
    scoring: ScoringEngine,
    history: ProcessHistory,
    classifier: ThreatClassifier,
    health: HealthAggregator,
    handles: PipelineHandles,
    publisher: watch::Sender<Arc<CycleResult>>,
    cycle: u64,
    /// PID -> (start time, name) of the previous successful cycle.
    known: Option<HashMap<Pid, (Option<u64>, String)>>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

impl<S: ProcessSource> Pipeline<S> {
    pub fn new(
        source: S,
        config: &Config,
        handles: PipelineHandles,
    ) -> (Self, watch::Receiver<Arc<CycleResult>>) {
        let (publisher, receiver) = watch::channel(Arc::new(CycleResult::empty()));
        let pipeline = Self {
            sampler: Sampler::new(source),
            scoring: ScoringEngine::new(config.scoring.clone(), config.allow_list.clone()),
            history: ProcessHistory::new(config.scoring.history_len),
            classifier: ThreatClassifier::new(config.thresholds),
            health: HealthAggregator::new(config.health.clone(), config.thresholds),
            handles,
            publisher,
            cycle: 0,
            known: None,
            consecutive_failures: 0,
            last_error: None,
        };
        (pipeline, receiver)
    }

    /// Run one full cycle.
    ///
    /// `Ok(None)` means sampling failed and the previous result stays
    /// published. Only repeated sampling failure is an error.
    pub fn run_cycle(&mut self) -> Result<Option<Arc<CycleResult>>, PipelineError> {
        let started = Instant::now();
        let settings = self.handles.settings.snapshot();

        let (processes, system) = match self.sampler.sample() {
            Ok(sample) => sample,
            Err(err) => {
                self.consecutive_failures += 1;
                self.handles.metrics.inc_cycles_failed();
                self.handles.metrics.set_last_error(Some(err.to_string()));
                log_once(
                    &mut self.last_error,
                    format!("[pipeline] sampling failed: {err}"),
                );
                self.handles.bus.append(
                    LogRecord::action(format!(
                        "[SYSTEM] sampling failed, keeping previous snapshot: {err}"
                    ))
                    .level(LogLevel::Warn),
                );
                if self.consecutive_failures >= settings.max_consecutive_failures {
                    error!(
                        "[pipeline] giving up after {} consecutive sampling failures",
                        self.consecutive_failures
                    );
                    self.handles.bus.append(
                        LogRecord::action(format!(
                            "[FATAL] system metrics unavailable for {} consecutive cycles: {err}",
                            self.consecutive_failures
                        ))
                        .level(LogLevel::Error),
                    );
                    return Err(PipelineError::Fatal {
                        failures: self.consecutive_failures,
                        last: err,
                    });
                }
                return Ok(None);
            }
        };
        if self.consecutive_failures > 0 {
            info!(
                "[pipeline] sampling recovered after {} failed cycle(s)",
                self.consecutive_failures
            );
            self.consecutive_failures = 0;
            self.last_error = None;
            self.handles.metrics.set_last_error(None);
        }

        let now = system.timestamp;
        self.track_lifecycle(&processes, now);

        let records = self.scoring.score(&processes, &self.history, now);
        self.history.record(&processes);

        let events = self.classifier.observe(&records, now);
        self.handles.metrics.add_threat_events(events.len());
        for event in events {
            let level = if event.tier >= Tier::High {
                LogLevel::Warn
            } else {
                LogLevel::Info
            };
            let mut record = LogRecord::threat(format!("[THREAT] {}", event.reason))
                .level(level)
                .tier(event.tier)
                .at(now);
            if let Some(pid) = event.pid {
                record = record.pid(pid);
            }
            self.handles.bus.append(record);
            self.handles.threats.record(event);
        }

        let health = self.health.aggregate(&system, &records);

        self.cycle += 1;
        let (visible, scores) = publish_view(&processes, &records, &settings);
        let result = Arc::new(CycleResult {
            cycle: self.cycle,
            timestamp: now,
            system,
            processes: visible,
            scores,
            health,
            process_table: processes,
        });
        self.publisher.send_replace(Arc::clone(&result));

        let elapsed = started.elapsed().as_millis();
        self.handles
            .metrics
            .record_cycle(u64::try_from(elapsed).unwrap_or(u64::MAX), result.process_table.len());
        Ok(Some(result))
    }

    /// Append spawn/exit entries by diffing against the previous cycle. A
    /// PID seen again with a new start time was reused: exit plus spawn.
    fn track_lifecycle(&mut self, processes: &[ProcessSnapshot], now: DateTime<Utc>) {
        let current: HashMap<Pid, (Option<u64>, String)> = processes
            .iter()
            .map(|p| (p.pid, (p.start_time, p.name.clone())))
            .collect();

        let Some(previous) = self.known.take() else {
            info!(
                "[pipeline] baseline of {} processes recorded",
                processes.len()
            );
            self.known = Some(current);
            return;
        };

        let mut exited: Vec<Pid> = previous
            .iter()
            .filter(|(pid, (start, _))| {
                current
                    .get(*pid)
                    .is_none_or(|(seen, _)| seen != start)
            })
            .map(|(pid, _)| *pid)
            .collect();
        exited.sort_unstable();
        for pid in exited {
            self.classifier.forget(pid);
            self.handles
                .bus
                .append(LogRecord::process(format!("[PROC-EXIT] PID {pid}")).pid(pid).at(now));
        }

        for snap in processes {
            let spawned = previous
                .get(&snap.pid)
                .is_none_or(|(start, _)| *start != snap.start_time);
            if spawned {
                self.handles.bus.append(
                    LogRecord::process(format!("[PROC-SPAWN] {} (PID {})", snap.name, snap.pid))
                        .pid(snap.pid)
                        .at(now),
                );
            }
        }
        self.known = Some(current);
    }
}

impl<S: ProcessSource + 'static> Pipeline<S> {
    /// Drive cycles on the configured cadence until a fatal error.
    ///
    /// Each cycle runs on the blocking pool; the next tick is awaited only
    /// after it returns, so cycles never overlap. A changed refresh interval
    /// takes effect from the following tick.
    pub async fn run(self) -> Result<(), PipelineError> {
        let settings = self.handles.settings.clone();
        let metrics = Arc::clone(&self.handles.metrics);
        let mut period = settings.snapshot().refresh_interval();
        let mut cadence = Cadence::new(period);
        let mut reported_skips = 0;
        let mut pipeline = self;
        info!("[pipeline] running every {} ms", period.as_millis());

        loop {
            cadence.next_tick().await;
            let (returned, result) = tokio::task::spawn_blocking(move || {
                let result = pipeline.run_cycle();
                (pipeline, result)
            })
            .await
            .map_err(|e| PipelineError::Worker(e.to_string()))?;
            pipeline = returned;
            cadence.mark_finished();

            let skipped = cadence.skipped();
            metrics.add_ticks_skipped(skipped - reported_skips);
            reported_skips = skipped;

            if let Err(err) = result {
                error!("[pipeline] stopping: {err}");
                return Err(err);
            }

            let wanted = settings.snapshot().refresh_interval();
            if wanted != period {
                info!(
                    "[pipeline] refresh interval {} ms -> {} ms",
                    period.as_millis(),
                    wanted.as_millis()
                );
                period = wanted;
                cadence = Cadence::delayed(period);
                reported_skips = 0;
            }
        }
    }
}

/// Apply the display settings: hide system processes unless asked, and
/// order by score or by PID.
fn publish_view(
    processes: &[ProcessSnapshot],
    records: &[ScoreRecord],
    settings: &RuntimeConfig,
) -> (Vec<ProcessSnapshot>, Vec<ScoreRecord>) {
    let mut rows: Vec<(&ProcessSnapshot, &ScoreRecord)> = processes
        .iter()
        .zip(records)
        .filter(|(p, _)| settings.show_system_processes || !p.system)
        .collect();
    if settings.auto_sort {
        rows.sort_by(|a, b| b.1.score.total_cmp(&a.1.score).then(a.0.pid.cmp(&b.0.pid)));
    } else {
        rows.sort_by_key(|(p, _)| p.pid);
    }
    if rows.is_empty() && !processes.is_empty() {
        warn!("[pipeline] every process hidden by the publication filters");
    }
    rows.into_iter()
        .map(|(p, r)| (p.clone(), r.clone()))
        .unzip()
}
