//! Per-process suspicion score.
//!
//! Every heuristic is evaluated in the fixed order of [`Heuristic::ORDER`];
//! all that match contribute, and the reason list keeps that order. The
//! score is the clamped sum of the contributed deltas. An allow-listed
//! process short-circuits to [`MIN_SCORE`].

use crate::config::ScoringConfig;
use crate::history::{HistorySample, ProcessHistory};
use crate::types::{Pid, ProcessSnapshot, SignatureStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 100.0;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Heuristic {
    UnsignedBinary,
    SustainedCpu,
    RecentlySpawned,
    SuspiciousPath,
    MasqueradingName,
    BackgroundExfiltration,
    HighMemory,
    AllowListed,
}

impl Heuristic {
    /// Evaluation order of the additive heuristics.
    pub const ORDER: [Heuristic; 7] = [
        Heuristic::UnsignedBinary,
        Heuristic::SustainedCpu,
        Heuristic::RecentlySpawned,
        Heuristic::SuspiciousPath,
        Heuristic::MasqueradingName,
        Heuristic::BackgroundExfiltration,
        Heuristic::HighMemory,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Heuristic::UnsignedBinary => "unsigned_binary",
            Heuristic::SustainedCpu => "sustained_cpu",
            Heuristic::RecentlySpawned => "recently_spawned",
            Heuristic::SuspiciousPath => "suspicious_path",
            Heuristic::MasqueradingName => "masquerading_name",
            Heuristic::BackgroundExfiltration => "background_exfiltration",
            Heuristic::HighMemory => "high_memory",
            Heuristic::AllowListed => "allow_listed",
        }
    }

    /// Trend heuristics need prior samples of the same process.
    pub fn needs_history(self) -> bool {
        matches!(self, Heuristic::SustainedCpu)
    }
}

impl fmt::Display for Heuristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reason {
    pub heuristic: Heuristic,
    pub delta: f64,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub pid: Pid,
    pub name: String,
    pub score: f64,
    pub reasons: Vec<Reason>,
    pub computed_at: DateTime<Utc>,
}

impl ScoreRecord {
    pub fn has_reason(&self, heuristic: Heuristic) -> bool {
        self.reasons.iter().any(|r| r.heuristic == heuristic)
    }

    pub fn reason_ids(&self) -> Vec<&'static str> {
        self.reasons.iter().map(|r| r.heuristic.id()).collect()
    }
}

/// User-maintained list of processes that are never suspicious.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowList {
    /// Process names, compared case-insensitively.
    pub names: Vec<String>,
    /// Exact executable paths.
    pub paths: Vec<PathBuf>,
    pub pids: Vec<Pid>,
}

impl AllowList {
    pub fn contains(&self, snap: &ProcessSnapshot) -> bool {
        if self.pids.contains(&snap.pid) {
            return true;
        }
        if self.names.iter().any(|n| n.eq_ignore_ascii_case(&snap.name)) {
            return true;
        }
        snap.exe
            .as_deref()
            .is_some_and(|exe| self.paths.iter().any(|p| p == exe))
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.paths.is_empty() && self.pids.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ScoringEngine {
    config: ScoringConfig,
    allow_list: AllowList,
    markers: Vec<String>,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig, allow_list: AllowList) -> Self {
        let markers = config
            .suspicious_path_markers
            .iter()
            .map(|m| m.to_lowercase())
            .collect();
        Self {
            config,
            allow_list,
            markers,
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score every process of one cycle. Pure over its inputs.
    pub fn score(
        &self,
        snapshots: &[ProcessSnapshot],
        history: &ProcessHistory,
        now: DateTime<Utc>,
    ) -> Vec<ScoreRecord> {
        snapshots
            .iter()
            .map(|snap| self.score_one(snap, &history.for_process(snap), now))
            .collect()
    }

    /// `history` holds prior samples of this process instance, oldest first.
    pub fn score_one(
        &self,
        snap: &ProcessSnapshot,
        history: &[HistorySample],
        now: DateTime<Utc>,
    ) -> ScoreRecord {
        let reasons = if self.allow_list.contains(snap) {
            vec![Reason {
                heuristic: Heuristic::AllowListed,
                delta: 0.0,
                detail: format!("{} is on the allow-list", snap.name),
            }]
        } else {
            Heuristic::ORDER
                .iter()
                .filter(|h| !(h.needs_history() && history.is_empty()))
                .filter_map(|h| self.evaluate(*h, snap, history, now))
                .collect()
        };

        let score = if reasons
            .first()
            .is_some_and(|r| r.heuristic == Heuristic::AllowListed)
        {
            MIN_SCORE
        } else {
            clamp_score(reasons.iter().map(|r| r.delta).sum())
        };

        ScoreRecord {
            pid: snap.pid,
            name: snap.name.clone(),
            score,
            reasons,
            computed_at: now,
        }
    }

    fn evaluate(
        &self,
        heuristic: Heuristic,
        snap: &ProcessSnapshot,
        history: &[HistorySample],
        now: DateTime<Utc>,
    ) -> Option<Reason> {
        let cfg = &self.config;
        let (delta, detail) = match heuristic {
            Heuristic::UnsignedBinary => match snap.signature {
                SignatureStatus::Signed => return None,
                SignatureStatus::Unsigned => (cfg.unsigned_delta, "unsigned executable".to_string()),
                SignatureStatus::Unknown => {
                    (cfg.unsigned_delta, "executable signature unknown".to_string())
                }
            },
            Heuristic::SustainedCpu => {
                let floor = self.sustained_cpu(snap, history)?;
                let overshoot = f64::from(floor - cfg.sustained_cpu_percent);
                let delta = (overshoot * cfg.sustained_cpu_scale).min(cfg.sustained_cpu_cap);
                (
                    delta,
                    format!(
                        "CPU at or above {floor:.1}% for the last {} samples",
                        cfg.sustained_cpu_samples
                    ),
                )
            }
            Heuristic::RecentlySpawned => {
                let age = snap.age_secs(now)?;
                if age >= cfg.recent_age_secs || !self.elevated_use(snap) {
                    return None;
                }
                (
                    cfg.recent_delta,
                    format!("spawned {age}s ago with elevated resource use"),
                )
            }
            Heuristic::SuspiciousPath => {
                let exe = snap.exe.as_deref()?;
                let marker = self.suspicious_marker(exe)?;
                (
                    cfg.suspicious_path_delta,
                    format!("runs from {} (matched {marker})", exe.display()),
                )
            }
            Heuristic::MasqueradingName => {
                let exe = snap.exe.as_deref()?;
                let protected = cfg
                    .protected_names
                    .iter()
                    .any(|n| n.eq_ignore_ascii_case(&snap.name));
                if !protected || self.is_trusted_location(exe) {
                    return None;
                }
                (
                    cfg.masquerade_delta,
                    format!(
                        "system name {} outside trusted directories ({})",
                        snap.name,
                        exe.display()
                    ),
                )
            }
            Heuristic::BackgroundExfiltration => {
                let connections = snap.connections.filter(|c| *c > 0)?;
                if snap.window_visible != Some(false) || snap.signature.is_signed() {
                    return None;
                }
                (
                    cfg.exfiltration_delta,
                    format!("{connections} network connection(s) with no visible window"),
                )
            }
            Heuristic::HighMemory => {
                let rss = snap.memory_bytes.filter(|m| *m > cfg.high_memory_bytes)?;
                (
                    cfg.high_memory_delta,
                    format!("resident memory {:.0} MiB", rss as f64 / MIB),
                )
            }
            Heuristic::AllowListed => return None,
        };

        Some(Reason {
            heuristic,
            delta,
            detail,
        })
    }

    /// Lowest CPU across the current sample and the latest `K - 1` history
    /// samples, if all `K` are known and every one exceeds the high-water
    /// mark.
    fn sustained_cpu(&self, snap: &ProcessSnapshot, history: &[HistorySample]) -> Option<f32> {
        let high_water = self.config.sustained_cpu_percent;
        let needed = self.config.sustained_cpu_samples.saturating_sub(1);
        if history.len() < needed {
            return None;
        }
        let mut floor = snap.cpu_percent?;
        for sample in &history[history.len() - needed..] {
            floor = floor.min(sample.cpu_percent?);
        }
        (floor > high_water).then_some(floor)
    }

    fn elevated_use(&self, snap: &ProcessSnapshot) -> bool {
        let cfg = &self.config;
        snap.cpu_percent
            .is_some_and(|c| c >= cfg.recent_cpu_percent)
            || snap
                .memory_bytes
                .is_some_and(|m| m >= cfg.recent_memory_bytes)
            || snap.connections.is_some_and(|c| c > 0)
    }

    fn suspicious_marker(&self, exe: &Path) -> Option<&str> {
        let lowered = exe.to_string_lossy().to_lowercase();
        self.markers
            .iter()
            .find(|m| lowered.contains(m.as_str()))
            .map(String::as_str)
    }

    fn is_trusted_location(&self, exe: &Path) -> bool {
        self.config
            .trusted_prefixes
            .iter()
            .any(|prefix| exe.starts_with(prefix))
    }
}

pub fn clamp_score(raw: f64) -> f64 {
    if raw.is_nan() {
        return MIN_SCORE;
    }
    raw.clamp(MIN_SCORE, MAX_SCORE)
}
