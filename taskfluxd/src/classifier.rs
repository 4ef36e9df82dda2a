use crate::error::ConfigError;
use crate::scoring::{MAX_SCORE, MIN_SCORE, ScoreRecord};
use crate::types::Pid;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Healthy,
    Low,
    Medium,
    High,
    Dangerous,
}

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::Healthy,
        Tier::Low,
        Tier::Medium,
        Tier::High,
        Tier::Dangerous,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Tier::Healthy => "healthy",
            Tier::Low => "low",
            Tier::Medium => "medium",
            Tier::High => "high",
            Tier::Dangerous => "dangerous",
        }
    }

    pub fn is_elevated(self) -> bool {
        self > Tier::Healthy
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tier::ALL
            .into_iter()
            .find(|t| t.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown tier '{s}'"))
    }
}

/// Lower bounds of each elevated tier. Must be strictly increasing inside
/// the score range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub dangerous: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            low: 10.0,
            medium: 30.0,
            high: 60.0,
            dangerous: 85.0,
        }
    }
}

impl TierThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bounds = [self.low, self.medium, self.high, self.dangerous];
        if bounds.iter().any(|b| !b.is_finite()) {
            return Err(ConfigError::Invalid("tier thresholds must be finite".into()));
        }
        if self.low <= MIN_SCORE || self.dangerous > MAX_SCORE {
            return Err(ConfigError::Invalid(format!(
                "tier thresholds must lie in ({MIN_SCORE}, {MAX_SCORE}]"
            )));
        }
        if !bounds.windows(2).all(|w| w[0] < w[1]) {
            return Err(ConfigError::Invalid(
                "tier thresholds must be strictly increasing".into(),
            ));
        }
        Ok(())
    }

    pub fn classify(&self, score: f64) -> Tier {
        if score >= self.dangerous {
            Tier::Dangerous
        } else if score >= self.high {
            Tier::High
        } else if score >= self.medium {
            Tier::Medium
        } else if score >= self.low {
            Tier::Low
        } else {
            Tier::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatEvent {
    /// `None` for system-level events.
    pub pid: Option<Pid>,
    pub name: String,
    pub previous: Tier,
    pub tier: Tier,
    pub record: Option<ScoreRecord>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Debounces tier changes per PID.
///
/// The map holds only PIDs present in the latest cycle, so it never grows
/// past the live process count.
#[derive(Debug)]
pub struct ThreatClassifier {
    thresholds: TierThresholds,
    last_emitted: HashMap<Pid, Tier>,
}

impl ThreatClassifier {
    pub fn new(thresholds: TierThresholds) -> Self {
        Self {
            thresholds,
            last_emitted: HashMap::new(),
        }
    }

    pub fn tier_of(&self, pid: Pid) -> Tier {
        self.last_emitted.get(&pid).copied().unwrap_or_default()
    }

    /// Classify one cycle's records, returning events for PIDs whose tier
    /// changed since the last event emitted for them.
    /// Reset a PID whose process exited or was replaced, so the next
    /// process to hold it starts from `Healthy`.
    pub fn forget(&mut self, pid: Pid) {
        self.last_emitted.remove(&pid);
    }

    pub fn observe(&mut self, records: &[ScoreRecord], now: DateTime<Utc>) -> Vec<ThreatEvent> {
        let live: HashSet<Pid> = records.iter().map(|r| r.pid).collect();
        self.last_emitted.retain(|pid, _| live.contains(pid));

        let mut events = Vec::new();
        for record in records {
            let tier = self.thresholds.classify(record.score);
            let previous = self.last_emitted.entry(record.pid).or_default();
            if *previous == tier {
                continue;
            }
            let from = *previous;
            *previous = tier;
            debug!(
                "[classifier] pid {} {} -> {} (score {:.1})",
                record.pid, from, tier, record.score
            );
            events.push(ThreatEvent {
                pid: Some(record.pid),
                name: record.name.clone(),
                previous: from,
                tier,
                record: Some(record.clone()),
                reason: describe(record, from, tier),
                timestamp: now,
            });
        }
        events
    }
}

fn describe(record: &ScoreRecord, from: Tier, to: Tier) -> String {
    let reasons = if record.reasons.is_empty() {
        "no active heuristics".to_string()
    } else {
        record
            .reasons
            .iter()
            .map(|r| r.heuristic.id())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "{} (PID {}) {} -> {} at score {:.0}: {}",
        record.name, record.pid, from, to, record.score, reasons
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(pid: Pid, score: f64) -> ScoreRecord {
        ScoreRecord {
            pid,
            name: format!("proc-{pid}"),
            score,
            reasons: Vec::new(),
            computed_at: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    fn threshold_sets() -> Vec<TierThresholds> {
        vec![
            TierThresholds::default(),
            TierThresholds {
                low: 5.0,
                medium: 20.0,
                high: 40.0,
                dangerous: 70.0,
            },
            TierThresholds {
                low: 25.0,
                medium: 50.0,
                high: 75.0,
                dangerous: 95.0,
            },
        ]
    }

    #[test]
    fn classify_is_monotonic() {
        for thresholds in threshold_sets() {
            thresholds.validate().unwrap();
            let mut last = Tier::Healthy;
            for step in 0..=1000 {
                let tier = thresholds.classify(step as f64 / 10.0);
                assert!(tier >= last);
                last = tier;
            }
            assert_eq!(thresholds.classify(0.0), Tier::Healthy);
            assert_eq!(thresholds.classify(thresholds.low), Tier::Low);
            assert_eq!(thresholds.classify(thresholds.medium), Tier::Medium);
            assert_eq!(thresholds.classify(thresholds.high), Tier::High);
            assert_eq!(thresholds.classify(thresholds.dangerous), Tier::Dangerous);
            assert_eq!(thresholds.classify(100.0), Tier::Dangerous);
        }
    }

    #[test]
    fn repeated_score_emits_once() {
        for thresholds in threshold_sets() {
            let mut classifier = ThreatClassifier::new(thresholds);
            let score = thresholds.high;
            let first = classifier.observe(&[record(9, score)], Utc::now());
            let second = classifier.observe(&[record(9, score)], Utc::now());
            assert_eq!(first.len() + second.len(), 1);
            assert_eq!(first[0].previous, Tier::Healthy);
            assert_eq!(first[0].tier, Tier::High);
        }
    }

    #[test]
    fn healthy_first_sight_is_silent() {
        let mut classifier = ThreatClassifier::new(TierThresholds::default());
        assert!(classifier.observe(&[record(3, 0.0)], Utc::now()).is_empty());
        assert_eq!(classifier.tier_of(3), Tier::Healthy);
    }

    #[test]
    fn consecutive_events_never_share_a_tier() {
        for thresholds in threshold_sets() {
            let mut classifier = ThreatClassifier::new(thresholds);
            let scores = [0.0, 90.0, 99.0, 50.0, 50.0, 5.0, 0.0, 100.0, 100.0];
            let mut tiers = Vec::new();
            for score in scores {
                for event in classifier.observe(&[record(1, score)], Utc::now()) {
                    tiers.push(event.tier);
                }
            }
            assert!(!tiers.is_empty());
            assert!(tiers.windows(2).all(|w| w[0] != w[1]), "{tiers:?}");
        }
    }

    #[test]
    fn exited_pid_is_forgotten() {
        let mut classifier = ThreatClassifier::new(TierThresholds::default());
        classifier.observe(&[record(4, 90.0)], Utc::now());
        classifier.observe(&[], Utc::now());
        assert_eq!(classifier.tier_of(4), Tier::Healthy);
        let again = classifier.observe(&[record(4, 90.0)], Utc::now());
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].previous, Tier::Healthy);
    }

    #[test]
    fn replaced_pid_starts_healthy() {
        let mut classifier = ThreatClassifier::new(TierThresholds::default());
        classifier.observe(&[record(4, 90.0)], Utc::now());
        classifier.forget(4);
        let again = classifier.observe(&[record(4, 90.0)], Utc::now());
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].previous, Tier::Healthy);
    }

    #[test]
    fn invalid_thresholds_are_rejected() {
        let overlapping = TierThresholds {
            low: 10.0,
            medium: 10.0,
            ..TierThresholds::default()
        };
        assert!(overlapping.validate().is_err());
        let out_of_range = TierThresholds {
            dangerous: 150.0,
            ..TierThresholds::default()
        };
        assert!(out_of_range.validate().is_err());
    }

    #[test]
    fn tier_parses_labels() {
        assert_eq!("HIGH".parse::<Tier>().unwrap(), Tier::High);
        assert!("severe".parse::<Tier>().is_err());
        assert!(Tier::Dangerous > Tier::High);
    }
}
