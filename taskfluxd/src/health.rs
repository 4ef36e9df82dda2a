use crate::classifier::{Tier, TierThresholds};
use crate::config::HealthConfig;
use crate::scoring::ScoreRecord;
use crate::types::{Pid, SystemSnapshot};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Normal,
    Watch,
    Risky,
    Critical,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            HealthStatus::Healthy
        } else if score >= 60.0 {
            HealthStatus::Normal
        } else if score >= 40.0 {
            HealthStatus::Watch
        } else if score >= 20.0 {
            HealthStatus::Risky
        } else {
            HealthStatus::Critical
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Cpu,
    Memory,
    Gpu,
    Temperature,
    Process,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub tier: Tier,
    /// Suspicion score for processes, the measured value for resources.
    pub score: f64,
    pub pid: Option<Pid>,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthComponents {
    /// 100 minus resource pressure.
    pub resource: f64,
    /// 100 minus the threat penalty.
    pub threat: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
    pub score: f64,
    pub status: HealthStatus,
    pub components: HealthComponents,
    pub pressure: f64,
    pub penalty: f64,
    pub top_issues: Vec<Issue>,
}

impl HealthScore {
    pub fn perfect() -> Self {
        Self {
            score: 100.0,
            status: HealthStatus::Healthy,
            components: HealthComponents {
                resource: 100.0,
                threat: 100.0,
            },
            pressure: 0.0,
            penalty: 0.0,
            top_issues: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthAggregator {
    config: HealthConfig,
    thresholds: TierThresholds,
}

impl HealthAggregator {
    pub fn new(config: HealthConfig, thresholds: TierThresholds) -> Self {
        Self { config, thresholds }
    }

    pub fn aggregate(&self, system: &SystemSnapshot, records: &[ScoreRecord]) -> HealthScore {
        let pressure = self.pressure(system);
        let penalty = self.penalty(records);
        let components = HealthComponents {
            resource: 100.0 - pressure,
            threat: 100.0 - penalty,
        };
        let total_weight = self.config.resource_weight + self.config.threat_weight;
        let blended = (self.config.resource_weight * components.resource
            + self.config.threat_weight * components.threat)
            / total_weight;
        let score = clamp_pct(blended);

        let mut top_issues = self.resource_issues(system);
        top_issues.extend(records.iter().filter_map(|r| {
            let tier = self.thresholds.classify(r.score);
            (tier >= Tier::High).then(|| Issue {
                kind: IssueKind::Process,
                tier,
                score: r.score,
                pid: Some(r.pid),
                summary: format!("{} (PID {}) is {}", r.name, r.pid, tier),
            })
        }));
        top_issues.sort_by(rank);
        top_issues.truncate(self.config.top_issues);

        HealthScore {
            score,
            status: HealthStatus::from_score(score),
            components,
            pressure,
            penalty,
            top_issues,
        }
    }

    /// Weighted CPU, RAM and over-temperature fraction, 0-100.
    pub fn pressure(&self, system: &SystemSnapshot) -> f64 {
        let cfg = &self.config;
        let cpu = clamp_pct(f64::from(system.cpu_percent));
        let ram = clamp_pct(f64::from(system.mem_percent()));
        let temp = 100.0 * self.temperature_fraction(system);
        let weight = cfg.cpu_weight + cfg.ram_weight + cfg.temperature_weight;
        if weight <= 0.0 {
            return 0.0;
        }
        clamp_pct((cfg.cpu_weight * cpu + cfg.ram_weight * ram + cfg.temperature_weight * temp) / weight)
    }

    fn temperature_fraction(&self, system: &SystemSnapshot) -> f64 {
        let Some(hottest) = system.max_temperature() else {
            return 0.0;
        };
        let span = f64::from(self.config.temperature_critical_c - self.config.temperature_threshold_c);
        (f64::from(hottest - self.config.temperature_threshold_c) / span).clamp(0.0, 1.0)
    }

    /// Sum of per-process tier penalties, capped at 100.
    pub fn penalty(&self, records: &[ScoreRecord]) -> f64 {
        let cfg = &self.config;
        let total: f64 = records
            .iter()
            .map(|r| match self.thresholds.classify(r.score) {
                Tier::Healthy => 0.0,
                Tier::Low => cfg.low_penalty,
                Tier::Medium => cfg.medium_penalty,
                Tier::High => cfg.high_penalty,
                Tier::Dangerous => cfg.dangerous_penalty,
            })
            .sum();
        total.min(100.0)
    }

    fn resource_issues(&self, system: &SystemSnapshot) -> Vec<Issue> {
        let cfg = &self.config;
        let mut issues = Vec::new();

        let usage = [
            (IssueKind::Cpu, "CPU", system.cpu_percent),
            (IssueKind::Memory, "RAM", system.mem_percent()),
        ];
        for (kind, label, value) in usage {
            let tier = if value > cfg.high_percent {
                Tier::High
            } else if value > cfg.elevated_percent {
                Tier::Medium
            } else {
                continue;
            };
            issues.push(Issue {
                kind,
                tier,
                score: f64::from(value),
                pid: None,
                summary: format!("{label} usage at {value:.0}%"),
            });
        }

        if let Some(gpu) = &system.gpu
            && gpu.load_percent > cfg.gpu_high_percent
        {
            issues.push(Issue {
                kind: IssueKind::Gpu,
                tier: Tier::Medium,
                score: f64::from(gpu.load_percent),
                pid: None,
                summary: format!("GPU {} load at {:.0}%", gpu.name, gpu.load_percent),
            });
        }

        if let Some(hottest) = system.max_temperature()
            && hottest > cfg.temperature_threshold_c
        {
            let tier = if hottest >= cfg.temperature_critical_c {
                Tier::Dangerous
            } else {
                Tier::High
            };
            issues.push(Issue {
                kind: IssueKind::Temperature,
                tier,
                score: f64::from(hottest),
                pid: None,
                summary: format!("temperature at {hottest:.0}°C"),
            });
        }

        issues
    }
}

/// Tier first, score second, then PID. Resource issues (no PID) sort ahead
/// of processes on a full tie.
fn rank(a: &Issue, b: &Issue) -> Ordering {
    b.tier
        .cmp(&a.tier)
        .then_with(|| b.score.total_cmp(&a.score))
        .then_with(|| a.pid.cmp(&b.pid))
}

fn clamp_pct(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}
