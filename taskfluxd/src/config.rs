use crate::classifier::TierThresholds;
use crate::error::ConfigError;
use crate::scoring::AllowList;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/taskflux/taskflux.toml";
pub const CONFIG_ENV: &str = "TASKFLUX_CONFIG";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub scoring: ScoringConfig,
    pub thresholds: TierThresholds,
    pub health: HealthConfig,
    pub allow_list: AllowList,
    pub bus: BusConfig,
    pub actions: ActionConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from `path`, else `$TASKFLUX_CONFIG`, else the system default.
    /// A missing file yields the defaults; an unreadable or invalid one is
    /// an error.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                info!("[config] loaded {}", path.display());
                Self::from_toml(&text)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("[config] {} not found; using defaults", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(ConfigError::Io {
                path: path.display().to_string(),
                message: err.to_string(),
            }),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.runtime.validate()?;
        self.scoring.validate()?;
        self.thresholds.validate()?;
        self.health.validate()?;
        if self.bus.max_entries == 0 {
            return Err(ConfigError::Invalid("bus.max_entries must be > 0".into()));
        }
        if self.bus.threat_capacity == 0 {
            return Err(ConfigError::Invalid(
                "bus.threat_capacity must be > 0".into(),
            ));
        }
        if self.actions.poll_ms == 0 {
            return Err(ConfigError::Invalid("actions.poll_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Settings owned by the surrounding application. The pipeline reads one
/// copy at the start of every cycle and never writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub refresh_interval_ms: u64,
    pub show_system_processes: bool,
    pub auto_sort: bool,
    /// Read for completeness; the core has no splash screen.
    pub splash_enabled: bool,
    /// Consecutive whole-cycle sampling failures before the pipeline stops.
    pub max_consecutive_failures: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 1500,
            show_system_processes: false,
            auto_sort: true,
            splash_enabled: true,
            max_consecutive_failures: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "runtime.refresh_interval_ms must be > 0".into(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(
                "runtime.max_consecutive_failures must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Heuristic weights and thresholds of the suspicion score. These are
/// product-tuning values; the defaults are a starting point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub unsigned_delta: f64,

    pub sustained_cpu_percent: f32,
    pub sustained_cpu_samples: usize,
    pub sustained_cpu_scale: f64,
    pub sustained_cpu_cap: f64,

    pub recent_age_secs: u64,
    pub recent_cpu_percent: f32,
    pub recent_memory_bytes: u64,
    pub recent_delta: f64,

    pub suspicious_path_markers: Vec<String>,
    pub suspicious_path_delta: f64,

    pub protected_names: Vec<String>,
    pub trusted_prefixes: Vec<PathBuf>,
    pub masquerade_delta: f64,

    pub exfiltration_delta: f64,

    pub high_memory_bytes: u64,
    pub high_memory_delta: f64,

    /// Samples kept per PID for trend heuristics.
    pub history_len: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            unsigned_delta: 15.0,
            sustained_cpu_percent: 50.0,
            sustained_cpu_samples: 3,
            sustained_cpu_scale: 0.5,
            sustained_cpu_cap: 25.0,
            recent_age_secs: 60,
            recent_cpu_percent: 10.0,
            recent_memory_bytes: 200 * MIB,
            recent_delta: 20.0,
            suspicious_path_markers: [
                "/tmp/",
                "/var/tmp/",
                "/dev/shm/",
                "/downloads/",
                "\\temp\\",
                "\\downloads\\",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            suspicious_path_delta: 25.0,
            protected_names: [
                "systemd",
                "init",
                "sshd",
                "cron",
                "dbus-daemon",
                "svchost.exe",
                "lsass.exe",
                "csrss.exe",
                "explorer.exe",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            trusted_prefixes: [
                "/usr/bin",
                "/usr/sbin",
                "/usr/lib",
                "/usr/libexec",
                "/bin",
                "/sbin",
                "/lib",
            ]
            .into_iter()
            .map(PathBuf::from)
            .collect(),
            masquerade_delta: 40.0,
            exfiltration_delta: 40.0,
            high_memory_bytes: 500 * MIB,
            high_memory_delta: 10.0,
            history_len: 8,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let deltas = [
            ("unsigned_delta", self.unsigned_delta),
            ("sustained_cpu_scale", self.sustained_cpu_scale),
            ("sustained_cpu_cap", self.sustained_cpu_cap),
            ("recent_delta", self.recent_delta),
            ("suspicious_path_delta", self.suspicious_path_delta),
            ("masquerade_delta", self.masquerade_delta),
            ("exfiltration_delta", self.exfiltration_delta),
            ("high_memory_delta", self.high_memory_delta),
        ];
        for (name, value) in deltas {
            if !value.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "scoring.{name} must be finite"
                )));
            }
        }
        if self.sustained_cpu_samples == 0 {
            return Err(ConfigError::Invalid(
                "scoring.sustained_cpu_samples must be > 0".into(),
            ));
        }
        if self.history_len < self.sustained_cpu_samples {
            return Err(ConfigError::Invalid(
                "scoring.history_len must cover sustained_cpu_samples".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub resource_weight: f64,
    pub threat_weight: f64,
    pub cpu_weight: f64,
    pub ram_weight: f64,
    pub temperature_weight: f64,
    pub temperature_threshold_c: f32,
    pub temperature_critical_c: f32,
    pub elevated_percent: f32,
    pub high_percent: f32,
    pub gpu_high_percent: f32,
    pub low_penalty: f64,
    pub medium_penalty: f64,
    pub high_penalty: f64,
    pub dangerous_penalty: f64,
    pub top_issues: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            resource_weight: 0.5,
            threat_weight: 0.5,
            cpu_weight: 0.4,
            ram_weight: 0.4,
            temperature_weight: 0.2,
            temperature_threshold_c: 80.0,
            temperature_critical_c: 100.0,
            elevated_percent: 75.0,
            high_percent: 90.0,
            gpu_high_percent: 90.0,
            low_penalty: 2.0,
            medium_penalty: 8.0,
            high_penalty: 20.0,
            dangerous_penalty: 40.0,
            top_issues: 5,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = [
            self.resource_weight,
            self.threat_weight,
            self.cpu_weight,
            self.ram_weight,
            self.temperature_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Invalid(
                "health weights must be finite and non-negative".into(),
            ));
        }
        if self.resource_weight + self.threat_weight <= 0.0 {
            return Err(ConfigError::Invalid(
                "health.resource_weight + health.threat_weight must be > 0".into(),
            ));
        }
        if self.temperature_critical_c <= self.temperature_threshold_c {
            return Err(ConfigError::Invalid(
                "health.temperature_critical_c must exceed temperature_threshold_c".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub max_entries: usize,
    /// Entries older than this are dropped; `0` keeps them until the count
    /// ceiling evicts them.
    pub max_age_secs: u64,
    pub journal_path: Option<PathBuf>,
    pub threat_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_entries: 5_000,
            max_age_secs: 24 * 60 * 60,
            journal_path: None,
            threat_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    pub graceful_wait_ms: u64,
    pub forceful_wait_ms: u64,
    pub poll_ms: u64,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            graceful_wait_ms: 3_000,
            forceful_wait_ms: 2_000,
            poll_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Shared holder of the live [`RuntimeConfig`].
///
/// `apply` validates first; a rejected update leaves the previous settings
/// active.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    inner: Arc<RwLock<RuntimeConfig>>,
}

impl SettingsStore {
    pub fn new(initial: RuntimeConfig) -> Result<Self, ConfigError> {
        initial.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(initial)),
        })
    }

    pub fn snapshot(&self) -> RuntimeConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn apply(&self, update: RuntimeConfig) -> Result<(), ConfigError> {
        if let Err(err) = update.validate() {
            warn!("[config] rejected settings update: {err}");
            return Err(err);
        }
        let mut current = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *current = update;
        info!(
            "[config] settings applied: refresh_interval_ms={} show_system_processes={} auto_sort={}",
            current.refresh_interval_ms, current.show_system_processes, current.auto_sort
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [runtime]
            refresh_interval_ms = 2000
            show_system_processes = true

            [thresholds]
            low = 5.0
            medium = 25.0
            high = 50.0
            dangerous = 75.0

            [allow_list]
            names = ["backup-agent"]
            "#,
        )
        .unwrap();

        assert_eq!(config.runtime.refresh_interval_ms, 2000);
        assert!(config.runtime.show_system_processes);
        assert!(config.runtime.auto_sort);
        assert_eq!(config.thresholds.high, 50.0);
        assert_eq!(config.allow_list.names, vec!["backup-agent".to_string()]);
        assert_eq!(config.scoring, ScoringConfig::default());
    }

    #[test]
    fn zero_refresh_interval_is_rejected() {
        let err = Config::from_toml("[runtime]\nrefresh_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = Config::from_toml("[runtime\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_from_reads_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[api]\nlisten = \"0.0.0.0:9000\"\n").unwrap();
        let config = Config::load_from(Some(file.path())).unwrap();
        assert_eq!(config.api.listen, "0.0.0.0:9000");
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let config = Config::from_toml(include_str!("../../configs/taskflux.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn settings_store_keeps_prior_value_on_rejection() {
        let store = SettingsStore::new(RuntimeConfig::default()).unwrap();
        let bad = RuntimeConfig {
            refresh_interval_ms: 0,
            ..RuntimeConfig::default()
        };
        assert!(store.apply(bad).is_err());
        assert_eq!(store.snapshot().refresh_interval_ms, 1500);

        let good = RuntimeConfig {
            refresh_interval_ms: 1000,
            auto_sort: false,
            ..RuntimeConfig::default()
        };
        store.apply(good).unwrap();
        let current = store.snapshot();
        assert_eq!(current.refresh_interval_ms, 1000);
        assert!(!current.auto_sort);
    }
}
