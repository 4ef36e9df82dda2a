use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub type Pid = u32;

/// Placeholder PID the OS uses for its idle/swapper task.
pub const IDLE_PID: Pid = 0;

/// PID of the kernel's own process (kthreadd on Linux, "System" on Windows).
#[cfg(target_os = "windows")]
pub const KERNEL_PID: Pid = 4;
#[cfg(not(target_os = "windows"))]
pub const KERNEL_PID: Pid = 2;

/// Sentinel PIDs that never appear in a published process list.
pub const SENTINEL_PIDS: [Pid; 2] = [IDLE_PID, KERNEL_PID];

pub fn is_sentinel(pid: Pid) -> bool {
    SENTINEL_PIDS.contains(&pid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureStatus {
    Signed,
    Unsigned,
    Unknown,
}

impl SignatureStatus {
    pub fn is_signed(self) -> bool {
        matches!(self, Self::Signed)
    }
}

/// One process as observed in a single sampling cycle.
///
/// `None` marks a field the sampler could not read (permission denied,
/// not supported on this host). It is never a stand-in for zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub pid: Pid,
    pub ppid: Option<Pid>,
    pub name: String,
    pub exe: Option<PathBuf>,
    pub user: Option<String>,
    /// Owned by a system account (root or a service uid).
    pub system: bool,
    /// Creation time, seconds since the Unix epoch.
    pub start_time: Option<u64>,
    /// CPU usage normalised to the number of cores (0-100).
    pub cpu_percent: Option<f32>,
    pub memory_bytes: Option<u64>,
    pub threads: Option<u32>,
    /// Open handles (file descriptors on Unix).
    pub handles: Option<u32>,
    pub connections: Option<u32>,
    pub signature: SignatureStatus,
    pub window_visible: Option<bool>,
}

impl ProcessSnapshot {
    /// A snapshot with every optional field unknown.
    pub fn new(pid: Pid, name: impl Into<String>) -> Self {
        Self {
            pid,
            ppid: None,
            name: name.into(),
            exe: None,
            user: None,
            system: false,
            start_time: None,
            cpu_percent: None,
            memory_bytes: None,
            threads: None,
            handles: None,
            connections: None,
            signature: SignatureStatus::Unknown,
            window_visible: None,
        }
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        let start = self.start_time?;
        let now = u64::try_from(now.timestamp()).ok()?;
        Some(now.saturating_sub(start))
    }

    pub fn unknown_fields(&self) -> usize {
        [
            self.ppid.is_none(),
            self.exe.is_none(),
            self.user.is_none(),
            self.start_time.is_none(),
            self.cpu_percent.is_none(),
            self.memory_bytes.is_none(),
            self.threads.is_none(),
            self.handles.is_none(),
            self.connections.is_none(),
            self.signature == SignatureStatus::Unknown,
            self.window_visible.is_none(),
        ]
        .into_iter()
        .filter(|missing| *missing)
        .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSnapshot {
    pub name: String,
    pub load_percent: f32,
    pub vram_used_mb: u64,
    pub vram_total_mb: u64,
    pub temperature_c: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub label: String,
    pub celsius: f32,
}

/// System-wide resource usage for one sampling cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub per_core: Vec<f32>,
    pub mem_used_bytes: u64,
    pub mem_total_bytes: u64,
    pub gpu: Option<GpuSnapshot>,
    // Rates need two samples, so they are unknown on the first cycle.
    pub disk_read_mb_s: Option<f64>,
    pub disk_write_mb_s: Option<f64>,
    pub net_up_mb_s: Option<f64>,
    pub net_down_mb_s: Option<f64>,
    pub temperatures: Vec<SensorReading>,
}

impl SystemSnapshot {
    pub fn mem_percent(&self) -> f32 {
        if self.mem_total_bytes == 0 {
            return 0.0;
        }
        (self.mem_used_bytes as f64 / self.mem_total_bytes as f64 * 100.0) as f32
    }

    /// Hottest reading across sensors and the GPU.
    pub fn max_temperature(&self) -> Option<f32> {
        self.temperatures
            .iter()
            .map(|t| t.celsius)
            .chain(self.gpu.as_ref().and_then(|g| g.temperature_c))
            .fold(None, |acc: Option<f32>, t| Some(acc.map_or(t, |a| a.max(t))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sentinels_cover_idle_and_kernel() {
        assert!(is_sentinel(0));
        assert!(is_sentinel(KERNEL_PID));
        assert!(!is_sentinel(1));
    }

    #[test]
    fn age_uses_start_time() {
        let mut snap = ProcessSnapshot::new(10, "sh");
        let now = Utc.timestamp_opt(1_000, 0).unwrap();
        assert_eq!(snap.age_secs(now), None);
        snap.start_time = Some(995);
        assert_eq!(snap.age_secs(now), Some(5));
        snap.start_time = Some(2_000);
        assert_eq!(snap.age_secs(now), Some(0));
    }

    #[test]
    fn unknown_fields_are_counted() {
        let mut snap = ProcessSnapshot::new(10, "sh");
        assert_eq!(snap.unknown_fields(), 11);
        snap.cpu_percent = Some(0.0);
        snap.signature = SignatureStatus::Unsigned;
        assert_eq!(snap.unknown_fields(), 9);
    }

    #[test]
    fn max_temperature_includes_gpu() {
        let snap = SystemSnapshot {
            temperatures: vec![SensorReading {
                label: "cpu".into(),
                celsius: 61.0,
            }],
            gpu: Some(GpuSnapshot {
                name: "gpu0".into(),
                load_percent: 10.0,
                vram_used_mb: 1,
                vram_total_mb: 2,
                temperature_c: Some(72.5),
            }),
            ..SystemSnapshot::default()
        };
        assert_eq!(snap.max_temperature(), Some(72.5));
        assert_eq!(SystemSnapshot::default().max_temperature(), None);
    }

    #[test]
    fn mem_percent_handles_zero_total() {
        let snap = SystemSnapshot {
            mem_used_bytes: 512,
            mem_total_bytes: 2048,
            ..SystemSnapshot::default()
        };
        assert_eq!(snap.mem_percent(), 25.0);
        assert_eq!(SystemSnapshot::default().mem_percent(), 0.0);
    }
}
