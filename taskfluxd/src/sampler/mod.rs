//! Snapshot capture.
//!
//! A [`ProcessSource`] performs the raw OS reads; the [`Sampler`] turns them
//! into one cycle's immutable snapshots: sentinel PIDs removed, cumulative
//! I/O counters turned into rates.

use crate::error::SampleError;
use crate::types::{
    GpuSnapshot, KERNEL_PID, ProcessSnapshot, SensorReading, SystemSnapshot, is_sentinel,
};
use chrono::{DateTime, Utc};
use log::debug;
use std::time::Instant;

pub mod signature;
pub mod source;

pub use signature::SignaturePolicy;
pub use source::SysinfoSource;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Kernel threads hang off the kernel PID on Linux.
const EXCLUDE_KERNEL_CHILDREN: bool = cfg!(target_os = "linux");

/// System-wide readings with I/O as cumulative byte counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSystem {
    pub cpu_percent: f32,
    pub per_core: Vec<f32>,
    pub mem_used_bytes: u64,
    pub mem_total_bytes: u64,
    pub gpu: Option<GpuSnapshot>,
    pub disk_read_bytes: Option<u64>,
    pub disk_written_bytes: Option<u64>,
    pub net_received_bytes: Option<u64>,
    pub net_transmitted_bytes: Option<u64>,
    pub temperatures: Vec<SensorReading>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSample {
    pub processes: Vec<ProcessSnapshot>,
    pub system: RawSystem,
}

/// One OS query per cycle.
///
/// A process that vanishes mid-enumeration is simply left out. Unreadable
/// per-process fields are `None`. Only a failure of the whole query is an
/// error.
pub trait ProcessSource: Send {
    fn collect(&mut self) -> Result<RawSample, SampleError>;
}

impl<T: ProcessSource + ?Sized> ProcessSource for Box<T> {
    fn collect(&mut self) -> Result<RawSample, SampleError> {
        (**self).collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    at: Instant,
    disk_read: Option<u64>,
    disk_written: Option<u64>,
    net_received: Option<u64>,
    net_transmitted: Option<u64>,
}

pub struct Sampler<S> {
    source: S,
    previous: Option<Counters>,
}

impl<S: ProcessSource> Sampler<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            previous: None,
        }
    }

    pub fn sample(&mut self) -> Result<(Vec<ProcessSnapshot>, SystemSnapshot), SampleError> {
        self.sample_at(Instant::now(), Utc::now())
    }

    /// Like [`Sampler::sample`] with explicit clocks: `at` for rate
    /// computation, `timestamp` stamped on the system snapshot.
    pub fn sample_at(
        &mut self,
        at: Instant,
        timestamp: DateTime<Utc>,
    ) -> Result<(Vec<ProcessSnapshot>, SystemSnapshot), SampleError> {
        let raw = self.source.collect()?;

        let total = raw.processes.len();
        let mut processes: Vec<ProcessSnapshot> = raw
            .processes
            .into_iter()
            .filter(|p| !is_sentinel(p.pid))
            .filter(|p| !(EXCLUDE_KERNEL_CHILDREN && p.ppid == Some(KERNEL_PID)))
            .collect();
        processes.sort_by_key(|p| p.pid);
        processes.dedup_by_key(|p| p.pid);
        if processes.len() != total {
            debug!(
                "[sampler] excluded {} sentinel/kernel entries",
                total - processes.len()
            );
        }
        let partial = processes.iter().filter(|p| p.unknown_fields() > 0).count();
        if partial > 0 {
            debug!("[sampler] {partial} processes with unreadable fields");
        }

        let current = Counters {
            at,
            disk_read: raw.system.disk_read_bytes,
            disk_written: raw.system.disk_written_bytes,
            net_received: raw.system.net_received_bytes,
            net_transmitted: raw.system.net_transmitted_bytes,
        };
        let prev = self.previous.replace(current);
        let rate = |pick: fn(&Counters) -> Option<u64>| -> Option<f64> {
            let prev = prev.as_ref()?;
            let elapsed = current.at.checked_duration_since(prev.at)?.as_secs_f64();
            if elapsed <= 0.0 {
                return None;
            }
            let delta = pick(&current)?.saturating_sub(pick(prev)?);
            Some(delta as f64 / BYTES_PER_MB / elapsed)
        };

        let system = SystemSnapshot {
            timestamp,
            cpu_percent: raw.system.cpu_percent,
            per_core: raw.system.per_core,
            mem_used_bytes: raw.system.mem_used_bytes,
            mem_total_bytes: raw.system.mem_total_bytes,
            gpu: raw.system.gpu,
            disk_read_mb_s: rate(|c| c.disk_read),
            disk_write_mb_s: rate(|c| c.disk_written),
            net_up_mb_s: rate(|c| c.net_transmitted),
            net_down_mb_s: rate(|c| c.net_received),
            temperatures: raw.system.temperatures,
        };

        Ok((processes, system))
    }
}
