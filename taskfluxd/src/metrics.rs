use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, readable from any task without locking the
/// pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
    ticks_skipped: AtomicU64,
    last_cycle_ms: AtomicU64,
    processes_seen: AtomicU64,
    threat_events: AtomicU64,
    log_entries: AtomicU64,
    actions_succeeded: AtomicU64,
    actions_failed: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub ticks_skipped: u64,
    pub last_cycle_ms: u64,
    pub processes_seen: u64,
    pub threat_events: u64,
    pub log_entries: u64,
    pub actions_succeeded: u64,
    pub actions_failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self, elapsed_ms: u64, processes: usize) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_ms.store(elapsed_ms, Ordering::Relaxed);
        self.processes_seen
            .store(processes as u64, Ordering::Relaxed);
    }

    pub fn inc_cycles_failed(&self) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_ticks_skipped(&self, n: u64) {
        if n > 0 {
            self.ticks_skipped.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn add_threat_events(&self, n: usize) {
        self.threat_events.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_log_entries(&self) {
        self.log_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_actions(&self, ok: bool) {
        if ok {
            self.actions_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.actions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_last_error(&self, error: Option<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = error;
        }
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            last_cycle_ms: self.last_cycle_ms.load(Ordering::Relaxed),
            processes_seen: self.processes_seen.load(Ordering::Relaxed),
            threat_events: self.threat_events.load(Ordering::Relaxed),
            log_entries: self.log_entries.load(Ordering::Relaxed),
            actions_succeeded: self.actions_succeeded.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = Metrics::new();
        metrics.record_cycle(12, 40);
        metrics.record_cycle(8, 42);
        metrics.inc_cycles_failed();
        metrics.add_ticks_skipped(0);
        metrics.add_ticks_skipped(3);
        metrics.inc_actions(true);
        metrics.inc_actions(false);
        metrics.set_last_error(Some("boom".into()));

        let snap = metrics.snapshot();
        assert_eq!(snap.cycles_completed, 2);
        assert_eq!(snap.cycles_failed, 1);
        assert_eq!(snap.ticks_skipped, 3);
        assert_eq!(snap.last_cycle_ms, 8);
        assert_eq!(snap.processes_seen, 42);
        assert_eq!(snap.actions_succeeded, 1);
        assert_eq!(snap.actions_failed, 1);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
    }
}
