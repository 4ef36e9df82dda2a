use crate::types::{Pid, ProcessSnapshot};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistorySample {
    pub cpu_percent: Option<f32>,
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Default)]
struct Ring {
    start_time: Option<u64>,
    samples: VecDeque<HistorySample>,
}

/// Bounded per-PID sample history for trend heuristics.
///
/// A ring belongs to one process instance: when a PID reappears with a
/// different start time it was reused and the ring starts over.
#[derive(Debug)]
pub struct ProcessHistory {
    capacity: usize,
    rings: HashMap<Pid, Ring>,
}

impl ProcessHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: HashMap::new(),
        }
    }

    /// Prior samples of this process instance, oldest first. Empty when the
    /// PID is new or was reused.
    pub fn for_process(&self, snap: &ProcessSnapshot) -> Vec<HistorySample> {
        match self.rings.get(&snap.pid) {
            Some(ring) if ring.start_time == snap.start_time => {
                ring.samples.iter().copied().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Append this cycle's samples and drop rings of PIDs that are gone.
    pub fn record(&mut self, snapshots: &[ProcessSnapshot]) {
        let live: HashSet<Pid> = snapshots.iter().map(|s| s.pid).collect();
        self.rings.retain(|pid, _| live.contains(pid));

        for snap in snapshots {
            let ring = self.rings.entry(snap.pid).or_default();
            if ring.start_time != snap.start_time {
                ring.samples.clear();
                ring.start_time = snap.start_time;
            }
            if ring.samples.len() == self.capacity {
                ring.samples.pop_front();
            }
            ring.samples.push_back(HistorySample {
                cpu_percent: snap.cpu_percent,
                memory_bytes: snap.memory_bytes,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.rings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc_with(pid: Pid, start: u64, cpu: f32) -> ProcessSnapshot {
        let mut snap = ProcessSnapshot::new(pid, "worker");
        snap.start_time = Some(start);
        snap.cpu_percent = Some(cpu);
        snap
    }

    #[test]
    fn keeps_bounded_samples() {
        let mut history = ProcessHistory::new(3);
        for cpu in [1.0, 2.0, 3.0, 4.0] {
            history.record(&[proc_with(7, 100, cpu)]);
        }
        let samples = history.for_process(&proc_with(7, 100, 0.0));
        let cpus: Vec<_> = samples.iter().map(|s| s.cpu_percent.unwrap()).collect();
        assert_eq!(cpus, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn reused_pid_starts_fresh() {
        let mut history = ProcessHistory::new(4);
        history.record(&[proc_with(7, 100, 90.0)]);
        history.record(&[proc_with(7, 100, 90.0)]);

        let reused = proc_with(7, 500, 1.0);
        assert!(history.for_process(&reused).is_empty());

        history.record(&[reused.clone()]);
        assert_eq!(history.for_process(&reused).len(), 1);
    }

    #[test]
    fn absent_pids_are_evicted() {
        let mut history = ProcessHistory::new(4);
        history.record(&[proc_with(1, 1, 0.0), proc_with(2, 1, 0.0)]);
        assert_eq!(history.len(), 2);
        history.record(&[proc_with(2, 1, 0.0)]);
        assert_eq!(history.len(), 1);
        assert!(history.for_process(&proc_with(1, 1, 0.0)).is_empty());
    }
}
