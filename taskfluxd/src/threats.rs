use crate::classifier::{ThreatEvent, Tier};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// Bounded ring of recent threat events, oldest first.
#[derive(Debug)]
pub struct ThreatFeed {
    inner: Mutex<VecDeque<ThreatEvent>>,
    capacity: usize,
}

impl ThreatFeed {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, event: ThreatEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(event);
    }

    /// Events at or above `min_tier`, in emission order.
    pub fn query(&self, min_tier: Tier) -> Vec<ThreatEvent> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .iter()
            .filter(|e| e.tier >= min_tier)
            .cloned()
            .collect()
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<ThreatEvent> {
        if limit == 0 {
            return Vec::new();
        }
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
