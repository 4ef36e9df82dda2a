//! Append-only, filterable record of process, threat and system-action
//! events.
//!
//! [`LogBus::append`] is the single serialization point: the sequence number
//! is assigned and the entry stored under one lock, so entries from the
//! pipeline and from concurrent action tasks are totally ordered. Eviction
//! only ever removes from the front.

use crate::classifier::Tier;
use crate::config::BusConfig;
use crate::metrics::Metrics;
use crate::types::Pid;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    Process,
    Threat,
    SystemAction,
}

impl LogCategory {
    pub fn label(self) -> &'static str {
        match self {
            LogCategory::Process => "process",
            LogCategory::Threat => "threat",
            LogCategory::SystemAction => "system_action",
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for LogCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "process" => Ok(LogCategory::Process),
            "threat" => Ok(LogCategory::Threat),
            "system_action" | "system" | "action" => Ok(LogCategory::SystemAction),
            other => Err(format!("unknown log category '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<Pid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

impl LogPayload {
    fn is_empty(&self) -> bool {
        *self == LogPayload::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub category: LogCategory,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<LogPayload>,
}

/// An entry before the bus has stamped it.
#[derive(Debug, Clone)]
pub struct LogRecord {
    category: LogCategory,
    level: LogLevel,
    message: String,
    payload: LogPayload,
    timestamp: Option<DateTime<Utc>>,
}

impl LogRecord {
    pub fn new(category: LogCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            level: LogLevel::Info,
            message: message.into(),
            payload: LogPayload::default(),
            timestamp: None,
        }
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::new(LogCategory::Process, message)
    }

    pub fn threat(message: impl Into<String>) -> Self {
        Self::new(LogCategory::Threat, message)
    }

    pub fn action(message: impl Into<String>) -> Self {
        Self::new(LogCategory::SystemAction, message)
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn pid(mut self, pid: Pid) -> Self {
        self.payload.pid = Some(pid);
        self
    }

    pub fn action_result(mut self, result: impl Into<String>) -> Self {
        self.payload.action_result = Some(result.into());
        self
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.payload.tier = Some(tier);
        self
    }

    /// Stamp with an explicit time instead of the append time.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFilter {
    pub category: Option<LogCategory>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the message.
    pub text: Option<String>,
    /// Only entries with a sequence number strictly greater than this.
    pub after: Option<u64>,
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn tail(after: u64) -> Self {
        Self {
            after: Some(after),
            ..Self::default()
        }
    }

    fn matches(&self, entry: &LogEntry, needle: Option<&str>) -> bool {
        if self.category.is_some_and(|c| c != entry.category) {
            return false;
        }
        if self.since.is_some_and(|since| entry.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| entry.timestamp > until) {
            return false;
        }
        needle.is_none_or(|n| entry.message.to_lowercase().contains(n))
    }
}

/// Lazy view over a query's candidate entries, in sequence order.
pub struct LogQuery {
    entries: std::vec::IntoIter<Arc<LogEntry>>,
    filter: LogFilter,
    needle: Option<String>,
    remaining: usize,
}

impl Iterator for LogQuery {
    type Item = Arc<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        for entry in self.entries.by_ref() {
            if self.filter.matches(&entry, self.needle.as_deref()) {
                self.remaining -= 1;
                return Some(entry);
            }
        }
        None
    }
}

impl LogQuery {
    /// The last `n` matches, oldest first. Ignores the filter's limit.
    pub fn newest(mut self, n: usize) -> Vec<Arc<LogEntry>> {
        self.remaining = usize::MAX;
        let mut kept = VecDeque::with_capacity(n.min(1024));
        for entry in self {
            if n == 0 {
                break;
            }
            if kept.len() == n {
                kept.pop_front();
            }
            kept.push_back(entry);
        }
        kept.into()
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    entries: VecDeque<Arc<LogEntry>>,
    journal_error: Option<String>,
}

#[derive(Debug)]
pub struct LogBus {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_age: Option<ChronoDuration>,
    journal: Option<PathBuf>,
    metrics: Option<Arc<Metrics>>,
}

impl LogBus {
    pub fn new(config: &BusConfig) -> Self {
        let max_age = (config.max_age_secs > 0)
            .then(|| i64::try_from(config.max_age_secs).ok())
            .flatten()
            .and_then(ChronoDuration::try_seconds);
        Self {
            inner: Mutex::new(Inner {
                next_seq: 1,
                ..Inner::default()
            }),
            max_entries: config.max_entries.max(1),
            max_age,
            journal: config.journal_path.clone(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, record: LogRecord) -> Arc<LogEntry> {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let now = Utc::now();
        let entry = Arc::new(LogEntry {
            seq,
            timestamp: record.timestamp.unwrap_or(now),
            category: record.category,
            level: record.level,
            message: record.message,
            payload: (!record.payload.is_empty()).then_some(record.payload),
        });
        debug!("[bus] #{} {} {}", entry.seq, entry.category, entry.message);

        inner.entries.push_back(Arc::clone(&entry));
        while inner.entries.len() > self.max_entries {
            inner.entries.pop_front();
        }
        if let Some(max_age) = self.max_age {
            let cutoff = now - max_age;
            while inner
                .entries
                .front()
                .is_some_and(|e| e.timestamp < cutoff && e.seq != seq)
            {
                inner.entries.pop_front();
            }
        }

        if let Some(path) = &self.journal {
            let result = ensure_parent(path).and_then(|_| append_record(path, entry.as_ref()));
            match result {
                Ok(()) => inner.journal_error = None,
                Err(err) => {
                    let msg = format!("failed to append to {}: {err}", path.display());
                    log_once(&mut inner.journal_error, msg);
                }
            }
        }
        drop(inner);

        if let Some(metrics) = &self.metrics {
            metrics.inc_log_entries();
        }
        entry
    }

    pub fn query(&self, filter: LogFilter) -> LogQuery {
        let candidates: Vec<Arc<LogEntry>> = {
            let inner = self.lock();
            let start = match filter.after {
                Some(after) => inner.entries.partition_point(|e| e.seq <= after),
                None => 0,
            };
            inner.entries.range(start..).cloned().collect()
        };
        let needle = filter
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);
        LogQuery {
            entries: candidates.into_iter(),
            remaining: filter.limit.unwrap_or(usize::MAX),
            filter,
            needle,
        }
    }

    /// Entries appended after `after`, for auto-scrolling consumers.
    pub fn tail(&self, after: u64) -> LogQuery {
        self.query(LogFilter::tail(after))
    }

    /// Drop every retained entry. Sequence numbering continues.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        debug!("[bus] cleared {dropped} entries");
    }

    /// Sequence number of the newest entry ever appended (0 when none).
    pub fn last_seq(&self) -> u64 {
        self.lock().next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn log_once(last: &mut Option<String>, msg: String) {
    if last.as_deref() != Some(msg.as_str()) {
        warn!("[bus] {msg}");
        *last = Some(msg);
    }
}

pub(crate) fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn append_record<T: Serialize>(path: &Path, record: &T) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::NamedTempFile;

    fn bus(max_entries: usize) -> LogBus {
        LogBus::new(&BusConfig {
            max_entries,
            max_age_secs: 0,
            ..BusConfig::default()
        })
    }

    #[test]
    fn sequence_is_strictly_increasing_across_writers() {
        let bus = Arc::new(bus(10_000));
        let handles: Vec<_> = (0..4)
            .map(|writer| {
                let bus = Arc::clone(&bus);
                thread::spawn(move || {
                    for i in 0..250 {
                        bus.append(LogRecord::process(format!("w{writer}-{i}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let seqs: Vec<u64> = bus.query(LogFilter::default()).map(|e| e.seq).collect();
        assert_eq!(seqs.len(), 1000);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(bus.last_seq(), 1000);
    }

    #[test]
    fn count_ceiling_evicts_oldest_first() {
        let bus = bus(3);
        for i in 0..5 {
            bus.append(LogRecord::process(format!("entry {i}")));
        }
        let seqs: Vec<u64> = bus.query(LogFilter::default()).map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn age_ceiling_evicts_stale_entries() {
        let bus = LogBus::new(&BusConfig {
            max_age_secs: 60,
            ..BusConfig::default()
        });
        let old = Utc::now() - ChronoDuration::seconds(600);
        bus.append(LogRecord::process("stale").at(old));
        bus.append(LogRecord::process("fresh"));
        let messages: Vec<String> = bus
            .query(LogFilter::default())
            .map(|e| e.message.clone())
            .collect();
        assert_eq!(messages, vec!["fresh".to_string()]);
    }

    #[test]
    fn tail_never_redelivers() {
        let bus = bus(100);
        bus.append(LogRecord::process("a"));
        bus.append(LogRecord::threat("b"));
        let first: Vec<u64> = bus.tail(0).map(|e| e.seq).collect();
        assert_eq!(first, vec![1, 2]);

        let cursor = *first.last().unwrap();
        assert_eq!(bus.tail(cursor).count(), 0);
        bus.append(LogRecord::action("c"));
        let next: Vec<u64> = bus.tail(cursor).map(|e| e.seq).collect();
        assert_eq!(next, vec![3]);
    }

    #[test]
    fn filters_by_category_text_and_time() {
        let bus = bus(100);
        let t0 = Utc::now() - ChronoDuration::seconds(30);
        bus.append(LogRecord::process("[PROC-SPAWN] curl (PID 10)").at(t0));
        bus.append(LogRecord::threat("curl (PID 10) healthy -> high").pid(10).tier(Tier::High));
        bus.append(LogRecord::action("[KILL] PID 10 terminated").pid(10));

        let threats: Vec<_> = bus
            .query(LogFilter {
                category: Some(LogCategory::Threat),
                ..LogFilter::default()
            })
            .collect();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].payload.as_ref().unwrap().tier, Some(Tier::High));

        let text: Vec<_> = bus
            .query(LogFilter {
                text: Some("KILL".into()),
                ..LogFilter::default()
            })
            .collect();
        assert_eq!(text.len(), 1);
        assert_eq!(text[0].category, LogCategory::SystemAction);

        let recent = bus
            .query(LogFilter {
                since: Some(t0 + ChronoDuration::seconds(1)),
                ..LogFilter::default()
            })
            .count();
        assert_eq!(recent, 2);

        let limited = bus
            .query(LogFilter {
                limit: Some(2),
                ..LogFilter::default()
            })
            .count();
        assert_eq!(limited, 2);
    }

    #[test]
    fn query_is_a_snapshot() {
        let bus = bus(100);
        bus.append(LogRecord::process("one"));
        let query = bus.query(LogFilter::default());
        bus.append(LogRecord::process("two"));
        assert_eq!(query.count(), 1);
    }

    #[test]
    fn newest_returns_the_latest_matches_in_order() {
        let bus = bus(100);
        for i in 1..=10 {
            if i % 2 == 0 {
                bus.append(LogRecord::action(format!("action {i}")));
            } else {
                bus.append(LogRecord::process(format!("process {i}")));
            }
        }
        let latest: Vec<u64> = bus
            .query(LogFilter {
                category: Some(LogCategory::SystemAction),
                limit: Some(1),
                ..LogFilter::default()
            })
            .newest(3)
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(latest, vec![6, 8, 10]);
        assert!(bus.query(LogFilter::default()).newest(0).is_empty());
        assert_eq!(bus.query(LogFilter::default()).newest(50).len(), 10);
    }

    #[test]
    fn clear_keeps_numbering() {
        let bus = bus(100);
        bus.append(LogRecord::process("one"));
        bus.append(LogRecord::process("two"));
        bus.clear();
        assert!(bus.is_empty());
        let entry = bus.append(LogRecord::process("three"));
        assert_eq!(entry.seq, 3);
    }

    #[test]
    fn writes_journal_lines() {
        let temp = NamedTempFile::new().unwrap();
        let bus = LogBus::new(&BusConfig {
            journal_path: Some(temp.path().to_path_buf()),
            ..BusConfig::default()
        });
        bus.append(LogRecord::action("[KILL] PID 42 terminated").pid(42));

        let content = std::fs::read_to_string(temp.path()).unwrap();
        let line: LogEntry = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(line.seq, 1);
        assert_eq!(line.category, LogCategory::SystemAction);
        assert_eq!(line.payload.unwrap().pid, Some(42));
    }

    #[test]
    fn category_parses_aliases() {
        assert_eq!("system-action".parse::<LogCategory>().unwrap(), LogCategory::SystemAction);
        assert_eq!("Threat".parse::<LogCategory>().unwrap(), LogCategory::Threat);
        assert!("kernel".parse::<LogCategory>().is_err());
    }
}
