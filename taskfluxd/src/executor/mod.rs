//! On-demand process actions: kill, kill-tree and locate.
//!
//! Actions run on the caller's task, outside the sampling cadence. Every
//! wait for a process to exit is bounded, and every outcome is written to
//! the [`LogBus`] as a system-action entry.

use crate::bus::{LogBus, LogLevel, LogRecord};
use crate::config::ActionConfig;
use crate::error::ActionError;
use crate::metrics::Metrics;
use crate::pipeline::CycleResult;
use crate::types::Pid;
use futures_util::future::join_all;
use log::{info, warn};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub mod control;
pub mod family;
pub mod safety;

pub use control::{ProcessControl, SignalControl, SignalError};
pub use safety::SafetyGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    /// Exited after the graceful request.
    Terminated,
    /// Was already gone when the request arrived.
    AlreadyExited,
    /// Needed the forceful kill.
    Escalated,
}

impl ActionOutcome {
    pub fn code(self) -> &'static str {
        match self {
            ActionOutcome::Terminated => "terminated",
            ActionOutcome::AlreadyExited => "already_exited",
            ActionOutcome::Escalated => "escalated",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            ActionOutcome::Terminated => "terminated",
            ActionOutcome::AlreadyExited => "had already exited",
            ActionOutcome::Escalated => {
                "ignored the termination request; killed forcefully"
            }
        }
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillReport {
    pub pid: Pid,
    pub name: String,
    pub outcome: ActionOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeMember {
    pub pid: Pid,
    pub outcome: ActionOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeReport {
    pub pid: Pid,
    pub name: String,
    /// Cycle whose process table defined the tree.
    pub cycle: u64,
    pub outcome: ActionOutcome,
    /// Deepest first, in termination order.
    pub descendants: Vec<TreeMember>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub pid: Pid,
    pub executable: PathBuf,
    pub directory: PathBuf,
}

pub struct ActionExecutor {
    control: Arc<dyn ProcessControl>,
    cycles: watch::Receiver<Arc<CycleResult>>,
    bus: Arc<LogBus>,
    metrics: Arc<Metrics>,
    guard: SafetyGuard,
    config: ActionConfig,
}

impl ActionExecutor {
    pub fn new(
        control: Arc<dyn ProcessControl>,
        cycles: watch::Receiver<Arc<CycleResult>>,
        bus: Arc<LogBus>,
        metrics: Arc<Metrics>,
        config: ActionConfig,
    ) -> Self {
        Self {
            control,
            cycles,
            bus,
            metrics,
            guard: SafetyGuard::for_current_process(),
            config,
        }
    }

    pub fn with_guard(mut self, guard: SafetyGuard) -> Self {
        self.guard = guard;
        self
    }

    fn current(&self) -> Arc<CycleResult> {
        Arc::clone(&self.cycles.borrow())
    }

    pub async fn kill(&self, pid: Pid) -> Result<KillReport, ActionError> {
        let result = self.kill_inner(pid).await;
        match &result {
            Ok(report) => {
                let message = format!(
                    "[KILL] {} (PID {pid}) {}",
                    report.name,
                    report.outcome.describe()
                );
                self.report_success(pid, report.outcome, message);
            }
            Err(err) => self.report_failure(pid, err, format!("[KILL] PID {pid} failed: {err}")),
        }
        result
    }

    async fn kill_inner(&self, pid: Pid) -> Result<KillReport, ActionError> {
        self.guard.check(pid)?;
        let cycle = self.current();
        let name = cycle
            .process(pid)
            .map(|p| p.name.clone())
            .ok_or(ActionError::NotFound(pid))?;
        let outcome = self.terminate(pid).await?;
        Ok(KillReport { pid, name, outcome })
    }

    pub async fn kill_tree(&self, pid: Pid) -> Result<TreeReport, ActionError> {
        let result = self.kill_tree_inner(pid).await;
        match &result {
            Ok(report) => {
                let message = format!(
                    "[KILL TREE] {} (PID {pid}) {} after {} descendant(s)",
                    report.name,
                    report.outcome.describe(),
                    report.descendants.len()
                );
                self.report_success(pid, report.outcome, message);
            }
            Err(err) => {
                let mut message = format!("[KILL TREE] PID {pid} failed: {err}");
                if let ActionError::PartialFailure { failed, .. } = err {
                    let survivors: Vec<String> = failed
                        .iter()
                        .map(|(child, reason)| format!("PID {child} ({reason})"))
                        .collect();
                    message.push_str(&format!("; still running: {}", survivors.join(", ")));
                }
                self.report_failure(pid, err, message)
            }
        }
        result
    }

    async fn kill_tree_inner(&self, pid: Pid) -> Result<TreeReport, ActionError> {
        self.guard.check(pid)?;
        // One cycle's table for the whole tree; later cycles are not mixed in.
        let cycle = self.current();
        let name = cycle
            .process(pid)
            .map(|p| p.name.clone())
            .ok_or(ActionError::NotFound(pid))?;
        let levels = family::descendant_levels(cycle.process_table(), pid);
        info!(
            "[actions] kill-tree {pid}: {} descendant(s) over {} level(s) from cycle {}",
            levels.iter().map(Vec::len).sum::<usize>(),
            levels.len(),
            cycle.cycle
        );

        let mut descendants = Vec::new();
        let mut failed: Vec<(Pid, String)> = Vec::new();
        for level in levels.iter().rev() {
            let results = join_all(level.iter().map(|child| async move {
                let result = match self.guard.check(*child) {
                    Ok(()) => self.terminate(*child).await,
                    Err(err) => Err(err),
                };
                (*child, result)
            }))
            .await;
            for (child, result) in results {
                let child_name = cycle.process(child).map_or("?", |p| p.name.as_str());
                self.report_descendant(pid, child, child_name, &result);
                match result {
                    Ok(outcome) => descendants.push(TreeMember {
                        pid: child,
                        outcome,
                    }),
                    Err(err) => failed.push((child, err.to_string())),
                }
            }
        }

        // A surviving descendant keeps its parent alive too.
        if !failed.is_empty() {
            return Err(ActionError::PartialFailure {
                pid,
                terminated: descendants.len(),
                failed,
            });
        }

        let outcome = self.terminate(pid).await?;
        Ok(TreeReport {
            pid,
            name,
            cycle: cycle.cycle,
            outcome,
            descendants,
        })
    }

    pub fn locate(&self, pid: Pid) -> Result<Location, ActionError> {
        let cycle = self.current();
        let result = cycle
            .process(pid)
            .ok_or(ActionError::NotFound(pid))
            .and_then(|p| p.exe.clone().ok_or(ActionError::PathUnavailable(pid)))
            .map(|executable| Location {
                pid,
                directory: executable
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| executable.clone()),
                executable,
            });

        match &result {
            Ok(location) => {
                self.bus.append(
                    LogRecord::action(format!(
                        "[OPEN] PID {pid} located at {}",
                        location.executable.display()
                    ))
                    .pid(pid)
                    .action_result("located"),
                );
            }
            Err(err) => {
                self.bus.append(
                    LogRecord::action(format!("[OPEN] PID {pid}: {err}"))
                        .level(LogLevel::Warn)
                        .pid(pid)
                        .action_result(err.code()),
                );
            }
        }
        result
    }

    /// Graceful request, bounded wait, then one forceful attempt.
    async fn terminate(&self, pid: Pid) -> Result<ActionOutcome, ActionError> {
        match self.control.terminate(pid) {
            Ok(()) => {}
            Err(SignalError::NoSuchProcess) => return Ok(ActionOutcome::AlreadyExited),
            Err(err) => return Err(signal_error(pid, err)),
        }
        if self
            .wait_for_exit(pid, Duration::from_millis(self.config.graceful_wait_ms))
            .await
        {
            return Ok(ActionOutcome::Terminated);
        }

        warn!("[actions] pid {pid} still running after graceful request; escalating");
        match self.control.force_kill(pid) {
            Ok(()) => {}
            Err(SignalError::NoSuchProcess) => return Ok(ActionOutcome::Terminated),
            Err(err) => return Err(signal_error(pid, err)),
        }
        if self
            .wait_for_exit(pid, Duration::from_millis(self.config.forceful_wait_ms))
            .await
        {
            Ok(ActionOutcome::Escalated)
        } else {
            Err(ActionError::EscalationExhausted(pid))
        }
    }

    async fn wait_for_exit(&self, pid: Pid, limit: Duration) -> bool {
        let poll = Duration::from_millis(self.config.poll_ms.max(1));
        let control = Arc::clone(&self.control);
        tokio::time::timeout(limit, async move {
            while control.is_alive(pid) {
                tokio::time::sleep(poll).await;
            }
        })
        .await
        .is_ok()
    }

    fn report_success(&self, pid: Pid, outcome: ActionOutcome, message: String) {
        self.metrics.inc_actions(true);
        log::warn!(target: "taskflux_audit", "ACTION pid={pid} result={outcome}");
        self.bus
            .append(LogRecord::action(message).pid(pid).action_result(outcome.code()));
    }

    /// Per-descendant entry; metrics count the tree action once.
    fn report_descendant(
        &self,
        root: Pid,
        pid: Pid,
        name: &str,
        result: &Result<ActionOutcome, ActionError>,
    ) {
        let record = match result {
            Ok(outcome) => {
                log::info!(target: "taskflux_audit", "ACTION pid={pid} tree={root} result={outcome}");
                LogRecord::action(format!(
                    "[KILL TREE] {name} (PID {pid}) under PID {root} {}",
                    outcome.describe()
                ))
                .action_result(outcome.code())
            }
            Err(err) => {
                log::warn!(target: "taskflux_audit", "ACTION pid={pid} tree={root} result={}", err.code());
                LogRecord::action(format!(
                    "[KILL TREE] {name} (PID {pid}) under PID {root} failed: {err}"
                ))
                .level(LogLevel::Error)
                .action_result(err.code())
            }
        };
        self.bus.append(record.pid(pid));
    }

    fn report_failure(&self, pid: Pid, err: &ActionError, message: String) {
        self.metrics.inc_actions(false);
        log::warn!(target: "taskflux_audit", "ACTION pid={pid} result={}", err.code());
        let level = match err {
            ActionError::Refused { .. } | ActionError::NotFound(_) => LogLevel::Warn,
            _ => LogLevel::Error,
        };
        self.bus.append(
            LogRecord::action(message)
                .level(level)
                .pid(pid)
                .action_result(err.code()),
        );
    }
}

fn signal_error(pid: Pid, err: SignalError) -> ActionError {
    match err {
        SignalError::PermissionDenied => ActionError::PermissionDenied(pid),
        SignalError::NoSuchProcess => ActionError::NotFound(pid),
        SignalError::Other(message) => ActionError::Os { pid, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LogCategory, LogFilter};
    use crate::config::BusConfig;
    use crate::types::ProcessSnapshot;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Behaviour {
        Obeys,
        IgnoresTerm,
        Immortal,
        Denied,
    }

    #[derive(Default)]
    struct FakeControl {
        behaviour: HashMap<Pid, Behaviour>,
        dead: Mutex<HashSet<Pid>>,
        signals: Mutex<Vec<(Pid, &'static str)>>,
    }

    impl FakeControl {
        fn with(entries: &[(Pid, Behaviour)]) -> Self {
            Self {
                behaviour: entries.iter().copied().collect(),
                ..Self::default()
            }
        }

        fn signals(&self) -> Vec<(Pid, &'static str)> {
            self.signals.lock().unwrap().clone()
        }
    }

    impl ProcessControl for FakeControl {
        fn terminate(&self, pid: Pid) -> Result<(), SignalError> {
            if !self.is_alive(pid) {
                return Err(SignalError::NoSuchProcess);
            }
            self.signals.lock().unwrap().push((pid, "term"));
            match self.behaviour.get(&pid) {
                Some(Behaviour::Denied) => Err(SignalError::PermissionDenied),
                Some(Behaviour::Obeys) => {
                    self.dead.lock().unwrap().insert(pid);
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        fn force_kill(&self, pid: Pid) -> Result<(), SignalError> {
            self.signals.lock().unwrap().push((pid, "kill"));
            if self.behaviour.get(&pid) != Some(&Behaviour::Immortal) {
                self.dead.lock().unwrap().insert(pid);
            }
            Ok(())
        }

        fn is_alive(&self, pid: Pid) -> bool {
            self.behaviour.contains_key(&pid) && !self.dead.lock().unwrap().contains(&pid)
        }
    }

    fn table(entries: &[(Pid, Pid)]) -> Arc<CycleResult> {
        let processes = entries
            .iter()
            .map(|(pid, ppid)| {
                let mut snap = ProcessSnapshot::new(*pid, format!("p{pid}"));
                snap.ppid = Some(*ppid);
                snap.exe = Some(PathBuf::from(format!("/opt/app/p{pid}")));
                snap
            })
            .collect();
        Arc::new(CycleResult::with_table(7, processes))
    }

    fn executor(
        control: Arc<FakeControl>,
        cycle: Arc<CycleResult>,
    ) -> (ActionExecutor, Arc<LogBus>, watch::Sender<Arc<CycleResult>>) {
        let (tx, rx) = watch::channel(cycle);
        let bus = Arc::new(LogBus::new(&BusConfig::default()));
        let executor = ActionExecutor::new(
            control,
            rx,
            Arc::clone(&bus),
            Arc::new(Metrics::new()),
            ActionConfig::default(),
        )
        .with_guard(SafetyGuard::new(99_999));
        (executor, bus, tx)
    }

    fn action_results(bus: &LogBus) -> Vec<String> {
        bus.query(LogFilter {
            category: Some(LogCategory::SystemAction),
            ..LogFilter::default()
        })
        .filter_map(|e| e.payload.as_ref().and_then(|p| p.action_result.clone()))
        .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_kill_succeeds() {
        let control = Arc::new(FakeControl::with(&[(100, Behaviour::Obeys)]));
        let (executor, bus, _tx) = executor(Arc::clone(&control), table(&[(100, 1)]));

        let report = executor.kill(100).await.unwrap();
        assert_eq!(report.outcome, ActionOutcome::Terminated);
        assert_eq!(control.signals(), vec![(100, "term")]);
        assert_eq!(action_results(&bus), vec!["terminated"]);
    }

    #[tokio::test(start_paused = true)]
    async fn escalates_once_then_gives_up() {
        let control = Arc::new(FakeControl::with(&[
            (100, Behaviour::IgnoresTerm),
            (200, Behaviour::Immortal),
        ]));
        let (executor, bus, _tx) = executor(Arc::clone(&control), table(&[(100, 1), (200, 1)]));

        let report = executor.kill(100).await.unwrap();
        assert_eq!(report.outcome, ActionOutcome::Escalated);

        let err = executor.kill(200).await.unwrap_err();
        assert_eq!(err, ActionError::EscalationExhausted(200));
        let kills = control
            .signals()
            .iter()
            .filter(|(pid, sig)| *pid == 200 && *sig == "kill")
            .count();
        assert_eq!(kills, 1);
        assert_eq!(
            action_results(&bus),
            vec!["escalated", "escalation_exhausted"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reports_already_exited_and_permission_denied() {
        let control = Arc::new(FakeControl::with(&[(300, Behaviour::Denied)]));
        // 400 is in the snapshot but gone from the OS.
        let (executor, bus, _tx) = executor(control, table(&[(300, 1), (400, 1)]));

        assert_eq!(
            executor.kill(400).await.unwrap().outcome,
            ActionOutcome::AlreadyExited
        );
        assert_eq!(
            executor.kill(300).await.unwrap_err(),
            ActionError::PermissionDenied(300)
        );
        assert_eq!(
            action_results(&bus),
            vec!["already_exited", "permission_denied"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_guarded_and_unknown_pids() {
        let control = Arc::new(FakeControl::default());
        let (executor, bus, _tx) = executor(control, table(&[(1, 0)]));
        assert!(matches!(
            executor.kill(1).await,
            Err(ActionError::Refused { .. })
        ));
        assert_eq!(
            executor.kill(555).await.unwrap_err(),
            ActionError::NotFound(555)
        );
        assert_eq!(action_results(&bus), vec!["refused", "not_found"]);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_tree_terminates_children_first() {
        let control = Arc::new(FakeControl::with(&[
            (10, Behaviour::Obeys),
            (11, Behaviour::Obeys),
            (12, Behaviour::Obeys),
            (13, Behaviour::Obeys),
        ]));
        let (executor, bus, _tx) = executor(
            Arc::clone(&control),
            table(&[(10, 1), (11, 10), (12, 10), (13, 11)]),
        );

        let report = executor.kill_tree(10).await.unwrap();
        assert_eq!(report.cycle, 7);
        assert_eq!(report.descendants.len(), 3);

        let entries: Vec<_> = bus.query(LogFilter::default()).collect();
        let pids: Vec<_> = entries
            .iter()
            .filter_map(|e| e.payload.as_ref().and_then(|p| p.pid))
            .collect();
        assert_eq!(pids, vec![13, 11, 12, 10]);
        assert_eq!(action_results(&bus), vec!["terminated"; 4]);
        assert_eq!(
            entries[0].message,
            "[KILL TREE] p13 (PID 13) under PID 10 terminated"
        );
        assert_eq!(
            entries[3].message,
            "[KILL TREE] p10 (PID 10) terminated after 3 descendant(s)"
        );

        let order: Vec<Pid> = control.signals().iter().map(|(pid, _)| *pid).collect();
        let pos = |pid| order.iter().position(|p| *p == pid).unwrap();
        assert!(pos(13) < pos(11));
        assert!(pos(11) < pos(10));
        assert!(pos(12) < pos(10));
        assert_eq!(*order.last().unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_tree_reports_partial_failure() {
        let control = Arc::new(FakeControl::with(&[
            (10, Behaviour::Obeys),
            (11, Behaviour::Obeys),
            (12, Behaviour::Denied),
        ]));
        let (executor, bus, _tx) = executor(
            Arc::clone(&control),
            table(&[(10, 1), (11, 10), (12, 10)]),
        );

        match executor.kill_tree(10).await {
            Err(ActionError::PartialFailure {
                pid,
                terminated,
                failed,
            }) => {
                assert_eq!(pid, 10);
                assert_eq!(terminated, 1);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].0, 12);
            }
            other => panic!("expected partial failure, got {other:?}"),
        }
        assert!(control.is_alive(10));
        assert_eq!(
            action_results(&bus),
            vec!["terminated", "permission_denied", "partial_failure"]
        );
        let summary = bus.query(LogFilter::default()).last().unwrap();
        assert!(summary.message.contains("still running: PID 12 (permission denied for process 12)"));
    }

    #[tokio::test(start_paused = true)]
    async fn kill_tree_wording_follows_root_outcome() {
        let control = Arc::new(FakeControl::with(&[
            (10, Behaviour::IgnoresTerm),
            (11, Behaviour::IgnoresTerm),
        ]));
        let (executor, bus, _tx) = executor(Arc::clone(&control), table(&[(10, 1), (11, 10)]));

        let report = executor.kill_tree(10).await.unwrap();
        assert_eq!(report.outcome, ActionOutcome::Escalated);
        assert_eq!(action_results(&bus), vec!["escalated", "escalated"]);
        let messages: Vec<_> = bus.query(LogFilter::default()).map(|e| e.message.clone()).collect();
        assert_eq!(
            messages[1],
            "[KILL TREE] p10 (PID 10) ignored the termination request; killed forcefully after 1 descendant(s)"
        );
        assert!(!messages[1].contains(" terminated"));
    }

    #[tokio::test(start_paused = true)]
    async fn kill_tree_follows_latest_published_table() {
        let control = Arc::new(FakeControl::with(&[
            (10, Behaviour::Obeys),
            (11, Behaviour::Obeys),
            (50, Behaviour::Obeys),
        ]));
        let (executor, _bus, tx) = executor(Arc::clone(&control), table(&[(10, 1), (11, 10)]));
        // 11 was reparented and 50 adopted in the newer cycle.
        let mut newer = CycleResult::with_table(8, Vec::new());
        for (pid, ppid) in [(10, 1), (11, 1), (50, 10)] {
            let mut snap = ProcessSnapshot::new(pid, format!("p{pid}"));
            snap.ppid = Some(ppid);
            newer.process_table.push(snap);
        }
        tx.send_replace(Arc::new(newer));

        let report = executor.kill_tree(10).await.unwrap();
        assert_eq!(report.cycle, 8);
        assert_eq!(
            report.descendants,
            vec![TreeMember {
                pid: 50,
                outcome: ActionOutcome::Terminated
            }]
        );
        assert!(control.is_alive(11));
    }

    #[tokio::test(start_paused = true)]
    async fn locate_returns_executable_and_directory() {
        let control = Arc::new(FakeControl::default());
        let (executor, bus, _tx) = executor(control, table(&[(42, 1)]));
        let location = executor.locate(42).unwrap();
        assert_eq!(location.executable, PathBuf::from("/opt/app/p42"));
        assert_eq!(location.directory, PathBuf::from("/opt/app"));
        assert_eq!(executor.locate(43).unwrap_err(), ActionError::NotFound(43));
        assert_eq!(action_results(&bus), vec!["located", "not_found"]);
    }
}
