use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use taskfluxd::bus::{LogBus, LogCategory, LogFilter};
use taskfluxd::classifier::Tier;
use taskfluxd::config::{ActionConfig, BusConfig, Config};
use taskfluxd::error::{ActionError, SampleError};
use taskfluxd::executor::{ActionExecutor, ProcessControl, SafetyGuard, SignalError};
use taskfluxd::pipeline::PipelineHandles;
use taskfluxd::sampler::{ProcessSource, RawSample};
use taskfluxd::scoring::Heuristic;
use taskfluxd::threats::ThreatFeed;
use taskfluxd::types::{IDLE_PID, KERNEL_PID};
use taskfluxd::{Metrics, Pid, Pipeline, ProcessSnapshot, SettingsStore, SignatureStatus};

struct Replay(VecDeque<Vec<ProcessSnapshot>>);

impl ProcessSource for Replay {
    fn collect(&mut self) -> Result<RawSample, SampleError> {
        let processes = self
            .0
            .pop_front()
            .ok_or_else(|| SampleError::Unavailable("replay finished".into()))?;
        Ok(RawSample {
            processes,
            ..RawSample::default()
        })
    }
}

/// Processes die on the first signal, except the ones marked stubborn.
#[derive(Default)]
struct Reaper {
    stubborn: HashSet<Pid>,
    dead: Mutex<HashSet<Pid>>,
    order: Mutex<Vec<Pid>>,
}

impl ProcessControl for Reaper {
    fn terminate(&self, pid: Pid) -> Result<(), SignalError> {
        if self.stubborn.contains(&pid) {
            return Err(SignalError::PermissionDenied);
        }
        self.order.lock().unwrap().push(pid);
        self.dead.lock().unwrap().insert(pid);
        Ok(())
    }

    fn force_kill(&self, pid: Pid) -> Result<(), SignalError> {
        self.dead.lock().unwrap().insert(pid);
        Ok(())
    }

    fn is_alive(&self, pid: Pid) -> bool {
        !self.dead.lock().unwrap().contains(&pid)
    }
}

fn handles() -> PipelineHandles {
    PipelineHandles {
        bus: Arc::new(LogBus::new(&BusConfig::default())),
        threats: Arc::new(ThreatFeed::new(64)),
        metrics: Arc::new(Metrics::new()),
        settings: SettingsStore::new(Default::default()).unwrap(),
    }
}

fn process(pid: Pid, ppid: Pid, name: &str) -> ProcessSnapshot {
    let mut snap = ProcessSnapshot::new(pid, name);
    snap.ppid = Some(ppid);
    snap.exe = Some(format!("/usr/bin/{name}").into());
    snap.start_time = Some(Utc::now().timestamp() as u64 - 7_200);
    snap.cpu_percent = Some(0.0);
    snap.memory_bytes = Some(8 * 1024 * 1024);
    snap.connections = Some(0);
    snap.signature = SignatureStatus::Signed;
    snap.window_visible = Some(true);
    snap
}

fn dropper() -> ProcessSnapshot {
    let mut snap = process(1001, 1, "updater");
    snap.exe = Some("/tmp/updater".into());
    snap.signature = SignatureStatus::Unsigned;
    snap.connections = Some(2);
    snap.window_visible = Some(false);
    snap.start_time = Some(Utc::now().timestamp() as u64 - 5);
    snap.cpu_percent = Some(1.0);
    snap
}

#[test]
fn hidden_networked_temp_binary_raises_a_threat() {
    let handles = handles();
    let (mut pipeline, cycles) = Pipeline::new(
        Replay(VecDeque::from([vec![process(1, 0, "init"), dropper()]])),
        &Config::default(),
        handles.clone(),
    );
    pipeline.run_cycle().unwrap();

    let cycle = cycles.borrow().clone();
    let record = cycle.score(1001).expect("scored");
    assert!(record.has_reason(Heuristic::BackgroundExfiltration));
    assert!(record.has_reason(Heuristic::RecentlySpawned));
    assert!(Config::default().thresholds.classify(record.score) >= Tier::High);

    let events = handles.threats.query(Tier::High);
    assert_eq!(events.len(), 1);
    let ids = events[0].record.as_ref().unwrap().reason_ids();
    assert!(ids.contains(&"background_exfiltration"));
    assert!(ids.contains(&"recently_spawned"));

    let threat_log: Vec<_> = handles
        .bus
        .query(LogFilter {
            category: Some(LogCategory::Threat),
            ..LogFilter::default()
        })
        .collect();
    assert_eq!(threat_log.len(), 1);
    assert_eq!(threat_log[0].payload.as_ref().unwrap().pid, Some(1001));

    assert!(cycle.health.score < 100.0);
    assert_eq!(cycle.health.top_issues[0].pid, Some(1001));
}

#[test]
fn sentinel_pids_are_never_published() {
    let settings = taskfluxd::RuntimeConfig {
        show_system_processes: true,
        ..Default::default()
    };
    let handles = PipelineHandles {
        settings: SettingsStore::new(settings).unwrap(),
        ..handles()
    };
    let (mut pipeline, cycles) = Pipeline::new(
        Replay(VecDeque::from([vec![
            process(IDLE_PID, 0, "idle"),
            process(KERNEL_PID, 0, "kernel"),
            process(1, 0, "init"),
            process(500, 1, "bash"),
        ]])),
        &Config::default(),
        handles,
    );
    pipeline.run_cycle().unwrap();

    let cycle = cycles.borrow().clone();
    for list in [&cycle.processes, &cycle.process_table] {
        assert!(list.iter().all(|p| p.pid != IDLE_PID && p.pid != KERNEL_PID));
    }
    assert_eq!(cycle.process_table.len(), 2);
}

#[test]
fn repeated_scores_do_not_repeat_events() {
    let handles = handles();
    let (mut pipeline, _cycles) = Pipeline::new(
        Replay(VecDeque::from([vec![dropper()], vec![dropper()], vec![dropper()]])),
        &Config::default(),
        handles.clone(),
    );
    for _ in 0..3 {
        pipeline.run_cycle().unwrap();
    }
    assert_eq!(handles.threats.len(), 1);
}

#[test]
fn reused_pid_reports_its_own_threat() {
    let handles = handles();
    let mut successor = dropper();
    successor.start_time = successor.start_time.map(|t| t + 3);
    let (mut pipeline, _cycles) = Pipeline::new(
        Replay(VecDeque::from([vec![dropper()], vec![successor]])),
        &Config::default(),
        handles.clone(),
    );
    pipeline.run_cycle().unwrap();
    pipeline.run_cycle().unwrap();

    let events = handles.threats.query(Tier::High);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.previous == Tier::Healthy));
}

fn family() -> Vec<ProcessSnapshot> {
    vec![
        process(1, 0, "init"),
        process(700, 1, "launcher"),
        process(701, 700, "worker"),
        process(702, 700, "worker"),
        process(703, 701, "helper"),
        process(800, 1, "unrelated"),
    ]
}

#[tokio::test(start_paused = true)]
async fn kill_tree_through_the_published_cycle() {
    let handles = handles();
    let (mut pipeline, cycles) =
        Pipeline::new(Replay(VecDeque::from([family()])), &Config::default(), handles.clone());
    pipeline.run_cycle().unwrap();

    let control = Arc::new(Reaper::default());
    let executor = ActionExecutor::new(
        control.clone(),
        cycles,
        Arc::clone(&handles.bus),
        Arc::clone(&handles.metrics),
        ActionConfig::default(),
    )
    .with_guard(SafetyGuard::new(99_999));

    let report = executor.kill_tree(700).await.unwrap();
    assert_eq!(report.cycle, 1);
    assert_eq!(report.descendants.len(), 3);

    let order = control.order.lock().unwrap().clone();
    assert_eq!(order.first(), Some(&703));
    assert_eq!(order.last(), Some(&700));
    assert!(!order.contains(&800));

    let actions: Vec<_> = handles
        .bus
        .query(LogFilter {
            category: Some(LogCategory::SystemAction),
            ..LogFilter::default()
        })
        .map(|e| e.message.clone())
        .collect();
    // one entry per descendant, then the root
    assert_eq!(actions.len(), 4);
    assert!(actions[0].contains("(PID 703) under PID 700 terminated"));
    assert!(actions[3].starts_with("[KILL TREE] launcher (PID 700) terminated"));
    assert_eq!(handles.metrics.snapshot().actions_succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn kill_tree_partial_failure_spares_the_root() {
    let handles = handles();
    let (mut pipeline, cycles) =
        Pipeline::new(Replay(VecDeque::from([family()])), &Config::default(), handles.clone());
    pipeline.run_cycle().unwrap();

    let control = Arc::new(Reaper {
        stubborn: HashSet::from([702]),
        ..Reaper::default()
    });
    let executor = ActionExecutor::new(
        control.clone(),
        cycles,
        Arc::clone(&handles.bus),
        Arc::clone(&handles.metrics),
        ActionConfig::default(),
    )
    .with_guard(SafetyGuard::new(99_999));

    let err = executor.kill_tree(700).await.unwrap_err();
    assert!(matches!(err, ActionError::PartialFailure { pid: 700, terminated: 2, .. }));
    assert!(control.is_alive(700));
    assert!(control.is_alive(702));
    assert!(!control.is_alive(703));
}
