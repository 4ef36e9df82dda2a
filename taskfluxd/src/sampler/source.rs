use super::signature::SignaturePolicy;
use super::{ProcessSource, RawSample, RawSystem};
use crate::error::SampleError;
use crate::types::{ProcessSnapshot, SensorReading};
use log::debug;
use std::collections::HashSet;
use std::path::Path;
use sysinfo::{Components, Networks, Process, ProcessesToUpdate, System, Users};

/// Accounts that run services rather than people.
const SERVICE_ACCOUNTS: [&str; 4] = ["root", "SYSTEM", "LOCAL SERVICE", "NETWORK SERVICE"];

/// Live host reads through `sysinfo`, with per-process details from
/// `/proc` on Linux.
pub struct SysinfoSource {
    system: System,
    networks: Networks,
    components: Components,
    users: Users,
    policy: SignaturePolicy,
}

impl SysinfoSource {
    pub fn new(policy: SignaturePolicy) -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        Self {
            system,
            networks: Networks::new_with_refreshed_list(),
            components: Components::new_with_refreshed_list(),
            users: Users::new_with_refreshed_list(),
            policy,
        }
    }
}

impl ProcessSource for SysinfoSource {
    fn collect(&mut self) -> Result<RawSample, SampleError> {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        if self.system.processes().is_empty() {
            return Err(SampleError::Unavailable(
                "process table returned no entries".into(),
            ));
        }
        self.networks.refresh(true);
        self.components.refresh(true);
        self.users.refresh();

        let cores = self.system.cpus().len().max(1) as f32;
        let sockets = platform::socket_inodes();

        let mut disk_read = 0u64;
        let mut disk_written = 0u64;
        let mut processes = Vec::with_capacity(self.system.processes().len());
        for (pid, process) in self.system.processes() {
            // Userland threads show up as their own entries on Linux.
            if process.thread_kind().is_some() {
                continue;
            }
            let usage = process.disk_usage();
            disk_read = disk_read.saturating_add(usage.total_read_bytes);
            disk_written = disk_written.saturating_add(usage.total_written_bytes);
            processes.push(snapshot(
                pid.as_u32(),
                process,
                cores,
                &self.users,
                &mut self.policy,
                sockets.as_ref(),
            ));
        }

        let running: HashSet<&Path> = processes
            .iter()
            .filter_map(|p| p.exe.as_deref())
            .collect();
        self.policy.retain_running(&running);

        let (received, transmitted) = self
            .networks
            .list()
            .values()
            .fold((0u64, 0u64), |(rx, tx), data| {
                (
                    rx.saturating_add(data.total_received()),
                    tx.saturating_add(data.total_transmitted()),
                )
            });

        let temperatures = self
            .components
            .list()
            .iter()
            .filter_map(|c| {
                let celsius = c.temperature().filter(|t| t.is_finite())?;
                Some(SensorReading {
                    label: c.label().to_string(),
                    celsius,
                })
            })
            .collect();

        let system = RawSystem {
            cpu_percent: self.system.global_cpu_usage(),
            per_core: self.system.cpus().iter().map(|c| c.cpu_usage()).collect(),
            mem_used_bytes: self.system.used_memory(),
            mem_total_bytes: self.system.total_memory(),
            gpu: None,
            disk_read_bytes: Some(disk_read),
            disk_written_bytes: Some(disk_written),
            net_received_bytes: Some(received),
            net_transmitted_bytes: Some(transmitted),
            temperatures,
        };

        debug!("[sampler] collected {} processes", processes.len());
        Ok(RawSample { processes, system })
    }
}

fn snapshot(
    pid: u32,
    process: &Process,
    cores: f32,
    users: &Users,
    policy: &mut SignaturePolicy,
    sockets: Option<&HashSet<u64>>,
) -> ProcessSnapshot {
    let exe = process.exe().map(Path::to_path_buf);
    let uid = process.user_id();
    let user = uid
        .and_then(|uid| users.get_user_by_id(uid))
        .map(|u| u.name().to_string());
    let system = uid.is_some_and(is_system_uid)
        || user
            .as_deref()
            .is_some_and(|name| SERVICE_ACCOUNTS.contains(&name));
    let details = platform::details(pid, sockets);

    ProcessSnapshot {
        pid,
        ppid: process.parent().map(|p| p.as_u32()),
        name: process.name().to_string_lossy().into_owned(),
        signature: policy.status(exe.as_deref()),
        exe,
        user,
        system,
        start_time: Some(process.start_time()).filter(|t| *t > 0),
        cpu_percent: Some((process.cpu_usage() / cores).clamp(0.0, 100.0)),
        memory_bytes: Some(process.memory()),
        threads: details
            .threads
            .or_else(|| process.tasks().map(|t| t.len() as u32)),
        handles: details.handles,
        connections: details.connections,
        window_visible: details.window_visible,
    }
}

#[cfg(unix)]
fn is_system_uid(uid: &sysinfo::Uid) -> bool {
    **uid < 1000
}

#[cfg(not(unix))]
fn is_system_uid(_uid: &sysinfo::Uid) -> bool {
    false
}

#[derive(Debug, Default)]
struct Details {
    threads: Option<u32>,
    handles: Option<u32>,
    connections: Option<u32>,
    window_visible: Option<bool>,
}

#[cfg(target_os = "linux")]
mod platform {
    use super::Details;
    use procfs::net::{TcpState, UdpState};
    use procfs::process::{FDTarget, Process};
    use std::collections::HashSet;

    /// Inodes of inet sockets that carry traffic (listeners excluded).
    /// `None` when no socket table could be read.
    pub(super) fn socket_inodes() -> Option<HashSet<u64>> {
        let mut inodes = HashSet::new();
        let mut readable = false;
        for table in [procfs::net::tcp(), procfs::net::tcp6()] {
            if let Ok(entries) = table {
                readable = true;
                inodes.extend(
                    entries
                        .into_iter()
                        .filter(|e| e.state != TcpState::Listen)
                        .map(|e| e.inode),
                );
            }
        }
        for table in [procfs::net::udp(), procfs::net::udp6()] {
            if let Ok(entries) = table {
                readable = true;
                inodes.extend(
                    entries
                        .into_iter()
                        .filter(|e| e.state == UdpState::Established)
                        .map(|e| e.inode),
                );
            }
        }
        readable.then_some(inodes)
    }

    pub(super) fn details(pid: u32, sockets: Option<&HashSet<u64>>) -> Details {
        let Ok(process) = i32::try_from(pid).map_err(|_| ()).and_then(|pid| {
            Process::new(pid).map_err(|_| ())
        }) else {
            return Details::default();
        };

        let stat = process.stat().ok();
        let threads = stat
            .as_ref()
            .and_then(|s| u32::try_from(s.num_threads).ok());
        // A controlling terminal is the closest thing to a visible window.
        let window_visible = stat.as_ref().map(|s| s.tty_nr != 0);

        let (handles, connections) = match process.fd() {
            Ok(fds) => {
                let mut handles = 0u32;
                let mut connections = 0u32;
                for fd in fds.flatten() {
                    handles += 1;
                    if let FDTarget::Socket(inode) = fd.target
                        && sockets.is_some_and(|s| s.contains(&inode))
                    {
                        connections += 1;
                    }
                }
                (Some(handles), sockets.map(|_| connections))
            }
            Err(_) => (None, None),
        };

        Details {
            threads,
            handles,
            connections,
            window_visible,
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::Details;
    use std::collections::HashSet;

    pub(super) fn socket_inodes() -> Option<HashSet<u64>> {
        None
    }

    pub(super) fn details(_pid: u32, _sockets: Option<&HashSet<u64>>) -> Details {
        Details::default()
    }
}
