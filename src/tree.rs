//! Process tree inspection and teardown.
//!
//! A [`ProcessTable`] is a point-in-time view of every process on the host (pid,
//! parent pid, CPU and memory percentages, start time). The functions here walk that
//! table to find the transitive descendants of a root, sum their resource usage, and
//! tear a whole tree down with a graceful-then-forceful signal sequence.
//!
//! Every project runs as the leader of its own process group, so teardown also signals
//! the group. That reaches children which were reparented after their parent exited.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::{ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, info, trace};

use crate::process::ProcessStats;

/// Signals used when tearing down a process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM.
    Terminate,
    /// SIGKILL.
    Kill,
}

/// One row of the process table.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRow {
    pub pid: u32,
    pub ppid: u32,
    /// CPU usage in percent.
    pub cpu: f64,
    /// Resident memory in percent of physical memory.
    pub memory: f64,
    /// Start time in seconds since the epoch. Tells a reused pid apart from the original.
    pub started: u64,
}

/// Snapshot of the host's processes keyed by pid.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    rows: HashMap<u32, ProcessRow>,
}

impl ProcessTable {
    pub fn from_rows(rows: impl IntoIterator<Item = ProcessRow>) -> Self {
        Self {
            rows: rows.into_iter().map(|row| (row.pid, row)).collect(),
        }
    }

    /// Builds a table from a refreshed [`System`]. Threads and zombies are left out.
    pub fn from_system(system: &System) -> Self {
        let total_memory = system.total_memory() as f64;
        let rows = system
            .processes()
            .iter()
            .filter(|(_, process)| {
                process.thread_kind().is_none() && process.status() != ProcessStatus::Zombie
            })
            .map(|(pid, process)| ProcessRow {
                pid: pid.as_u32(),
                ppid: process.parent().map(|p| p.as_u32()).unwrap_or(0),
                cpu: f64::from(process.cpu_usage()),
                memory: if total_memory > 0.0 {
                    process.memory() as f64 * 100.0 / total_memory
                } else {
                    0.0
                },
                started: process.start_time(),
            });
        Self::from_rows(rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Start time of `pid`, if it is in the table.
    pub fn started(&self, pid: u32) -> Option<u64> {
        self.rows.get(&pid).map(|row| row.started)
    }

    /// True when `pid` is present and, if `started` is given, is still the same process.
    pub fn is_alive(&self, pid: u32, started: Option<u64>) -> bool {
        match (self.rows.get(&pid), started) {
            (Some(row), Some(started)) => row.started == started,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// All transitive children of `root`, breadth first. Empty if `root` is unknown.
    pub fn descendants(&self, root: u32) -> Vec<u32> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for row in self.rows.values() {
            if row.pid != row.ppid {
                children.entry(row.ppid).or_default().push(row.pid);
            }
        }
        for list in children.values_mut() {
            list.sort_unstable();
        }

        let mut found = Vec::new();
        let mut seen = HashSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(pid) = queue.pop_front() {
            let Some(kids) = children.get(&pid) else {
                continue;
            };
            for &kid in kids {
                if seen.insert(kid) {
                    found.push(kid);
                    queue.push_back(kid);
                }
            }
        }
        found
    }

    /// Sums CPU and memory over `root` and its descendants.
    ///
    /// Returns zeroed stats when `root` is no longer in the table.
    pub fn metrics(&self, root: u32, started_at: Instant) -> ProcessStats {
        let Some(root_row) = self.rows.get(&root) else {
            return ProcessStats::zeroed();
        };
        let (mut cpu, mut memory) = (root_row.cpu, root_row.memory);
        for pid in self.descendants(root) {
            if let Some(row) = self.rows.get(&pid) {
                cpu += row.cpu;
                memory += row.memory;
            }
        }
        ProcessStats {
            cpu,
            memory,
            uptime: format_uptime(started_at.elapsed().as_secs()),
        }
    }
}

/// Source of process tables and sink for signals.
#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// Takes a snapshot of every process on the host.
    async fn snapshot(&self) -> Result<ProcessTable>;

    /// Sends `signal` to a single pid.
    fn signal(&self, pid: u32, signal: Signal) -> std::io::Result<()>;

    /// Sends `signal` to every member of the process group led by `pgid`.
    fn signal_group(&self, pgid: u32, signal: Signal) -> std::io::Result<()>;
}

/// Inspector backed by `sysinfo` and `kill(2)`.
///
/// The `System` is kept between snapshots because CPU usage is measured as the
/// difference between two refreshes.
#[derive(Clone)]
pub struct SystemInspector {
    system: Arc<Mutex<System>>,
}

impl SystemInspector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::All, true);
        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }
}

impl Default for SystemInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessInspector for SystemInspector {
    async fn snapshot(&self) -> Result<ProcessTable> {
        let system = Arc::clone(&self.system);
        let table = tokio::task::spawn_blocking(move || {
            let mut system = system.lock();
            system.refresh_memory();
            system.refresh_processes(ProcessesToUpdate::All, true);
            ProcessTable::from_system(&system)
        })
        .await
        .context("process table refresh panicked")?;
        trace!("process table has {} entries", table.len());
        Ok(table)
    }

    fn signal(&self, pid: u32, signal: Signal) -> std::io::Result<()> {
        send_os_signal(pid, signal)
    }

    fn signal_group(&self, pgid: u32, signal: Signal) -> std::io::Result<()> {
        send_group_signal(pgid, signal)
    }
}

#[cfg(unix)]
fn raw_signal(signal: Signal) -> libc::c_int {
    match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    }
}

#[cfg(unix)]
fn kill_raw(target: libc::pid_t, signal: Signal) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(target, raw_signal(signal)) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: Signal) -> std::io::Result<()> {
    // pid 0 and negative pids address process groups, including our own.
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return Err(std::io::ErrorKind::InvalidInput.into());
    };
    if raw <= 0 || pid == std::process::id() {
        return Err(std::io::ErrorKind::InvalidInput.into());
    }
    kill_raw(raw, signal)
}

#[cfg(unix)]
fn send_group_signal(pgid: u32, signal: Signal) -> std::io::Result<()> {
    let Ok(raw) = libc::pid_t::try_from(pgid) else {
        return Err(std::io::ErrorKind::InvalidInput.into());
    };
    // Never init's group or the one we belong to.
    if raw <= 1 || raw == unsafe { libc::getpgrp() } {
        return Err(std::io::ErrorKind::InvalidInput.into());
    }
    kill_raw(-raw, signal)
}

#[cfg(not(unix))]
fn send_os_signal(_pid: u32, _signal: Signal) -> std::io::Result<()> {
    Err(std::io::ErrorKind::Unsupported.into())
}

#[cfg(not(unix))]
fn send_group_signal(_pgid: u32, _signal: Signal) -> std::io::Result<()> {
    Err(std::io::ErrorKind::Unsupported.into())
}

/// Returns every transitive child of `pid`, or nothing if the table is unavailable.
pub async fn enumerate_descendants(inspector: &dyn ProcessInspector, pid: u32) -> Vec<u32> {
    match inspector.snapshot().await {
        Ok(table) => table.descendants(pid),
        Err(err) => {
            debug!("process table unavailable: {:#}", err);
            Vec::new()
        }
    }
}

/// Aggregated stats for the tree rooted at `pid`; zeroed when inspection fails.
pub async fn aggregate_metrics(
    inspector: &dyn ProcessInspector,
    pid: u32,
    started_at: Instant,
) -> ProcessStats {
    match inspector.snapshot().await {
        Ok(table) => table.metrics(pid, started_at),
        Err(err) => {
            debug!("process table unavailable: {:#}", err);
            ProcessStats::zeroed()
        }
    }
}

/// Terminates the tree rooted at `pid`, which must lead its own process group.
///
/// Every descendant and then the root receive SIGTERM, followed by the group. After
/// `grace`, members still alive get SIGKILL, as does anything the root spawned
/// meanwhile, and finally the group. A member only counts as alive while its start
/// time matches the first snapshot, so a reused pid is left alone. Signals to
/// processes that are already gone are ignored.
pub async fn kill_tree(inspector: &dyn ProcessInspector, pid: u32, grace: Duration) {
    let before = inspector.snapshot().await.ok();
    let mut members: Vec<(u32, Option<u64>)> = match &before {
        Some(table) => table
            .descendants(pid)
            .into_iter()
            .map(|child| (child, table.started(child)))
            .collect(),
        None => Vec::new(),
    };

    for &(child, _) in &members {
        deliver(inspector, child, Signal::Terminate);
    }
    deliver(inspector, pid, Signal::Terminate);
    deliver_group(inspector, pid, Signal::Terminate);

    tokio::time::sleep(grace).await;

    let root_started = before.as_ref().and_then(|table| table.started(pid));
    members.push((pid, root_started));
    let survivors: Vec<u32> = match inspector.snapshot().await {
        Ok(after) => {
            let mut survivors: Vec<u32> = members
                .iter()
                .filter(|(member, started)| after.is_alive(*member, *started))
                .map(|(member, _)| *member)
                .collect();
            if after.is_alive(pid, root_started) {
                for late in after.descendants(pid) {
                    if !survivors.contains(&late) {
                        survivors.push(late);
                    }
                }
            }
            survivors
        }
        Err(_) => members.into_iter().map(|(member, _)| member).collect(),
    };
    for survivor in survivors {
        info!("force killing pid {}", survivor);
        deliver(inspector, survivor, Signal::Kill);
    }
    deliver_group(inspector, pid, Signal::Kill);
}

/// Cleans up what is left of the group led by `pgid` after its leader was reaped.
///
/// Only the group is signalled; the leader's pid may already belong to someone else.
/// Returns immediately when the group is empty.
pub async fn kill_orphans(inspector: &dyn ProcessInspector, pgid: u32, grace: Duration) {
    if let Err(err) = inspector.signal_group(pgid, Signal::Terminate) {
        trace!("no orphans left in group {}: {}", pgid, err);
        return;
    }
    debug!("terminated orphans of group {}", pgid);
    tokio::time::sleep(grace).await;
    if inspector.signal_group(pgid, Signal::Kill).is_ok() {
        info!("force killed orphans of group {}", pgid);
    }
}

fn deliver(inspector: &dyn ProcessInspector, pid: u32, signal: Signal) {
    match inspector.signal(pid, signal) {
        Ok(()) => debug!("sent {:?} to pid {}", signal, pid),
        Err(err) => debug!("{:?} to pid {} not delivered: {}", signal, pid, err),
    }
}

fn deliver_group(inspector: &dyn ProcessInspector, pgid: u32, signal: Signal) {
    if let Err(err) = inspector.signal_group(pgid, signal) {
        trace!("{:?} to group {} not delivered: {}", signal, pgid, err);
    }
}

/// Formats seconds as `Nw Nd Nh Nm Ns`, omitting leading zero units.
pub fn format_uptime(seconds: u64) -> String {
    let weeks = seconds / 604_800;
    let days = (seconds % 604_800) / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;

    let units = [(weeks, 'w'), (days, 'd'), (hours, 'h'), (minutes, 'm')];
    let mut parts = Vec::new();
    let mut leading = true;
    for (value, unit) in units {
        if leading && value == 0 {
            continue;
        }
        leading = false;
        parts.push(format!("{}{}", value, unit));
    }
    parts.push(format!("{}s", secs));
    parts.join(" ")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Inspector serving scripted tables and recording every signal.
    pub(crate) struct FakeInspector {
        tables: Mutex<VecDeque<ProcessTable>>,
        pub signals: Mutex<Vec<(u32, Signal)>>,
        pub group_signals: Mutex<Vec<(u32, Signal)>>,
        /// When false, group signals fail as if the group were empty.
        pub group_alive: bool,
    }

    impl FakeInspector {
        pub(crate) fn new(tables: Vec<ProcessTable>) -> Self {
            Self {
                tables: Mutex::new(tables.into()),
                signals: Mutex::new(Vec::new()),
                group_signals: Mutex::new(Vec::new()),
                group_alive: true,
            }
        }
    }

    #[async_trait]
    impl ProcessInspector for FakeInspector {
        async fn snapshot(&self) -> Result<ProcessTable> {
            let mut tables = self.tables.lock();
            // The last scripted table keeps being served.
            if tables.len() > 1 {
                Ok(tables.pop_front().unwrap_or_default())
            } else {
                tables
                    .front()
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("no table"))
            }
        }

        fn signal(&self, pid: u32, signal: Signal) -> std::io::Result<()> {
            self.signals.lock().push((pid, signal));
            Ok(())
        }

        fn signal_group(&self, pgid: u32, signal: Signal) -> std::io::Result<()> {
            if !self.group_alive {
                return Err(std::io::ErrorKind::NotFound.into());
            }
            self.group_signals.lock().push((pgid, signal));
            Ok(())
        }
    }

    pub(crate) fn row(pid: u32, ppid: u32, cpu: f64, memory: f64) -> ProcessRow {
        ProcessRow {
            pid,
            ppid,
            cpu,
            memory,
            started: 1_000,
        }
    }

    fn sample_tree() -> ProcessTable {
        // 100 -> 101 -> 103, 100 -> 102, unrelated 200 -> 201
        ProcessTable::from_rows([
            row(1, 0, 0.0, 0.1),
            row(100, 1, 1.5, 2.0),
            row(101, 100, 10.0, 1.0),
            row(102, 100, 0.5, 0.5),
            row(103, 101, 3.0, 0.25),
            row(200, 1, 50.0, 5.0),
            row(201, 200, 5.0, 1.0),
        ])
    }

    #[test]
    fn descendants_are_transitive() {
        let table = sample_tree();
        assert_eq!(table.descendants(100), vec![101, 102, 103]);
        assert_eq!(table.descendants(103), Vec::<u32>::new());
        assert_eq!(table.descendants(999), Vec::<u32>::new());
    }

    #[test]
    fn metrics_sum_the_tree() {
        let table = sample_tree();
        let stats = table.metrics(100, Instant::now());
        assert!((stats.cpu - 15.0).abs() < 1e-9);
        assert!((stats.memory - 3.75).abs() < 1e-9);
        assert_eq!(stats.uptime, "0s");
    }

    #[test]
    fn metrics_zeroed_for_vanished_root() {
        let table = sample_tree();
        assert_eq!(table.metrics(4242, Instant::now()), ProcessStats::zeroed());
    }

    #[test]
    fn liveness_checks_start_time() {
        let table = sample_tree();
        assert!(table.is_alive(101, Some(1_000)));
        assert!(table.is_alive(101, None));
        assert!(!table.is_alive(101, Some(2_000)));
        assert!(!table.is_alive(999, None));
    }

    #[tokio::test]
    async fn system_snapshot_sees_this_process() {
        let inspector = SystemInspector::new();
        let table = inspector.snapshot().await.unwrap();
        let me = std::process::id();
        assert!(table.is_alive(me, None));
        assert!(table.started(me).unwrap() > 0);
        let stats = table.metrics(me, Instant::now());
        assert!(stats.memory > 0.0);
    }

    #[tokio::test]
    async fn aggregate_metrics_zeroed_when_inspection_fails() {
        let inspector = FakeInspector::new(Vec::new());
        let stats = aggregate_metrics(&inspector, 100, Instant::now()).await;
        assert_eq!(stats, ProcessStats::zeroed());
        assert!(enumerate_descendants(&inspector, 100).await.is_empty());
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(0), "0s");
        assert_eq!(format_uptime(59), "59s");
        assert_eq!(format_uptime(60), "1m 0s");
        assert_eq!(format_uptime(3_661), "1h 1m 1s");
        assert_eq!(format_uptime(86_400), "1d 0h 0m 0s");
        assert_eq!(format_uptime(604_800 + 5), "1w 0d 0h 0m 5s");
    }

    #[tokio::test]
    async fn kill_tree_terminates_all_before_killing_survivors() {
        let before = sample_tree();
        // After the grace period only 103 and the root are still around.
        let after = ProcessTable::from_rows([
            row(1, 0, 0.0, 0.1),
            row(100, 1, 0.0, 0.0),
            row(103, 1, 0.0, 0.0),
            row(200, 1, 0.0, 0.0),
        ]);
        let inspector = FakeInspector::new(vec![before, after]);
        kill_tree(&inspector, 100, Duration::from_millis(5)).await;

        let signals = inspector.signals.lock().clone();
        let first_kill = signals
            .iter()
            .position(|(_, s)| *s == Signal::Kill)
            .unwrap();
        let terms: Vec<u32> = signals[..first_kill].iter().map(|(pid, _)| *pid).collect();
        assert_eq!(terms, vec![101, 102, 103, 100]);
        assert!(signals[..first_kill]
            .iter()
            .all(|(_, s)| *s == Signal::Terminate));

        let mut kills: Vec<u32> = signals[first_kill..].iter().map(|(pid, _)| *pid).collect();
        kills.sort_unstable();
        assert_eq!(kills, vec![100, 103]);

        let groups = inspector.group_signals.lock().clone();
        assert_eq!(groups, vec![(100, Signal::Terminate), (100, Signal::Kill)]);
    }

    #[tokio::test]
    async fn kill_tree_spares_reused_pids() {
        let before = sample_tree();
        // 103 died during the grace period and its pid went to an unrelated process.
        let mut reused = row(103, 1, 0.0, 0.0);
        reused.started = 5_000;
        let after = ProcessTable::from_rows([row(1, 0, 0.0, 0.1), row(101, 1, 0.0, 0.0), reused]);
        let inspector = FakeInspector::new(vec![before, after]);
        kill_tree(&inspector, 100, Duration::from_millis(1)).await;

        let kills: Vec<u32> = inspector
            .signals
            .lock()
            .iter()
            .filter(|(_, s)| *s == Signal::Kill)
            .map(|(pid, _)| *pid)
            .collect();
        assert_eq!(kills, vec![101]);
    }

    #[tokio::test]
    async fn kill_tree_tolerates_missing_process() {
        let table = ProcessTable::from_rows([row(1, 0, 0.0, 0.0)]);
        let mut inspector = FakeInspector::new(vec![table]);
        inspector.group_alive = false;
        kill_tree(&inspector, 100, Duration::from_millis(1)).await;
        let signals = inspector.signals.lock().clone();
        assert_eq!(signals, vec![(100, Signal::Terminate)]);
    }

    #[tokio::test]
    async fn kill_orphans_only_signals_the_group() {
        let inspector = FakeInspector::new(Vec::new());
        kill_orphans(&inspector, 100, Duration::from_millis(1)).await;
        assert!(inspector.signals.lock().is_empty());
        assert_eq!(
            inspector.group_signals.lock().clone(),
            vec![(100, Signal::Terminate), (100, Signal::Kill)]
        );
    }

    #[tokio::test]
    async fn kill_orphans_returns_early_for_empty_group() {
        let mut inspector = FakeInspector::new(Vec::new());
        inspector.group_alive = false;
        let begun = Instant::now();
        kill_orphans(&inspector, 100, Duration::from_secs(5)).await;
        assert!(begun.elapsed() < Duration::from_secs(1));
        assert!(inspector.group_signals.lock().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn refuses_own_and_group_targets() {
        assert!(send_os_signal(0, Signal::Terminate).is_err());
        assert!(send_os_signal(std::process::id(), Signal::Terminate).is_err());
        assert!(send_group_signal(1, Signal::Terminate).is_err());
        let own_group = unsafe { libc::getpgrp() } as u32;
        assert!(send_group_signal(own_group, Signal::Terminate).is_err());
    }
}
