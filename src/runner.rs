//! Process execution and lifecycle management.
//!
//! This module contains the `Supervisor`, which launches project commands through a
//! shell, captures their output, tears down their process trees, and classifies exits
//! as clean stops or crashes. All per-project state lives in one map behind a single
//! mutex; every transition checks and updates it without awaiting in between.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{SupervisorConfig, Timings};
use crate::error::SupervisorError;
use crate::notify::{CrashNotifier, CrashReport};
use crate::output::{read_lines, LogLine};
use crate::process::{
    is_crash, HealthRecord, Phase, ProcessStats, Project, ProjectStatus, ProjectView,
    RunningProcess, TreeSample,
};
use crate::store::ProjectStore;
use crate::telemetry::{LogObserver, StatusObserver, Telemetry};
use crate::tree::{
    aggregate_metrics, enumerate_descendants, kill_orphans, kill_tree, ProcessInspector,
};

/// Tunables for a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub timings: Timings,
    pub max_log_lines: usize,
    pub crash_log_lines: usize,
    pub strip_ansi: bool,
    pub event_buffer: usize,
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            timings: config.timings(),
            max_log_lines: config.max_log_lines,
            crash_log_lines: config.crash_log_lines,
            strip_ansi: config.strip_ansi,
            event_buffer: config.event_buffer,
        }
    }
}

/// Per-project bookkeeping.
pub(crate) struct Slot {
    pub(crate) phase: Phase,
    /// Most recent stats, cleared when the process goes away.
    pub(crate) stats: Option<ProcessStats>,
    pub(crate) health: HealthRecord,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            phase: Phase::Stopped,
            stats: None,
            health: HealthRecord::default(),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn ProjectStore>,
    pub(crate) inspector: Arc<dyn ProcessInspector>,
    pub(crate) notifier: Arc<dyn CrashNotifier>,
    pub(crate) telemetry: Telemetry,
    pub(crate) slots: Mutex<HashMap<String, Slot>>,
    pub(crate) settings: SupervisorSettings,
    next_run: AtomicU64,
}

/// Whether a launch belongs to a restart sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LaunchMode {
    Fresh,
    Restart,
}

/// Supervises the processes of every configured project. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    pub(crate) inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        inspector: Arc<dyn ProcessInspector>,
        notifier: Arc<dyn CrashNotifier>,
        settings: SupervisorSettings,
    ) -> Self {
        let telemetry = Telemetry::new(settings.max_log_lines, settings.event_buffer);
        Self {
            inner: Arc::new(Inner {
                store,
                inspector,
                notifier,
                telemetry,
                slots: Mutex::new(HashMap::new()),
                settings,
                next_run: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn timings(&self) -> Timings {
        self.inner.settings.timings
    }

    /// Resolves a project record or fails with `UnknownProject`.
    pub(crate) fn project(&self, project_id: &str) -> Result<Project, SupervisorError> {
        self.inner
            .store
            .project(project_id)?
            .ok_or_else(|| SupervisorError::UnknownProject(project_id.to_string()))
    }

    /// Launches the project's command. Returns the pid of the shell.
    pub fn start(&self, project_id: &str) -> Result<u32, SupervisorError> {
        let project = self.project(project_id)?;
        self.launch(&project, LaunchMode::Fresh)
    }

    pub(crate) fn launch(&self, project: &Project, mode: LaunchMode) -> Result<u32, SupervisorError> {
        let inner = &self.inner;
        let mut slots = inner.slots.lock();
        if mode == LaunchMode::Restart && !slots.contains_key(&project.id) {
            // Deleted while the restart was settling.
            return Err(SupervisorError::UnknownProject(project.id.clone()));
        }
        let slot = slots.entry(project.id.clone()).or_default();
        match (&slot.phase, mode) {
            (Phase::Stopped, _) | (Phase::Restarting(None), LaunchMode::Restart) => {}
            (Phase::Restarting(_), LaunchMode::Fresh) => {
                return Err(SupervisorError::RestartInProgress)
            }
            _ => return Err(SupervisorError::AlreadyRunning),
        }

        info!("executing `{}` in {}", project.command, project.path);
        let mut command = shell_command(&project.command);
        command
            .current_dir(&project.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                if mode == LaunchMode::Restart {
                    slot.phase = Phase::Stopped;
                }
                drop(slots);
                error!("failed to start project {}: {}", project.id, err);
                inner
                    .telemetry
                    .capture_line(&project.id, LogLine::now(format!("\nError: {}\n", err)));
                return Err(SupervisorError::Launch(err));
            }
        };

        let pid = child.id().unwrap_or(0);
        let run_id = inner.next_run.fetch_add(1, Ordering::Relaxed);
        slot.phase = Phase::Running(RunningProcess {
            run_id,
            pid,
            started_at: Instant::now(),
            exited: false,
        });
        slot.stats = Some(ProcessStats::zeroed());
        inner.telemetry.publish_status(
            &project.id,
            ProjectStatus::Running,
            Some(ProcessStats::zeroed()),
            Some(slot.health.clone()),
        );
        drop(slots);

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(&project.id, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(&project.id, stderr));
        }
        tokio::spawn(self.clone().watch_exit(project.clone(), run_id, pid, child, readers));

        info!("project {} started with pid {}", project.id, pid);
        Ok(pid)
    }

    fn spawn_reader<R>(&self, project_id: &str, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            let strip_ansi = inner.settings.strip_ansi;
            read_lines(reader, strip_ansi, |text| {
                inner.telemetry.capture_line(&project_id, LogLine::now(text))
            })
            .await;
        })
    }

    async fn watch_exit(
        self,
        project: Project,
        run_id: u64,
        pid: u32,
        mut child: Child,
        readers: Vec<JoinHandle<()>>,
    ) {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(err) => {
                warn!("failed to wait on project {}: {}", project.id, err);
                None
            }
        };
        self.handle_exit(&project, run_id, pid, code, readers).await;
    }

    async fn handle_exit(
        &self,
        project: &Project,
        run_id: u64,
        pid: u32,
        code: Option<i32>,
        readers: Vec<JoinHandle<()>>,
    ) {
        let inner = &self.inner;
        let grace = inner.settings.timings.kill_grace;

        // Only an exit of the registered launch is spontaneous; anything else was stopped.
        // The process stays registered until its group is cleaned up and its output drained.
        let spontaneous = {
            let mut slots = inner.slots.lock();
            let Some(slot) = slots.get_mut(&project.id) else {
                return;
            };
            match slot.phase.process_mut().filter(|p| p.run_id == run_id) {
                Some(process) => {
                    process.exited = true;
                    if is_crash(code) {
                        let code = code.unwrap_or_default();
                        slot.health.record_crash(code, iso_now());
                        warn!(
                            "project {} crashed (exit code {}, {} total)",
                            project.id, code, slot.health.crash_count
                        );
                    }
                    true
                }
                None => false,
            }
        };

        let drain = async {
            let deadline = tokio::time::Instant::now() + grace;
            for reader in readers {
                if tokio::time::timeout_at(deadline, reader).await.is_err() {
                    debug!("output of project {} still open after exit", project.id);
                    break;
                }
            }
        };
        if spontaneous {
            tokio::join!(kill_orphans(&*inner.inspector, pid, grace), drain);
        } else {
            drain.await;
        }
        let exit_line = match code {
            Some(code) => format!("\nProcess exited with code {}\n", code),
            None => "\nProcess exited by signal\n".to_string(),
        };
        inner
            .telemetry
            .capture_line(&project.id, LogLine::now(exit_line));

        if !spontaneous {
            debug!("project {} exited after an explicit stop", project.id);
            return;
        }
        info!("project {} exited with code {:?}", project.id, code);
        if is_crash(code) && project.email_on_crash {
            self.send_crash_report(project, code.unwrap_or_default());
        }

        let mut slots = inner.slots.lock();
        let Some(slot) = slots.get_mut(&project.id) else {
            return;
        };
        // A stop or restart that arrived during cleanup took over the process.
        if slot.phase.process().map(|p| p.run_id) != Some(run_id) {
            return;
        }
        slot.stats = None;
        if slot.phase.is_restarting() {
            slot.phase = Phase::Restarting(None);
            return;
        }
        slot.phase = Phase::Stopped;
        inner.telemetry.publish_status(
            &project.id,
            ProjectStatus::Stopped,
            None,
            Some(slot.health.clone()),
        );
    }

    fn send_crash_report(&self, project: &Project, exit_code: i32) {
        let report = CrashReport {
            project: project.clone(),
            exit_code,
            logs: self
                .inner
                .telemetry
                .tail(&project.id, self.inner.settings.crash_log_lines),
        };
        let notifier = Arc::clone(&self.inner.notifier);
        tokio::spawn(async move {
            let project_id = report.project.id.clone();
            if let Err(err) = notifier.notify(report).await {
                error!("failed to send crash alert for {}: {:#}", project_id, err);
            }
        });
    }

    /// Tears down the project's process tree.
    ///
    /// Publishes "stopped" unless `suppress_broadcast` is set or a restart owns the project.
    pub async fn stop(&self, project_id: &str, suppress_broadcast: bool) -> Result<(), SupervisorError> {
        let inner = &self.inner;
        let process = {
            let mut slots = inner.slots.lock();
            let Some(slot) = slots.get_mut(project_id) else {
                return Err(SupervisorError::NotRunning);
            };
            let process = match std::mem::replace(&mut slot.phase, Phase::Stopped) {
                Phase::Running(process) => {
                    slot.phase = Phase::Stopping;
                    process
                }
                Phase::Restarting(Some(process)) => {
                    slot.phase = Phase::Restarting(None);
                    process
                }
                other => {
                    slot.phase = other;
                    return Err(SupervisorError::NotRunning);
                }
            };
            slot.stats = None;
            process
        };

        info!("stopping project {} (pid {})", project_id, process.pid);
        teardown(&*inner.inspector, &process, inner.settings.timings.kill_grace).await;

        let mut slots = inner.slots.lock();
        if let Some(slot) = slots.get_mut(project_id) {
            if matches!(slot.phase, Phase::Stopping) {
                slot.phase = Phase::Stopped;
                if !suppress_broadcast {
                    inner.telemetry.publish_status(
                        project_id,
                        ProjectStatus::Stopped,
                        None,
                        Some(slot.health.clone()),
                    );
                }
            }
        }
        Ok(())
    }

    /// `Running` while a process is registered for the project, otherwise `Stopped`.
    pub fn query_status(&self, project_id: &str) -> ProjectStatus {
        let slots = self.inner.slots.lock();
        match slots.get(project_id).and_then(|slot| slot.phase.process()) {
            Some(_) => ProjectStatus::Running,
            None => ProjectStatus::Stopped,
        }
    }

    /// Samples the project's process tree on demand. `None` when nothing is running.
    pub async fn inspect(&self, project_id: &str) -> Option<TreeSample> {
        let (pid, started_at) = {
            let slots = self.inner.slots.lock();
            let process = slots.get(project_id)?.phase.process()?;
            if process.exited {
                return None;
            }
            (process.pid, process.started_at)
        };
        let inspector = &*self.inner.inspector;
        let stats = aggregate_metrics(inspector, pid, started_at).await;
        let mut pids = vec![pid];
        pids.extend(enumerate_descendants(inspector, pid).await);
        Some(TreeSample { stats, pids })
    }

    pub fn health(&self, project_id: &str) -> HealthRecord {
        self.inner
            .slots
            .lock()
            .get(project_id)
            .map(|slot| slot.health.clone())
            .unwrap_or_default()
    }

    pub fn clear_logs(&self, project_id: &str) {
        self.inner.telemetry.clear(project_id);
    }

    pub fn subscribe_status(&self) -> StatusObserver {
        self.inner.telemetry.subscribe_status()
    }

    pub fn status_observers(&self) -> usize {
        self.inner.telemetry.status_observer_count()
    }

    /// Log observer for a configured project; unknown ids are rejected.
    pub fn subscribe_log(&self, project_id: &str) -> Result<LogObserver, SupervisorError> {
        self.project(project_id)?;
        Ok(self.inner.telemetry.subscribe_log(project_id))
    }

    /// Every configured project with its live status, stats and health.
    pub fn list(&self) -> Result<Vec<ProjectView>, SupervisorError> {
        let projects = self.inner.store.projects()?;
        let slots = self.inner.slots.lock();
        Ok(projects
            .into_iter()
            .map(|project| {
                let slot = slots.get(&project.id);
                ProjectView {
                    status: slot.map_or(ProjectStatus::Stopped, |s| s.phase.status()),
                    stats: slot
                        .and_then(|s| s.stats.clone())
                        .unwrap_or_else(ProcessStats::zeroed),
                    health: slot.map(|s| s.health.clone()).unwrap_or_default(),
                    project,
                }
            })
            .collect())
    }

    /// Stops the project if needed and forgets its logs, stats and health.
    pub async fn delete(&self, project_id: &str) -> Result<(), SupervisorError> {
        self.project(project_id)?;
        match self.stop(project_id, false).await {
            Ok(()) | Err(SupervisorError::NotRunning) => {}
            Err(err) => return Err(err),
        }
        let crashes = self.health(project_id).crash_count;
        self.inner.slots.lock().remove(project_id);
        self.inner.telemetry.remove_project(project_id);
        self.inner.store.remove(project_id)?;
        info!("project {} deleted ({} crashes forgotten)", project_id, crashes);
        Ok(())
    }

    /// Re-reads project records from the store's source.
    pub fn reload(&self) -> Result<usize, SupervisorError> {
        Ok(self.inner.store.reload()?)
    }

    /// Starts every project flagged `auto_restart`. Returns how many launched.
    pub fn autostart(&self) -> usize {
        let projects = match self.inner.store.projects() {
            Ok(projects) => projects,
            Err(err) => {
                error!("failed to load projects for autostart: {:#}", err);
                return 0;
            }
        };
        let mut started = 0;
        for project in projects.iter().filter(|p| p.auto_restart) {
            info!("auto-starting {}", project.name);
            match self.launch(project, LaunchMode::Fresh) {
                Ok(_) => started += 1,
                Err(err) => warn!("auto-start of {} failed: {}", project.id, err),
            }
        }
        started
    }

    /// Kills every running process tree. Used when the supervisor exits.
    pub async fn shutdown(&self) {
        let processes: Vec<(String, RunningProcess)> = {
            let mut slots = self.inner.slots.lock();
            slots
                .iter_mut()
                .filter_map(|(id, slot)| {
                    let process = match std::mem::replace(&mut slot.phase, Phase::Stopped) {
                        Phase::Running(process) | Phase::Restarting(Some(process)) => process,
                        other => {
                            slot.phase = other;
                            return None;
                        }
                    };
                    slot.stats = None;
                    Some((id.clone(), process))
                })
                .collect()
        };

        let mut kills = JoinSet::new();
        for (project_id, process) in processes {
            let inner = Arc::clone(&self.inner);
            kills.spawn(async move {
                info!("shutting down project {}", project_id);
                teardown(&*inner.inspector, &process, inner.settings.timings.kill_grace).await;
            });
        }
        while kills.join_next().await.is_some() {}
    }
}

/// Kills the process tree, or only what is left of its group once the shell is reaped.
async fn teardown(inspector: &dyn ProcessInspector, process: &RunningProcess, grace: Duration) {
    if process.exited {
        kill_orphans(inspector, process.pid, grace).await;
    } else {
        kill_tree(inspector, process.pid, grace).await;
    }
}

/// Runs the command line through `sh` as the leader of a new process group.
#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }
    command
}

#[cfg(not(unix))]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}

fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
