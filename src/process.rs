//! Data structures for tracking project state.
//!
//! This module defines the configured unit of work (`Project`), the record tying a
//! project to a live OS process (`RunningProcess`), its per-project lifecycle (`Phase`)
//! and the health and resource figures reported to observers.

use std::time::Instant;

use serde::Serialize;

/// A configured unit of work. Owned by the project store; the supervisor never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Stable identifier.
    pub id: String,
    /// Friendly name.
    pub name: String,
    /// Working directory.
    pub path: String,
    /// Shell command line.
    pub command: String,
    /// Start when the supervisor boots.
    pub auto_restart: bool,
    /// Send a crash alert when the process crashes.
    pub email_on_crash: bool,
    /// Tags for grouping.
    pub tags: Vec<String>,
}

/// Externally visible status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Running,
    Stopped,
    Restarting,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Running => "running",
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Restarting => "restarting",
        }
    }
}

/// A live OS process launched for a project.
#[derive(Debug, Clone)]
pub struct RunningProcess {
    /// Identifies the launch this record belongs to.
    pub run_id: u64,
    /// Process ID of the shell running the command.
    pub pid: u32,
    /// Time when the process started.
    pub started_at: Instant,
    /// The shell has been reaped; orphan cleanup and output draining are still running.
    pub exited: bool,
}

/// Lifecycle of a single project.
///
/// `Restarting` is an overlay: it carries the process until the restart tears it down,
/// and while it is set no "stopped" status is published for the project.
#[derive(Debug, Clone)]
pub enum Phase {
    Stopped,
    Running(RunningProcess),
    /// An explicit stop is tearing the process tree down.
    Stopping,
    Restarting(Option<RunningProcess>),
}

impl Phase {
    /// The running process, if the phase holds one.
    pub fn process(&self) -> Option<&RunningProcess> {
        match self {
            Phase::Running(process) | Phase::Restarting(Some(process)) => Some(process),
            _ => None,
        }
    }

    pub fn process_mut(&mut self) -> Option<&mut RunningProcess> {
        match self {
            Phase::Running(process) | Phase::Restarting(Some(process)) => Some(process),
            _ => None,
        }
    }

    pub fn is_restarting(&self) -> bool {
        matches!(self, Phase::Restarting(_))
    }

    /// Status as shown in project listings.
    pub fn status(&self) -> ProjectStatus {
        match self {
            Phase::Running(_) => ProjectStatus::Running,
            Phase::Stopped | Phase::Stopping => ProjectStatus::Stopped,
            Phase::Restarting(_) => ProjectStatus::Restarting,
        }
    }
}

/// Aggregated resource usage of a process tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStats {
    /// Sum of CPU percentages across the tree.
    pub cpu: f64,
    /// Sum of memory percentages across the tree.
    pub memory: f64,
    /// Human-readable uptime, e.g. `1d 0h 3m 12s`.
    pub uptime: String,
}

impl ProcessStats {
    pub fn zeroed() -> Self {
        Self {
            cpu: 0.0,
            memory: 0.0,
            uptime: "0s".to_string(),
        }
    }
}

/// On-demand sample of a running project's process tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeSample {
    pub stats: ProcessStats,
    /// The shell pid followed by its descendants.
    pub pids: Vec<u32>,
}

/// Details of the most recent crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrashInfo {
    /// ISO-8601 time of the crash.
    pub time: String,
    pub code: i32,
    pub reason: String,
}

/// Crash bookkeeping for a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    /// Number of crashes since the supervisor started. Never decreases.
    pub crash_count: u32,
    pub last_crash: Option<CrashInfo>,
}

impl HealthRecord {
    /// Records a crash with the given exit code.
    pub fn record_crash(&mut self, code: i32, time: String) {
        self.crash_count = self.crash_count.saturating_add(1);
        self.last_crash = Some(CrashInfo {
            time,
            code,
            reason: format!("Exited with code {}", code),
        });
    }
}

/// An exit code counts as a crash when it is present and nonzero.
///
/// A missing code means the process was terminated by a signal.
pub fn is_crash(code: Option<i32>) -> bool {
    matches!(code, Some(code) if code != 0)
}

/// A project together with its live state, as returned by listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectView {
    #[serde(flatten)]
    pub project: Project,
    pub status: ProjectStatus,
    pub stats: ProcessStats,
    pub health: HealthRecord,
}
