//! Event definitions published to observers.
//!
//! Status events fan out to every status observer; log events are routed to the
//! observers of a single project. Both serialize to the JSON shapes sent over the
//! control surface.

use serde::Serialize;

use crate::output::LogLine;
use crate::process::{HealthRecord, ProcessStats, ProjectStatus};

/// A status change or stats refresh for one project.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub project_id: String,
    pub status: ProjectStatus,
    pub stats: Option<ProcessStats>,
    pub health: Option<HealthRecord>,
}

/// Envelope for events on the status stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    StatusUpdate(StatusUpdate),
}

impl StatusEvent {
    pub fn update(&self) -> &StatusUpdate {
        match self {
            StatusEvent::StatusUpdate(update) => update,
        }
    }
}

/// A captured line as delivered to log observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub text: String,
    pub timestamp: String,
}

impl From<&LogLine> for LogEvent {
    fn from(line: &LogLine) -> Self {
        Self {
            text: line.text.clone(),
            timestamp: line.timestamp.clone(),
        }
    }
}
