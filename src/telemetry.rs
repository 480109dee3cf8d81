//! Fan-out of status and log events to observers.
//!
//! Status events go to every status observer through a broadcast channel. Log lines are
//! appended to the project's ring buffer and forwarded to that project's observers under
//! the same lock, so a late subscriber gets the full ring followed by live lines with
//! nothing lost or repeated in between.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::events::{LogEvent, StatusEvent, StatusUpdate};
use crate::output::{LogBuffer, LogLine};
use crate::process::{HealthRecord, ProcessStats, ProjectStatus};

struct ProjectLog {
    ring: LogBuffer,
    observers: Vec<mpsc::UnboundedSender<LogEvent>>,
}

impl ProjectLog {
    fn new(max_lines: usize) -> Self {
        Self {
            ring: LogBuffer::new(max_lines),
            observers: Vec::new(),
        }
    }
}

/// Owner of the log rings and the observer registry.
pub struct Telemetry {
    status_tx: broadcast::Sender<StatusEvent>,
    logs: Mutex<HashMap<String, ProjectLog>>,
    max_lines: usize,
}

impl Telemetry {
    pub fn new(max_lines: usize, status_buffer: usize) -> Self {
        let (status_tx, _) = broadcast::channel(status_buffer.max(1));
        Self {
            status_tx,
            logs: Mutex::new(HashMap::new()),
            max_lines: max_lines.max(1),
        }
    }

    /// Sends a status event to every status observer.
    pub fn publish_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
        stats: Option<ProcessStats>,
        health: Option<HealthRecord>,
    ) {
        let event = StatusEvent::StatusUpdate(StatusUpdate {
            project_id: project_id.to_string(),
            status,
            stats,
            health,
        });
        // No receivers is not an error.
        let _ = self.status_tx.send(event);
    }

    /// Appends a line to the project's ring and forwards it to its log observers.
    pub fn capture_line(&self, project_id: &str, line: LogLine) {
        let mut logs = self.logs.lock();
        let log = logs
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectLog::new(self.max_lines));
        let event = LogEvent::from(&line);
        log.ring.push(line);
        log.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Empties the project's ring. Observers stay subscribed.
    pub fn clear(&self, project_id: &str) {
        if let Some(log) = self.logs.lock().get_mut(project_id) {
            if !log.ring.is_empty() {
                debug!("clearing {} log lines of {}", log.ring.len(), project_id);
                log.ring.clear();
            }
        }
    }

    /// Drops the ring and disconnects every log observer of the project.
    pub fn remove_project(&self, project_id: &str) {
        self.logs.lock().remove(project_id);
    }

    /// Up to `count` most recent lines, oldest first.
    pub fn tail(&self, project_id: &str, count: usize) -> Vec<LogLine> {
        self.logs
            .lock()
            .get(project_id)
            .map(|log| log.ring.tail(count))
            .unwrap_or_default()
    }

    pub fn subscribe_status(&self) -> StatusObserver {
        StatusObserver {
            rx: self.status_tx.subscribe(),
        }
    }

    /// Number of projects with a log ring.
    #[cfg(test)]
    pub fn tracked_projects(&self) -> usize {
        self.logs.lock().len()
    }

    /// Subscribes to one project's log: the current ring is queued first, then live lines.
    pub fn subscribe_log(&self, project_id: &str) -> LogObserver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut logs = self.logs.lock();
        let log = logs
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectLog::new(self.max_lines));
        let replayed = log.ring.len();
        for line in log.ring.iter() {
            let _ = tx.send(LogEvent::from(line));
        }
        log.observers.push(tx);
        LogObserver { rx, replayed }
    }

    pub fn status_observer_count(&self) -> usize {
        self.status_tx.receiver_count()
    }
}

/// Receives every status event published after it was created.
pub struct StatusObserver {
    rx: broadcast::Receiver<StatusEvent>,
}

impl StatusObserver {
    /// Next event, or `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("status observer lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Receives one project's ring replay followed by its live log lines.
pub struct LogObserver {
    rx: mpsc::UnboundedReceiver<LogEvent>,
    replayed: usize,
}

impl LogObserver {
    /// Number of lines queued as replay at subscription time.
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    /// Next line, or `None` once the project was removed.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<LogEvent> {
        self.rx.try_recv().ok()
    }
}
