//! Periodic resource sampling.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::process::{ProcessStats, ProjectStatus};
use crate::runner::Supervisor;

/// Samples every running project each `period` until the task is aborted.
pub fn spawn_stats_poller(supervisor: Supervisor, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            supervisor.refresh_stats().await;
        }
    })
}

impl Supervisor {
    /// Takes one process-table snapshot and publishes fresh stats for every running project.
    pub async fn refresh_stats(&self) {
        let running: Vec<(String, u64)> = {
            let slots = self.inner.slots.lock();
            slots
                .iter()
                .filter_map(|(id, slot)| slot.phase.process().map(|p| (id.clone(), p)))
                .filter(|(_, process)| !process.exited)
                .map(|(id, process)| (id, process.run_id))
                .collect()
        };
        if running.is_empty() {
            return;
        }

        let table = match self.inner.inspector.snapshot().await {
            Ok(table) => Some(table),
            Err(err) => {
                debug!("process inspection failed: {:#}", err);
                None
            }
        };

        let mut slots = self.inner.slots.lock();
        for (project_id, run_id) in running {
            let Some(slot) = slots.get_mut(&project_id) else {
                continue;
            };
            // Skip processes that exited or were replaced since the snapshot.
            let Some(process) = slot.phase.process().filter(|p| p.run_id == run_id && !p.exited)
            else {
                continue;
            };
            let stats = match &table {
                Some(table) => table.metrics(process.pid, process.started_at),
                None => ProcessStats::zeroed(),
            };
            slot.stats = Some(stats.clone());
            let status = slot.phase.status();
            if status != ProjectStatus::Running {
                continue;
            }
            self.inner.telemetry.publish_status(
                &project_id,
                ProjectStatus::Running,
                Some(stats),
                Some(slot.health.clone()),
            );
        }
    }
}
