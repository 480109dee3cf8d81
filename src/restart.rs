//! Grouped restarts.
//!
//! A project being restarted is marked before its process is stopped and stays marked
//! until the relaunch, so observers see "restarting" followed by "running" and never an
//! intermediate "stopped".

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::SupervisorError;
use crate::process::{Phase, ProjectStatus};
use crate::runner::{LaunchMode, Supervisor};

impl Supervisor {
    /// Stops the project if it runs, waits for the settle delay and launches it again.
    pub async fn restart(&self, project_id: &str) -> Result<u32, SupervisorError> {
        let project = self.project(project_id)?;
        self.mark_restarting(project_id)?;
        info!("restarting project {}", project_id);

        match self.stop(project_id, true).await {
            Ok(()) | Err(SupervisorError::NotRunning) => {}
            Err(err) => warn!("stop during restart of {} failed: {}", project_id, err),
        }
        tokio::time::sleep(self.timings().restart_settle).await;
        self.launch(&project, LaunchMode::Restart)
    }

    fn mark_restarting(&self, project_id: &str) -> Result<(), SupervisorError> {
        let inner = &self.inner;
        let mut slots = inner.slots.lock();
        let slot = slots.entry(project_id.to_string()).or_default();
        slot.phase = match std::mem::replace(&mut slot.phase, Phase::Stopped) {
            Phase::Running(process) => Phase::Restarting(Some(process)),
            Phase::Stopped | Phase::Stopping => Phase::Restarting(None),
            current @ Phase::Restarting(_) => {
                slot.phase = current;
                return Err(SupervisorError::RestartInProgress);
            }
        };
        inner.telemetry.publish_status(
            project_id,
            ProjectStatus::Restarting,
            None,
            Some(slot.health.clone()),
        );
        Ok(())
    }

    /// Restarts every running project together. Returns how many were relaunched.
    ///
    /// Stopped projects are left alone. All stops run concurrently and share a single
    /// settle delay before the relaunches.
    pub async fn restart_all(&self) -> Result<usize, SupervisorError> {
        let projects = self.inner.store.projects()?;

        let marked: Vec<_> = {
            let mut slots = self.inner.slots.lock();
            projects
                .into_iter()
                .filter(|project| {
                    let Some(slot) = slots.get_mut(&project.id) else {
                        return false;
                    };
                    slot.phase = match std::mem::replace(&mut slot.phase, Phase::Stopped) {
                        Phase::Running(process) => Phase::Restarting(Some(process)),
                        other => {
                            slot.phase = other;
                            return false;
                        }
                    };
                    self.inner.telemetry.publish_status(
                        &project.id,
                        ProjectStatus::Restarting,
                        None,
                        Some(slot.health.clone()),
                    );
                    true
                })
                .collect()
        };
        if marked.is_empty() {
            info!("restart all: nothing running");
            return Ok(0);
        }
        info!("restarting {} projects", marked.len());

        let mut stops = JoinSet::new();
        for project in &marked {
            let supervisor = self.clone();
            let project_id = project.id.clone();
            stops.spawn(async move {
                if let Err(err) = supervisor.stop(&project_id, true).await {
                    warn!("stop during restart of {} failed: {}", project_id, err);
                }
            });
        }
        while stops.join_next().await.is_some() {}

        tokio::time::sleep(self.timings().restart_settle).await;

        let mut restarted = 0;
        for project in &marked {
            match self.launch(project, LaunchMode::Restart) {
                Ok(_) => restarted += 1,
                Err(err) => error!("failed to relaunch {}: {}", project.id, err),
            }
        }
        Ok(restarted)
    }
}
