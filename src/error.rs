//! Errors returned synchronously by supervisor operations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Project not found: {0}")]
    UnknownProject(String),
    #[error("Project already running")]
    AlreadyRunning,
    #[error("Project not running")]
    NotRunning,
    #[error("Project is restarting")]
    RestartInProgress,
    #[error("Failed to launch project: {0}")]
    Launch(#[from] std::io::Error),
    #[error("Project store unavailable: {0}")]
    Store(String),
}

impl From<anyhow::Error> for SupervisorError {
    fn from(err: anyhow::Error) -> Self {
        SupervisorError::Store(format!("{:#}", err))
    }
}
