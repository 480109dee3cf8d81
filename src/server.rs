//! Remote control surface.
//!
//! Clients connect over TCP and send one JSON request per line. Command actions get a
//! single JSON reply line. The two subscribe actions turn the connection into an event
//! stream that lasts until the client disconnects.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

use crate::error::SupervisorError;
use crate::events::LogEvent;
use crate::output::local_timestamp;
use crate::process::{ProcessStats, ProjectStatus, ProjectView};
use crate::runner::Supervisor;

const NO_LOGS_YET: &str = "No logs available yet. Waiting for output...";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Start {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    Stop {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    Restart {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    RestartAll,
    ClearLogs {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    Status {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    List,
    Delete {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    Reload,
    SubscribeStatus,
    SubscribeLogs {
        #[serde(rename = "projectId")]
        project_id: String,
    },
}

/// Reply to a command action.
#[derive(Debug, Clone, Serialize)]
pub struct ControlReply {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ProjectStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ProcessStats>,
    /// Shell pid followed by its descendants.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projects: Option<Vec<ProjectView>>,
}

impl ControlReply {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            pid: None,
            status: None,
            stats: None,
            pids: None,
            projects: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(message)
        }
    }
}

impl From<SupervisorError> for ControlReply {
    fn from(err: SupervisorError) -> Self {
        Self::failed(err.to_string())
    }
}

/// Accepts control connections until the listener fails permanently.
pub async fn serve(listener: TcpListener, supervisor: Supervisor) -> Result<()> {
    info!("control surface listening on {}", listener.local_addr()?);
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("control connection from {}", addr);
                tokio::spawn(handle_connection(stream, supervisor.clone()));
            }
            Err(err) => {
                error!("failed to accept control connection: {}", err);
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, supervisor: Supervisor) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("error reading from {}: {}", peer, err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let reply = ControlReply::failed(format!("Invalid request: {}", err));
                if send(&mut writer, &reply).await.is_err() {
                    break;
                }
                continue;
            }
        };
        debug!("request from {}: {:?}", peer, request);

        let outcome = match request {
            Request::SubscribeStatus => stream_status(&supervisor, &mut writer, &mut lines).await,
            Request::SubscribeLogs { project_id } => {
                stream_logs(&supervisor, &project_id, &mut writer, &mut lines).await
            }
            request => {
                let reply = dispatch(&supervisor, request).await;
                send(&mut writer, &reply).await
            }
        };
        if let Err(err) = outcome {
            debug!("connection {} closed: {}", peer, err);
            break;
        }
    }
    debug!("control client {} disconnected", peer);
}

type Lines = tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>;

async fn stream_status(
    supervisor: &Supervisor,
    writer: &mut OwnedWriteHalf,
    lines: &mut Lines,
) -> Result<()> {
    let mut observer = supervisor.subscribe_status();
    debug!("status subscriber joined, {} watching", supervisor.status_observers());
    loop {
        tokio::select! {
            event = observer.recv() => match event {
                Some(event) => {
                    trace!("status event for {}", event.update().project_id);
                    send(writer, &event).await?
                }
                None => return Ok(()),
            },
            line = lines.next_line() => {
                // Anything but more input ends the subscription.
                if !matches!(line, Ok(Some(_))) {
                    anyhow::bail!("status subscriber went away");
                }
            }
        }
    }
}

async fn stream_logs(
    supervisor: &Supervisor,
    project_id: &str,
    writer: &mut OwnedWriteHalf,
    lines: &mut Lines,
) -> Result<()> {
    let mut observer = match supervisor.subscribe_log(project_id) {
        Ok(observer) => observer,
        Err(err) => return send(writer, &ControlReply::from(err)).await,
    };
    if observer.replayed() == 0 {
        let placeholder = LogEvent {
            text: NO_LOGS_YET.to_string(),
            timestamp: local_timestamp(),
        };
        send(writer, &placeholder).await?;
    }
    loop {
        tokio::select! {
            event = observer.recv() => match event {
                Some(event) => send(writer, &event).await?,
                None => return Ok(()),
            },
            line = lines.next_line() => {
                if !matches!(line, Ok(Some(_))) {
                    anyhow::bail!("log subscriber went away");
                }
            }
        }
    }
}

async fn send<T: Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> Result<()> {
    let mut payload = serde_json::to_vec(value)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    Ok(())
}

/// Executes a command action and builds its reply.
pub async fn dispatch(supervisor: &Supervisor, request: Request) -> ControlReply {
    match request {
        Request::Start { project_id } => match supervisor.start(&project_id) {
            Ok(pid) => ControlReply {
                pid: Some(pid),
                ..ControlReply::ok("Project started")
            },
            Err(err) => err.into(),
        },
        Request::Stop { project_id } => match supervisor.stop(&project_id, false).await {
            Ok(()) => ControlReply::ok("Project stopped"),
            Err(err) => err.into(),
        },
        Request::Restart { project_id } => match supervisor.restart(&project_id).await {
            Ok(pid) => ControlReply {
                pid: Some(pid),
                ..ControlReply::ok("Project restarted")
            },
            Err(err) => err.into(),
        },
        Request::RestartAll => match supervisor.restart_all().await {
            Ok(count) => ControlReply::ok(format!("Restarted {} projects", count)),
            Err(err) => err.into(),
        },
        Request::ClearLogs { project_id } => {
            supervisor.clear_logs(&project_id);
            ControlReply::ok("Logs cleared")
        }
        Request::Status { project_id } => {
            let status = supervisor.query_status(&project_id);
            let sample = supervisor.inspect(&project_id).await;
            ControlReply {
                status: Some(status),
                stats: sample.as_ref().map(|sample| sample.stats.clone()),
                pids: sample.map(|sample| sample.pids),
                ..ControlReply::ok(status.as_str())
            }
        }
        Request::List => match supervisor.list() {
            Ok(projects) => ControlReply {
                projects: Some(projects),
                ..ControlReply::ok("Projects listed")
            },
            Err(err) => err.into(),
        },
        Request::Delete { project_id } => match supervisor.delete(&project_id).await {
            Ok(()) => ControlReply::ok("Project deleted"),
            Err(err) => err.into(),
        },
        Request::Reload => match supervisor.reload() {
            Ok(count) => ControlReply::ok(format!("Reloaded {} projects", count)),
            Err(err) => err.into(),
        },
        Request::SubscribeStatus | Request::SubscribeLogs { .. } => {
            ControlReply::failed("Subscriptions are only available on a live connection")
        }
    }
}
