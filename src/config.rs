//! Configuration management for Pitboss.
//!
//! This module defines the structure of the `pitboss.toml` configuration file
//! and provides functionality to load, validate and parse it.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::output::DEFAULT_MAX_LINES;
use crate::process::Project;

/// Top-level configuration structure corresponding to `pitboss.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Control surface listener settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Timings and buffer sizes used by the supervisor.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Crash alert delivery.
    #[serde(default)]
    pub notifier: NotifierConfig,
    /// List of supervised projects.
    #[serde(default, rename = "project")]
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the control surface binds to.
    pub host: String,
    /// Port the control surface listens on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Period of the stats poller in milliseconds.
    pub stats_interval_ms: u64,
    /// Time between SIGTERM and SIGKILL when tearing down a process tree.
    pub kill_grace_ms: u64,
    /// Pause between teardown and relaunch during a restart.
    pub restart_settle_ms: u64,
    /// Maximum number of log lines kept in memory per project.
    pub max_log_lines: usize,
    /// Number of trailing log lines attached to a crash report.
    pub crash_log_lines: usize,
    /// Whether to strip ANSI escape codes from captured output.
    pub strip_ansi: bool,
    /// Capacity of the status event channel.
    pub event_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stats_interval_ms: 1000,
            kill_grace_ms: 1000,
            restart_settle_ms: 2000,
            max_log_lines: DEFAULT_MAX_LINES,
            crash_log_lines: 100,
            strip_ansi: false,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Endpoint receiving crash reports as JSON. Alerts are disabled when unset.
    pub webhook_url: Option<String>,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: 5000,
        }
    }
}

/// Configuration for a single project.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Stable identifier used by the control surface.
    pub id: String,
    /// Display name; defaults to the id.
    pub name: Option<String>,
    /// Working directory the command runs in.
    pub path: String,
    /// Shell command line to execute.
    pub command: String,
    /// Whether to start the project when the supervisor boots.
    #[serde(default)]
    pub auto_restart: bool,
    /// Whether a crash triggers the crash notifier.
    #[serde(default, alias = "notify_on_crash")]
    pub email_on_crash: bool,
    /// Tags for grouping projects.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Timings derived from [`SupervisorConfig`].
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub stats_interval: Duration,
    pub kill_grace: Duration,
    pub restart_settle: Duration,
}

impl SupervisorConfig {
    pub fn timings(&self) -> Timings {
        Timings {
            stats_interval: Duration::from_millis(self.stats_interval_ms.max(10)),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            restart_settle: Duration::from_millis(self.restart_settle_ms),
        }
    }
}

impl From<ProjectConfig> for Project {
    fn from(config: ProjectConfig) -> Self {
        Project {
            name: config.name.unwrap_or_else(|| config.id.clone()),
            id: config.id,
            path: config.path,
            command: config.command,
            auto_restart: config.auto_restart,
            email_on_crash: config.email_on_crash,
            tags: config.tags,
        }
    }
}

impl Config {
    /// Converts the configured projects into store records.
    pub fn project_records(&self) -> Vec<Project> {
        self.projects.iter().cloned().map(Project::from).collect()
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for project in &self.projects {
            if project.id.trim().is_empty() {
                bail!("project id must not be empty");
            }
            if !seen.insert(project.id.as_str()) {
                bail!("duplicate project id '{}'", project.id);
            }
            if project.command.trim().is_empty() {
                bail!("project '{}' has an empty command", project.id);
            }
        }
        if self.supervisor.max_log_lines == 0 {
            bail!("supervisor.max_log_lines must be at least 1");
        }
        Ok(())
    }
}

/// Parses and validates configuration text.
pub fn parse_config(raw: &str) -> Result<Config> {
    let config: Config = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_projects_and_defaults() {
        let raw = r#"
[server]
port = 6100

[supervisor]
kill_grace_ms = 250
strip_ansi = true

[notifier]
webhook_url = "http://127.0.0.1:9000/alerts"

[[project]]
id = "web"
name = "Web"
path = "/srv/app"
command = "node server.js"
auto_restart = true
email_on_crash = true
tags = ["prod", "frontend"]

[[project]]
id = "worker"
path = "/srv/worker"
command = "python worker.py | tee out.log"
notify_on_crash = true
"#;
        let config = parse_config(raw).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 6100);
        assert_eq!(config.supervisor.kill_grace_ms, 250);
        assert_eq!(config.supervisor.restart_settle_ms, 2000);
        assert_eq!(config.supervisor.max_log_lines, 1000);
        assert!(config.supervisor.strip_ansi);
        assert_eq!(
            config.notifier.webhook_url.as_deref(),
            Some("http://127.0.0.1:9000/alerts")
        );

        let projects = config.project_records();
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].name, "Web");
        assert!(projects[0].auto_restart);
        assert_eq!(projects[0].tags, vec!["prod", "frontend"]);
        assert_eq!(projects[1].name, "worker");
        assert!(projects[1].email_on_crash);
        assert!(!projects[1].auto_restart);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse_config("").unwrap();
        assert!(config.projects.is_empty());
        let timings = config.supervisor.timings();
        assert_eq!(timings.stats_interval, Duration::from_secs(1));
        assert_eq!(timings.kill_grace, Duration::from_secs(1));
        assert_eq!(timings.restart_settle, Duration::from_secs(2));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let raw = r#"
[[project]]
id = "api"
path = "/a"
command = "true"

[[project]]
id = "api"
path = "/b"
command = "true"
"#;
        let err = parse_config(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate project id"));
    }

    #[test]
    fn rejects_empty_command() {
        let raw = r#"
[[project]]
id = "api"
path = "/a"
command = "  "
"#;
        assert!(parse_config(raw).is_err());
    }
}
