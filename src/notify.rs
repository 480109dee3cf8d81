//! Crash alerts.
//!
//! When a project configured with `email_on_crash` crashes, the supervisor hands a
//! [`CrashReport`] to a [`CrashNotifier`]. Delivery is best effort: failures are logged
//! and never retried.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use serde::Serialize;

use crate::output::LogLine;
use crate::process::Project;

/// Everything an alert needs to describe a crash.
#[derive(Debug, Clone)]
pub struct CrashReport {
    pub project: Project,
    pub exit_code: i32,
    /// Trailing captured lines, oldest first.
    pub logs: Vec<LogLine>,
}

impl CrashReport {
    pub fn subject(&self) -> String {
        format!("Project Crash Alert: {}", self.project.name)
    }

    pub fn body(&self) -> String {
        format!(
            "Project \"{}\" has crashed.\n\nDetails:\n- Path: {}\n- Command: {}\n- Exit Code: {}\n- Time: {}\n\nLast {} log lines attached.",
            self.project.name,
            self.project.path,
            self.project.command,
            self.exit_code,
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.logs.len(),
        )
    }

    /// Captured text concatenated as it was printed.
    pub fn log_text(&self) -> String {
        self.logs.iter().map(|line| line.text.as_str()).collect()
    }
}

#[async_trait]
pub trait CrashNotifier: Send + Sync {
    async fn notify(&self, report: CrashReport) -> Result<()>;
}

/// Notifier used when no alert channel is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl CrashNotifier for NoopNotifier {
    async fn notify(&self, report: CrashReport) -> Result<()> {
        tracing::debug!(
            "no crash notifier configured, dropping alert for {}",
            report.project.id
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    subject: String,
    text: String,
    project_id: &'a str,
    project_name: &'a str,
    exit_code: i32,
    attachment_name: String,
    attachment: String,
}

/// Posts crash reports as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("pitboss/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CrashNotifier for WebhookNotifier {
    async fn notify(&self, report: CrashReport) -> Result<()> {
        let payload = WebhookPayload {
            subject: report.subject(),
            text: report.body(),
            project_id: &report.project.id,
            project_name: &report.project.name,
            exit_code: report.exit_code,
            attachment_name: format!("{}-crash-logs.txt", report.project.name),
            attachment: report.log_text(),
        };
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.url))?
            .error_for_status()
            .context("webhook rejected crash report")?;
        tracing::info!("crash alert sent for project {}", report.project.id);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records every report it receives.
    #[derive(Default, Clone)]
    pub(crate) struct RecordingNotifier {
        pub reports: Arc<Mutex<Vec<CrashReport>>>,
    }

    #[async_trait]
    impl CrashNotifier for RecordingNotifier {
        async fn notify(&self, report: CrashReport) -> Result<()> {
            self.reports.lock().push(report);
            Ok(())
        }
    }

    /// Always fails.
    pub(crate) struct FailingNotifier;

    #[async_trait]
    impl CrashNotifier for FailingNotifier {
        async fn notify(&self, _report: CrashReport) -> Result<()> {
            anyhow::bail!("smtp down")
        }
    }

    fn report() -> CrashReport {
        CrashReport {
            project: Project {
                id: "web".into(),
                name: "Web".into(),
                path: "/srv/app".into(),
                command: "node server.js".into(),
                auto_restart: false,
                email_on_crash: true,
                tags: Vec::new(),
            },
            exit_code: 137,
            logs: vec![
                LogLine {
                    text: "listening\n".into(),
                    timestamp: "1:00:00 PM".into(),
                },
                LogLine {
                    text: "killed\n".into(),
                    timestamp: "1:00:01 PM".into(),
                },
            ],
        }
    }

    #[test]
    fn report_text() {
        let report = report();
        assert_eq!(report.subject(), "Project Crash Alert: Web");
        assert!(report.body().contains("- Exit Code: 137"));
        assert!(report.body().contains("- Command: node server.js"));
        assert_eq!(report.log_text(), "listening\nkilled\n");
    }

    #[tokio::test]
    async fn webhook_failure_is_an_error() {
        // Nothing listens on the discard port.
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/alerts", Duration::from_millis(200)).unwrap();
        assert!(notifier.notify(report()).await.is_err());
    }
}
