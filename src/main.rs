//! Pitboss: a process supervisor with live telemetry.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, starts the supervisor and its stats poller, and serves the
//! control surface until the process is asked to shut down.

mod config;
mod error;
mod events;
mod notify;
mod output;
mod poller;
mod process;
mod restart;
mod runner;
mod server;
mod store;
mod telemetry;
mod tree;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{load_config, Config};
use crate::notify::{CrashNotifier, NoopNotifier, WebhookNotifier};
use crate::runner::{Supervisor, SupervisorSettings};
use crate::store::ProjectCatalog;
use crate::tree::SystemInspector;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "pitboss",
    version,
    about = "Process supervisor with live telemetry",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to the pitboss.toml configuration file.
    #[arg(long, default_value = "pitboss.toml")]
    config: PathBuf,
    /// Address to bind the control surface to.
    #[arg(long)]
    host: Option<String>,
    /// Port for the control surface.
    #[arg(long)]
    port: Option<u16>,
    /// Log filter (e.g. "debug" or "pitboss=trace"). Defaults to RUST_LOG, then "info".
    #[arg(long)]
    log_level: Option<String>,
    /// Do not start auto_restart projects on boot.
    #[arg(long)]
    no_autostart: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Supervise projects and serve the control surface (default).
    Serve,
    /// Validate the configuration and list its projects.
    Check,
    /// Show version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Version) => {
            println!("pitboss {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Check) => check(&cli),
        Some(Commands::Serve) | None => {
            init_tracing(cli.log_level.as_deref())?;
            run(&cli).await
        }
    }
}

fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

fn check(cli: &Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    println!(
        "{}: {} projects",
        cli.config.display(),
        config.projects.len()
    );
    for project in config.project_records() {
        let flags = match (project.auto_restart, project.email_on_crash) {
            (true, true) => " [autostart, notify]",
            (true, false) => " [autostart]",
            (false, true) => " [notify]",
            (false, false) => "",
        };
        println!(
            "  {} ({}): `{}` in {}{}",
            project.id, project.name, project.command, project.path, flags
        );
    }
    Ok(())
}

fn build_notifier(config: &Config) -> Result<Arc<dyn CrashNotifier>> {
    match &config.notifier.webhook_url {
        Some(url) => {
            info!("crash alerts go to {}", url);
            let timeout = Duration::from_millis(config.notifier.timeout_ms);
            Ok(Arc::new(WebhookNotifier::new(url.clone(), timeout)?))
        }
        None => Ok(Arc::new(NoopNotifier)),
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    let store = ProjectCatalog::with_source(config.project_records(), cli.config.clone());
    let settings = SupervisorSettings::from(&config.supervisor);
    let stats_interval = settings.timings.stats_interval;
    let supervisor = Supervisor::new(
        Arc::new(store),
        Arc::new(SystemInspector::new()),
        build_notifier(&config)?,
        settings,
    );
    info!(
        "loaded {} projects from {}",
        config.projects.len(),
        cli.config.display()
    );

    let poller = poller::spawn_stats_poller(supervisor.clone(), stats_interval);
    if !cli.no_autostart {
        let started = supervisor.autostart();
        if started > 0 {
            info!("auto-started {} projects", started);
        }
    }

    let host = cli.host.as_deref().unwrap_or(&config.server.host);
    let port = cli.port.unwrap_or(config.server.port);
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {}:{}", host, port))?;

    let result = tokio::select! {
        result = server::serve(listener, supervisor.clone()) => result,
        _ = shutdown_signal() => {
            info!("shutdown requested");
            Ok(())
        }
    };

    poller.abort();
    supervisor.shutdown().await;
    info!("all projects stopped");
    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!("SIGTERM handler unavailable: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}
