//! `certquery` Worker
//!
//! Answers certificate lookups arriving on the request queue until it is
//! stopped with Ctrl+C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use certquery_core::config::load_config;
use certquery_core::tracing_init::{default_filter, init_tracing};
use certquery_worker::storage::Database;
use certquery_worker::worker::CertificateQueryService;

#[derive(Parser, Debug)]
#[command(name = "certquery-worker")]
#[command(version, about = "certquery worker - answers certificate lookups over AMQP")]
struct Args {
    /// Settings file (JSON); overrides the global settings file
    #[arg(long, env = "CERTQUERY_CONFIG")]
    config: Option<PathBuf>,

    /// Broker host name
    #[arg(long)]
    broker_host: Option<String>,

    /// Broker AMQP port
    #[arg(long)]
    broker_port: Option<u16>,

    /// Broker virtual host
    #[arg(long)]
    broker_vhost: Option<String>,

    /// Broker user name
    #[arg(long)]
    broker_username: Option<String>,

    /// Broker password
    #[arg(long)]
    broker_password: Option<String>,

    /// Certificate database file path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Open the certificate database read-only, without running migrations
    #[arg(long)]
    db_read_only: bool,

    /// Log level filter for the worker (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "CERTQUERY_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(host) = args.broker_host {
        config.broker.host = host;
    }
    if let Some(port) = args.broker_port {
        config.broker.port = port;
    }
    if let Some(vhost) = args.broker_vhost {
        config.broker.vhost = vhost;
    }
    if let Some(username) = args.broker_username {
        config.broker.username = username;
    }
    if let Some(password) = args.broker_password {
        config.broker.password = password;
    }
    if let Some(path) = args.db_path {
        config.database.path = Some(path);
    }
    if args.db_read_only {
        config.database.read_only = true;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    init_tracing(
        &default_filter(env!("CARGO_PKG_NAME"), &config.log_level),
        args.log_json,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.broker.display_addr(),
        queue = %config.queue.name,
        "Starting certquery-worker"
    );

    let db_path = config
        .database
        .resolved_path()
        .context("Cannot determine certificate database path")?;
    info!(
        path = %db_path.display(),
        read_only = config.database.read_only,
        "Opening database"
    );
    let db = if config.database.read_only {
        Database::open_read_only(&db_path).await?
    } else {
        Database::open(&db_path).await?
    };

    let mut service = CertificateQueryService::new(&config, Arc::new(db))?.spawn();

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    sd_notify::notify(false, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        result = service.join() => {
            if let Err(e) = &result {
                error!(error = %e, "Worker stopped");
            }
            return result.map_err(Into::into);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    service.shutdown().await?;
    info!("Worker stopped");
    Ok(())
}
