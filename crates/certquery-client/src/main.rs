//! `certquery` CLI
//!
//! Sends a certificate lookup to the worker and prints the reply.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::info;

use certquery_client::CertificateClient;
use certquery_client::lookup_cmd::{self, LookupArgs};
use certquery_core::config::load_config;
use certquery_core::tracing_init::{default_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "certquery")]
#[command(version, about = "Look up issued certificates through the broker", long_about = None)]
struct Cli {
    /// Settings file (JSON); overrides the global settings file
    #[arg(long, env = "CERTQUERY_CONFIG")]
    config: Option<PathBuf>,

    /// Broker host name
    #[arg(long)]
    broker_host: Option<String>,

    /// Broker AMQP port
    #[arg(long)]
    broker_port: Option<u16>,

    /// Seconds to wait for a reply (also bounds the broker connection wait)
    #[arg(long)]
    timeout: Option<u64>,

    /// Log level filter (logs go to stderr); defaults to the configured level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Look up the certificate issued for a CPF and full name
    Lookup(LookupArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level.clone() {
        config.log_level = level;
    }
    init_tracing(&default_filter("certquery", &config.log_level), false);

    if let Some(host) = cli.broker_host {
        config.broker.host = host;
    }
    if let Some(port) = cli.broker_port {
        config.broker.port = port;
    }
    if let Some(secs) = cli.timeout {
        config.client.request_timeout_ms = secs.saturating_mul(1000);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.broker.display_addr(),
        "Starting certquery CLI"
    );

    let wait = config.client.request_timeout();
    let client = tokio::time::timeout(wait, CertificateClient::connect(&config))
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "Broker {} unreachable after {wait:?}",
                config.broker.display_addr()
            )
        })??;

    let outcome = match &cli.command {
        Commands::Lookup(args) => lookup_cmd::handle_lookup(&client, args).await,
    };
    client.close().await;

    Ok(if outcome? {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn log_level_is_optional() {
        let cli =
            Cli::try_parse_from(["certquery", "lookup", "--cpf", "1", "--nome", "Ana"]).unwrap();
        assert!(cli.log_level.is_none());

        let cli = Cli::try_parse_from([
            "certquery",
            "--log-level",
            "debug",
            "lookup",
            "--cpf",
            "1",
            "--nome",
            "Ana",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }
}
