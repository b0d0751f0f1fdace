//! MCP security relay binary.
//!
//! Serves a single MCP session over stdio. Stdout carries JSON-RPC, so all
//! logging goes to stderr.

use clap::Parser;
use mcp_scan_relay::{RelayConfig, SecurityRelay};
use rmcp::ServiceExt;
use tracing::{error, info};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

#[derive(Parser)]
#[command(name = "mcp-scan-relay")]
#[command(version)]
#[command(about = "Security-scanning relay between an MCP client and upstream MCP servers")]
struct Cli {
    /// Path to the relay configuration file (YAML)
    #[arg(long, env = "MCP_SCAN_RELAY_CONFIG", default_value = "relay.yaml")]
    config_file: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = RelayConfig::from_file(&cli.config_file).await?;
    info!(
        upstreams = config.upstreams.len(),
        scanner = %config.scanner.endpoint,
        "starting relay"
    );

    let relay = SecurityRelay::from_config(config)?;
    relay.connect_upstreams().await?;

    let controller = relay.clone();
    let service = relay.serve(rmcp::transport::stdio()).await?;
    let mut serving = tokio::spawn(service.waiting());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
        }
        outcome = &mut serving => {
            match outcome {
                Ok(Ok(reason)) => info!(?reason, "client session ended"),
                Ok(Err(e)) => error!(error = %e, "session task failed"),
                Err(e) => error!(error = %e, "session task panicked"),
            }
        }
    }

    controller.shutdown().await;
    serving.abort();
    Ok(())
}
