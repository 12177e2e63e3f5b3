// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! # TNC agent gateway binary
//!
//! Starts the gateway: four gRPC services on the configured port, bridged
//! onto the event bus once a connection URL is configured. All runtime
//! configuration comes from `TNC_*` environment variables; the two flags
//! cover version and asset export.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use tnc_gateway::infrastructure::assets::write_proto_assets;
use tnc_gateway::infrastructure::bus::mqtt::MqttBusFactory;
use tnc_gateway::{GatewayConfig, GatewayServer};

#[derive(Parser)]
#[command(name = "tnc-agent", about, disable_version_flag = true)]
struct Cli {
    /// Print the version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Write the four .proto contracts to the working directory and exit
    #[arg(short = 'a', long = "assets")]
    assets: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TNC_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_logging(&cli.log_level)?;

    if cli.assets {
        let cwd = std::env::current_dir().context("Failed to resolve working directory")?;
        write_proto_assets(&cwd).context("Failed to write proto assets")?;
        println!("Wrote service contracts to {}", cwd.display());
        return Ok(());
    }

    let config = GatewayConfig::from_env().context("Failed to load configuration")?;
    info!(
        port = config.grpc_port,
        namespace = %config.bus.namespace,
        identity = %config.identity.id,
        "starting TNC agent gateway"
    );

    let server = GatewayServer::new(config, Arc::new(MqttBusFactory));
    server
        .serve(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Gateway failed")?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// Gateway log setup. The flag (or TNC_LOG_LEVEL) sets the baseline;
/// per-module RUST_LOG directives refine it.
fn init_logging(level: &str) -> Result<()> {
    let baseline: Directive = level
        .parse()
        .with_context(|| format!("'{level}' is not a valid log level"))?;
    let filter = EnvFilter::builder()
        .with_default_directive(baseline)
        .from_env_lossy();

    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(filter)
        .init();
    Ok(())
}
