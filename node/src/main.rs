// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Gridlink Node
//!
//! Entry point for the `gridlink-node` binary. Parses CLI arguments,
//! initializes logging and metrics, bootstraps the node, and serves the
//! REST API until a shutdown signal arrives.
//!
//! The binary supports four subcommands:
//!
//! - `run`: bootstrap the node and serve until SIGINT/SIGTERM
//! - `check`: validate a configuration and print the resolved values
//! - `status`: query a running node's status endpoint
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use gridlink::bootstrap::{BootstrapError, NodeBootstrap, DRAIN_TIMEOUT};
use gridlink::node_config::NodeConfig;

use cli::{Commands, GridlinkNodeCli};
use logging::LogFormat;
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = GridlinkNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Check(args) => check_config(args),
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Wraps a bootstrap failure so the exit message names the stage.
fn stage_error(e: BootstrapError) -> anyhow::Error {
    let stage = e.stage();
    anyhow::Error::new(e).context(format!("bootstrap failed at stage {stage}"))
}

/// Bootstraps the node, serves the REST API, and drains on shutdown.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(&args.log_level, LogFormat::from(args.log_format));

    tracing::info!(
        config = %args.config.display(),
        version = env!("CARGO_PKG_VERSION"),
        "starting gridlink-node"
    );

    let overrides = args.overrides.into_overrides();
    let node = NodeBootstrap::from_path_with_overrides(&args.config, &overrides)
        .map_err(stage_error)?
        .start()
        .await
        .map_err(stage_error)?;

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to create metrics registry")?);

    // --- API server ---
    let api_endpoint = node.config().rest_api_endpoint().clone();
    let api_listener = match tokio::net::TcpListener::bind(api_endpoint.socket_tuple()).await {
        Ok(listener) => listener,
        Err(e) => {
            node.shutdown().await;
            return Err(e).with_context(|| format!("failed to bind REST API on {api_endpoint}"));
        }
    };
    let api_addr = api_listener
        .local_addr()
        .with_context(|| format!("REST API listener on {api_endpoint} has no local address"))?;
    tracing::info!(%api_addr, "REST API listening");

    let router = api::create_router(api::AppState {
        node: Arc::clone(&node),
        metrics: node_metrics,
    });

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, router) => {
            if let Err(e) = res {
                tracing::error!("REST API server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining");
        }
    }

    if tokio::time::timeout(DRAIN_TIMEOUT, node.shutdown())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain did not finish in time, exiting anyway"
        );
    }
    tracing::info!(stage = %node.stage(), "gridlink-node stopped");
    Ok(())
}

/// Loads and validates the configuration, then prints it as JSON.
fn check_config(args: cli::CheckArgs) -> Result<()> {
    let overrides = args.overrides.into_overrides();
    let config = NodeConfig::load_with_overrides(&args.config, &overrides)
        .with_context(|| format!("invalid configuration in {}", args.config.display()))?;

    let rendered =
        serde_json::to_string_pretty(&config).context("failed to render configuration")?;
    println!("{rendered}");
    eprintln!(
        "configuration OK: node {} ({} peers, {} registries)",
        config.node_id(),
        config.peers().len(),
        config.registries().len()
    );
    Ok(())
}

/// Queries a running node's status endpoint and prints the result.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.api_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .build()
        .context("failed to build HTTP client")?;

    let body = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?
        .error_for_status()
        .with_context(|| format!("{url} returned an error"))?
        .text()
        .await
        .context("failed to read status body")?;

    // Pretty-print when the body is JSON, pass it through otherwise.
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{body}"),
    }
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("gridlink-node {}", env!("CARGO_PKG_VERSION"));
    println!("wire protocol {}", gridlink::config::WIRE_PROTOCOL_VERSION);
    println!("config schema {}", gridlink::config::CONFIG_SCHEMA_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed, that signal is simply never observed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
