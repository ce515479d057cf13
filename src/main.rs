//! Bubble SSH gateway
//!
//! An SSH server that resolves a container template from the login name,
//! materialises a per-user container workspace on Docker, and splices the
//! SSH channel to an interactive exec inside it. A side-channel management
//! service lets containers stop/destroy themselves or request port forwards.

mod auth;
mod config;
mod docker;
mod error;
mod events;
mod forwarder;
mod lifecycle;
mod manager;
mod session;
mod ssh;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::auth::Authorizer;
use crate::config::{Config, TemplateIndex};
use crate::docker::ContainerEngine;

/// Bubble gateway - SSH-fronted per-user container workspaces
#[derive(Parser, Debug)]
#[command(name = "bubble-gateway", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.generate_config {
        let config = Config::default();
        let content = serde_yaml::to_string(&config)?;
        println!("{}", content);
        return Ok(());
    }

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    if let Some(listen) = cli.listen {
        config.address = listen;
    }

    let templates = TemplateIndex::build(&config.templates)?;
    let authorizer = Authorizer::build(&config.keys, &config.access_control)?;

    info!("Starting bubble-gateway");
    info!("  Listen address: {}", config.address);
    if let Some(workspace_parent) = &config.workspace_parent {
        info!("  Workspace parent: {}", workspace_parent.display());
    }
    if let Some(share_dir) = &config.global_share_dir {
        info!("  Global sharepoint: {}", share_dir.display());
    }

    let config = Arc::new(config);

    let engine = Arc::new(
        ContainerEngine::connect()
            .await
            .context("Failed to initialize container engine")?,
    );

    if !config.network_group.is_empty() {
        engine.ensure_network(&config.network_group).await?;
    }

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    ssh::run_server(config, templates, authorizer, engine, cancel).await?;

    Ok(())
}

/// Cancel the root token on SIGINT or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    info!("Shutting down...");
    cancel.cancel();
}
