use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use shopwarden::api;
use shopwarden::config::SecurityConfig;
use shopwarden::state::SecurityState;

#[derive(Parser, Debug)]
#[command(name = "shopwarden")]
#[command(version)]
#[command(about = "Security defense layer for storefront web applications")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the security daemon
    Run {
        /// Override the listen address from the config file
        #[arg(long)]
        bind: Option<String>,
    },
    /// Validate the configuration and print a redacted summary
    CheckConfig,
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => SecurityConfig::load(path)?,
        None => SecurityConfig::load_or_default()?,
    };

    match cli.command {
        Commands::Run { bind } => run_server(config, bind).await,
        Commands::CheckConfig => check_config(config),
    }
}

async fn run_server(mut config: SecurityConfig, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    let addr = config.server.bind.clone();

    let state = Arc::new(SecurityState::new(config)?);
    state.spawn_sweeper();
    state
        .logger
        .append("info", json!({ "message": "daemon started" }))
        .await;

    let app = api::security_router(state.clone()).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("shopwarden listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    state
        .logger
        .append("info", json!({ "message": "daemon stopped" }))
        .await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
    info!("shutdown requested");
}

fn check_config(config: SecurityConfig) -> Result<()> {
    // Building the state compiles every configured pattern, so a bad
    // user-agent regex or unwritable log directory surfaces here.
    let state = SecurityState::new(config)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "environment": state.config.environment,
            "bind": state.config.server.bind,
            "headers": state.headers.summary(),
            "waf_enforce": state.config.waf.enforce,
            "signature_literals": state.patterns.literal_count(),
            "signature_regexes": state.patterns.regex_count(),
            "alert_channels_enabled": state.config.alerts.any_channel_enabled(),
        }))?
    );
    Ok(())
}
