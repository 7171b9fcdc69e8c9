//! Keel Server - Main entry point
//!
//! Runs a single server with a heartbeat on every replica and a leader-only
//! report, wired from configuration.

use axum::{routing::get, Router};
use clap::Parser;

use keel_core::{config::Config, server::ServerBuilder, telemetry};

#[derive(Parser)]
#[command(
    name = "keel-server",
    version,
    about = "Keel - process lifecycle and leader-gated cron",
    propagate_version = true
)]
struct Cli {
    /// Configuration file path; environment variables still override it
    #[arg(short, long, env = "KEEL_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };

    let _telemetry = telemetry::init_telemetry(&config)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Keel Server");

    let mut builder = ServerBuilder::new("keel-server", &config)
        .router(Router::new().route("/", get(|| async { "keel" })))
        .every(chrono::Duration::seconds(30), "heartbeat", |ctx| async move {
            tracing::debug!(tick = %ctx.tick(), "heartbeat");
            Ok(())
        });

    if config.election.socket_path.is_some() || config.election.mock.is_some() {
        builder = builder.leader_every(chrono::Duration::minutes(1), "leader-report", |ctx| async move {
            let services = ctx.health().snapshot().len();
            tracing::info!(tick = %ctx.tick(), services, "Leader report");
            Ok(())
        });
    }

    let server = builder.build().await?;
    server.run().await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}
