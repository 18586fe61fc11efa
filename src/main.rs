//! Chatdesk Worker - bulk message import and ticket consolidation
//!
//! This worker connects to NATS and PostgreSQL, replays historical gateway
//! messages through the live ingestion path and keeps tickets consistent
//! when connections change.

mod cli;
mod config;
mod db;
mod error;
mod handlers;
mod services;
mod types;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};
use crate::db::PgStore;
use crate::services::collaborators::Broadcaster;
use crate::services::import_service::{ImportDeps, ImportService};
use crate::services::nats_collaborators::{NatsBroadcaster, NatsGatewayClient, NatsInboundHandler};
use crate::services::ticket_update::PgTicketUpdater;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs directory - use LOGS_DIR env var or default to ../logs (relative to worker)
    let logs_dir = std::env::var("LOGS_DIR")
        .unwrap_or_else(|_| "../logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(
        Rotation::DAILY,
        &logs_dir,
        "worker.log",
    );
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Initialize logging - both stdout and file
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatdesk_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())  // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))  // file
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = config::Config::from_env()?;
    info!("Configuration loaded");

    // Connect to database
    let pool = db::create_pool(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    // Run migrations
    db::run_migrations(&pool).await?;

    if matches!(cli.command, Some(Command::Migrate)) {
        info!("Migrations applied, exiting");
        return Ok(());
    }

    info!("Starting Chatdesk Worker...");

    // Connect to NATS (supports optional NATS_USER/NATS_PASSWORD auth).
    let nats_client = match (config.nats_user.clone(), config.nats_password.clone()) {
        (Some(user), Some(password)) => {
            async_nats::ConnectOptions::new()
                .user_and_password(user, password)
                .connect(&config.nats_url)
                .await?
        }
        _ => async_nats::connect(&config.nats_url).await?,
    };
    info!("Connected to NATS at {}", config.nats_url);

    let store = Arc::new(PgStore::new(pool.clone()));
    let broadcaster: Arc<dyn Broadcaster> = Arc::new(NatsBroadcaster::new(nats_client.clone()));
    let deps = ImportDeps {
        connections: store.clone(),
        tickets: store,
        updater: Arc::new(PgTicketUpdater::new(pool, broadcaster.clone())),
        gateway: Arc::new(NatsGatewayClient::new(nats_client.clone())),
        inbound: Arc::new(NatsInboundHandler::new(nats_client.clone())),
        broadcaster,
    };
    let service = Arc::new(ImportService::new(deps, &config.import));
    info!(
        "Import service ready (batch size {}, concurrency {})",
        config.import.batch_size, config.import.queue_concurrency
    );

    // Start message handlers
    let handler_result = tokio::select! {
        r = handlers::start_handlers(nats_client, service.clone()) => r,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    service.shutdown().await;

    if let Err(e) = handler_result {
        error!("Handler error: {}", e);
        return Err(e);
    }

    Ok(())
}
