//! Import handlers: start, status, manual close and queue overview

use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{reply_error, reply_import_error, reply_success};
use crate::services::import_service::ImportService;
use crate::types::{ConnectionRequest, Request, StartImportRequest};

/// Handle chatdesk.import.start
pub async fn handle_start(
    client: Client,
    mut subscriber: Subscriber,
    service: Arc<ImportService>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<StartImportRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse import start request: {}", e);
                reply_error(&client, reply, Uuid::nil(), "INVALID_REQUEST", e.to_string()).await?;
                continue;
            }
        };

        let connection_id = request.payload.connection_id;
        debug!(connection_id = %connection_id, "Import start requested");

        match service.start_import(request.payload).await {
            Ok(response) => reply_success(&client, reply, request.id, response).await?,
            Err(e) => {
                warn!(connection_id = %connection_id, "Import not started: {}", e);
                reply_import_error(&client, reply, request.id, &e).await?;
            }
        }
    }

    Ok(())
}

/// Handle chatdesk.import.status
pub async fn handle_status(
    client: Client,
    mut subscriber: Subscriber,
    service: Arc<ImportService>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<ConnectionRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse import status request: {}", e);
                reply_error(&client, reply, Uuid::nil(), "INVALID_REQUEST", e.to_string()).await?;
                continue;
            }
        };

        match service.import_status(request.payload.connection_id).await {
            Ok(status) => reply_success(&client, reply, request.id, status).await?,
            Err(e) => reply_import_error(&client, reply, request.id, &e).await?,
        }
    }

    Ok(())
}

/// Handle chatdesk.import.close_tickets
pub async fn handle_close_tickets(
    client: Client,
    mut subscriber: Subscriber,
    service: Arc<ImportService>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<ConnectionRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse close tickets request: {}", e);
                reply_error(&client, reply, Uuid::nil(), "INVALID_REQUEST", e.to_string()).await?;
                continue;
            }
        };

        let connection_id = request.payload.connection_id;
        match service.close_imported_tickets(connection_id).await {
            Ok(report) => reply_success(&client, reply, request.id, report).await?,
            Err(e) => {
                warn!(connection_id = %connection_id, "Close imported tickets failed: {}", e);
                reply_import_error(&client, reply, request.id, &e).await?;
            }
        }
    }

    Ok(())
}

/// Handle chatdesk.import.jobs
pub async fn handle_jobs(
    client: Client,
    mut subscriber: Subscriber,
    service: Arc<ImportService>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<serde_json::Value> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse import jobs request: {}", e);
                reply_error(&client, reply, Uuid::nil(), "INVALID_REQUEST", e.to_string()).await?;
                continue;
            }
        };

        let overview = service.queue_overview().await;
        reply_success(&client, reply, request.id, overview).await?;
    }

    Ok(())
}
