//! Ticket consolidation handlers

use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use tracing::{error, info};
use uuid::Uuid;

use super::{reply_error, reply_import_error, reply_success};
use crate::services::import_service::ImportService;
use crate::types::{DeletedConnectionRequest, Request, TransferTicketsRequest};

/// Handle chatdesk.ticket.transfer
pub async fn handle_transfer(
    client: Client,
    mut subscriber: Subscriber,
    service: Arc<ImportService>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<TransferTicketsRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse ticket transfer request: {}", e);
                reply_error(&client, reply, Uuid::nil(), "INVALID_REQUEST", e.to_string()).await?;
                continue;
            }
        };

        info!(
            connection_id = %request.payload.old_connection_id,
            "Transferring tickets to {}",
            request.payload.new_connection_id
        );

        match service.transfer_tickets(request.payload).await {
            Ok(report) => reply_success(&client, reply, request.id, report).await?,
            Err(e) => {
                error!("Ticket transfer failed: {}", e);
                reply_import_error(&client, reply, request.id, &e).await?;
            }
        }
    }

    Ok(())
}

/// Handle chatdesk.connection.deleted
pub async fn handle_connection_deleted(
    client: Client,
    mut subscriber: Subscriber,
    service: Arc<ImportService>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let request: Request<DeletedConnectionRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse connection deleted event: {}", e);
                if let Some(reply) = msg.reply.clone() {
                    reply_error(&client, reply, Uuid::nil(), "INVALID_REQUEST", e.to_string()).await?;
                }
                continue;
            }
        };

        let result = service
            .connection_deleted(request.payload.connection_id, request.payload.company_id)
            .await;

        // Also sent as a plain event; only reply when asked to
        let Some(reply) = msg.reply.clone() else {
            if let Err(e) = result {
                error!(
                    connection_id = %request.payload.connection_id,
                    "Deleted connection sweep failed: {}",
                    e
                );
            }
            continue;
        };

        match result {
            Ok(report) => reply_success(&client, reply, request.id, report).await?,
            Err(e) => reply_import_error(&client, reply, request.id, &e).await?,
        }
    }

    Ok(())
}
