//! NATS message handlers

pub mod import;
pub mod tickets;

use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subject};
use serde::Serialize;
use tokio::select;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::ImportError;
use crate::services::import_service::ImportService;
use crate::types::{ErrorResponse, SuccessResponse};

pub const SUBJECT_IMPORT_START: &str = "chatdesk.import.start";
pub const SUBJECT_IMPORT_STATUS: &str = "chatdesk.import.status";
pub const SUBJECT_IMPORT_CLOSE_TICKETS: &str = "chatdesk.import.close_tickets";
pub const SUBJECT_IMPORT_JOBS: &str = "chatdesk.import.jobs";
pub const SUBJECT_TICKET_TRANSFER: &str = "chatdesk.ticket.transfer";
pub const SUBJECT_CONNECTION_DELETED: &str = "chatdesk.connection.deleted";

pub(crate) async fn reply_success<T: Serialize>(
    client: &Client,
    reply: Subject,
    request_id: Uuid,
    payload: T,
) -> Result<()> {
    let success = SuccessResponse::new(request_id, payload);
    let _ = client.publish(reply, serde_json::to_vec(&success)?.into()).await;
    Ok(())
}

pub(crate) async fn reply_error(
    client: &Client,
    reply: Subject,
    request_id: Uuid,
    code: &str,
    message: String,
) -> Result<()> {
    let error = ErrorResponse::new(request_id, code, message);
    let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
    Ok(())
}

pub(crate) async fn reply_import_error(
    client: &Client,
    reply: Subject,
    request_id: Uuid,
    err: &ImportError,
) -> Result<()> {
    let error = ErrorResponse::from_import_error(request_id, err);
    let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
    Ok(())
}

/// Start all message handlers. Returns when one of them stops.
pub async fn start_handlers(client: Client, service: Arc<ImportService>) -> Result<()> {
    info!("Starting message handlers...");

    let start_sub = client.subscribe(SUBJECT_IMPORT_START).await?;
    let status_sub = client.subscribe(SUBJECT_IMPORT_STATUS).await?;
    let close_sub = client.subscribe(SUBJECT_IMPORT_CLOSE_TICKETS).await?;
    let jobs_sub = client.subscribe(SUBJECT_IMPORT_JOBS).await?;
    let transfer_sub = client.subscribe(SUBJECT_TICKET_TRANSFER).await?;
    let deleted_sub = client.subscribe(SUBJECT_CONNECTION_DELETED).await?;

    info!("Subscribed to NATS subjects");

    let start_handle = tokio::spawn(import::handle_start(client.clone(), start_sub, service.clone()));
    let status_handle = tokio::spawn(import::handle_status(client.clone(), status_sub, service.clone()));
    let close_handle = tokio::spawn(import::handle_close_tickets(client.clone(), close_sub, service.clone()));
    let jobs_handle = tokio::spawn(import::handle_jobs(client.clone(), jobs_sub, service.clone()));
    let transfer_handle = tokio::spawn(tickets::handle_transfer(client.clone(), transfer_sub, service.clone()));
    let deleted_handle = tokio::spawn(tickets::handle_connection_deleted(client.clone(), deleted_sub, service));

    info!("All handlers started, waiting for messages...");

    let (name, result) = select! {
        r = start_handle => ("import.start", r),
        r = status_handle => ("import.status", r),
        r = close_handle => ("import.close_tickets", r),
        r = jobs_handle => ("import.jobs", r),
        r = transfer_handle => ("ticket.transfer", r),
        r = deleted_handle => ("connection.deleted", r),
    };

    match result {
        Ok(Ok(())) => info!("{} handler finished", name),
        Ok(Err(e)) => {
            error!("{} handler error: {}", name, e);
            return Err(e);
        }
        Err(e) => {
            error!("{} handler panicked: {}", name, e);
            return Err(e.into());
        }
    }

    Ok(())
}
