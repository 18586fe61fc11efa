//! Ticket update path backed by PostgreSQL
//!
//! Persists the update, then publishes a ticket event so open views and
//! counters refresh the same way they do for a manual status change.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::db::queries;
use crate::services::collaborators::{Broadcaster, TicketUpdater};
use crate::types::{Ticket, TicketUpdate};

pub fn ticket_channel(company_id: Uuid) -> String {
    format!("chatdesk.company.{}.ticket", company_id)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TicketEvent<'a> {
    action: &'static str,
    ticket: &'a Ticket,
}

pub struct PgTicketUpdater {
    pool: PgPool,
    broadcaster: Arc<dyn Broadcaster>,
}

impl PgTicketUpdater {
    pub fn new(pool: PgPool, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self { pool, broadcaster }
    }
}

#[async_trait]
impl TicketUpdater for PgTicketUpdater {
    async fn update(&self, ticket_id: Uuid, company_id: Uuid, update: TicketUpdate) -> Result<Ticket> {
        let ticket = queries::ticket::update_ticket(&self.pool, ticket_id, company_id, &update)
            .await?
            .with_context(|| format!("ticket {} not found for company {}", ticket_id, company_id))?;

        let event = serde_json::to_value(TicketEvent {
            action: "update",
            ticket: &ticket,
        })?;
        if let Err(e) = self.broadcaster.publish(&ticket_channel(company_id), event).await {
            warn!(ticket_id = %ticket_id, "Failed to publish ticket update: {}", e);
        }

        Ok(ticket)
    }
}
