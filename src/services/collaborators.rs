//! External collaborators of the import pipeline
//!
//! The gateway, the live ingestion path, the ticket update path and the
//! pub/sub broadcaster all live outside this worker. NATS-backed
//! implementations are in `nats_collaborators`, the Postgres ticket updater
//! in `ticket_update`.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{GatewayHandle, RawInboundMessage, Ticket, TicketUpdate};

#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Session handle for a connection, `None` when the session is not up
    async fn connection_handle(&self, connection_id: Uuid) -> Result<Option<GatewayHandle>>;

    /// Messages the gateway buffered for a connection since it came up
    async fn buffered_messages(&self, connection_id: Uuid) -> Result<Vec<RawInboundMessage>>;
}

/// Standard inbound ingestion path, shared with live traffic.
/// Must be idempotent per external message id.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(
        &self,
        message: &RawInboundMessage,
        handle: &GatewayHandle,
        company_id: Uuid,
        is_import: bool,
        routing_key_override: Option<&str>,
    ) -> Result<()>;
}

/// Ticket update path with its standard side effects (notifications, counters)
#[async_trait]
pub trait TicketUpdater: Send + Sync {
    async fn update(&self, ticket_id: Uuid, company_id: Uuid, update: TicketUpdate) -> Result<Ticket>;
}

/// Best-effort pub/sub
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<()>;
}
