//! Persistence seams used by the import pipeline
//!
//! `PgStore` implements them against PostgreSQL; tests use `MemoryStore`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Connection, ConnectionImportStatus, Ticket, TicketMessage};

/// Import counters of a connection after an update
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportCounters {
    pub total_messages: u32,
    pub imported_messages: u32,
    pub total_batches: u32,
    pub completed_batches: u32,
}

impl ImportCounters {
    pub fn from_connection(connection: &Connection) -> Self {
        Self {
            total_messages: connection.import_total_messages.max(0) as u32,
            imported_messages: connection.import_imported_messages.max(0) as u32,
            total_batches: connection.import_total_batches.max(0) as u32,
            completed_batches: connection.import_completed_batches.max(0) as u32,
        }
    }
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get_connection(&self, connection_id: Uuid) -> Result<Option<Connection>>;

    /// Atomically claim the connection for a new import.
    ///
    /// Only an `idle` or `awaiting_manual_close` connection can be claimed;
    /// otherwise returns `false` without touching anything. On success the
    /// status is `running` and counters are reset.
    async fn try_begin_import(
        &self,
        connection_id: Uuid,
        total_messages: u32,
        total_batches: u32,
    ) -> Result<bool>;

    /// Add one completed batch and its imported messages to the counters
    async fn record_batch_completed(
        &self,
        connection_id: Uuid,
        imported_messages: u32,
    ) -> Result<ImportCounters>;

    /// Move the import status from `from` to `to` as one compare-and-set.
    /// Returns `false`, leaving the row alone, when the status is no longer `from`.
    async fn transition_import_status(
        &self,
        connection_id: Uuid,
        from: ConnectionImportStatus,
        to: ConnectionImportStatus,
    ) -> Result<bool>;
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Pending tickets on the connection whose `imported_at` is at or after `since`
    async fn pending_imported_tickets(
        &self,
        connection_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>>;

    /// Open and pending tickets on the connection
    async fn active_tickets(&self, connection_id: Uuid) -> Result<Vec<Ticket>>;

    async fn find_active_ticket(
        &self,
        contact_id: Uuid,
        company_id: Uuid,
        connection_id: Uuid,
    ) -> Result<Option<Ticket>>;

    async fn reassign_connection(&self, ticket_id: Uuid, connection_id: Uuid) -> Result<()>;

    /// Move every message still owned by `source_id` onto `destination_id`,
    /// set the destination preview and delete the source, as one unit.
    /// Returns the number of messages moved.
    async fn merge_tickets(
        &self,
        source_id: Uuid,
        destination_id: Uuid,
        last_message: Option<&str>,
    ) -> Result<u64>;

    async fn contact_exists(&self, contact_id: Uuid) -> Result<bool>;

    async fn append_system_message(
        &self,
        ticket_id: Uuid,
        contact_id: Option<Uuid>,
        body: &str,
    ) -> Result<TicketMessage>;
}
