//! Database module

#[cfg(test)]
pub mod memory;
pub mod queries;
pub mod store;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::types::{Connection, ConnectionImportStatus, Ticket, TicketMessage};
pub use store::{ConnectionStore, ImportCounters, TicketStore};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running database migrations...");

    let migrator = sqlx::migrate!("./migrations");

    let compiled_versions: Vec<i64> = migrator
        .iter()
        .filter(|m| !m.migration_type.is_down_migration())
        .map(|m| m.version)
        .collect();
    info!("Compiled migration versions: {:?}", compiled_versions);

    migrator.run(pool).await.context("failed to apply migrations")?;

    info!("Database migrations complete");
    Ok(())
}

/// PostgreSQL-backed connection and ticket store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConnectionStore for PgStore {
    async fn get_connection(&self, connection_id: Uuid) -> Result<Option<Connection>> {
        queries::connection::get_connection(&self.pool, connection_id).await
    }

    async fn try_begin_import(
        &self,
        connection_id: Uuid,
        total_messages: u32,
        total_batches: u32,
    ) -> Result<bool> {
        queries::connection::begin_import(
            &self.pool,
            connection_id,
            i32::try_from(total_messages)?,
            i32::try_from(total_batches)?,
        )
        .await
    }

    async fn record_batch_completed(
        &self,
        connection_id: Uuid,
        imported_messages: u32,
    ) -> Result<ImportCounters> {
        let connection = queries::connection::add_completed_batch(
            &self.pool,
            connection_id,
            i32::try_from(imported_messages)?,
        )
        .await?
        .with_context(|| format!("connection {} disappeared during import", connection_id))?;

        Ok(ImportCounters::from_connection(&connection))
    }

    async fn transition_import_status(
        &self,
        connection_id: Uuid,
        from: ConnectionImportStatus,
        to: ConnectionImportStatus,
    ) -> Result<bool> {
        queries::connection::transition_import_status(&self.pool, connection_id, from, to).await
    }
}

#[async_trait]
impl TicketStore for PgStore {
    async fn pending_imported_tickets(
        &self,
        connection_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>> {
        queries::ticket::list_pending_imported(&self.pool, connection_id, since).await
    }

    async fn active_tickets(&self, connection_id: Uuid) -> Result<Vec<Ticket>> {
        queries::ticket::list_active_for_connection(&self.pool, connection_id).await
    }

    async fn find_active_ticket(
        &self,
        contact_id: Uuid,
        company_id: Uuid,
        connection_id: Uuid,
    ) -> Result<Option<Ticket>> {
        queries::ticket::find_active_for_contact(&self.pool, contact_id, company_id, connection_id)
            .await
    }

    async fn reassign_connection(&self, ticket_id: Uuid, connection_id: Uuid) -> Result<()> {
        queries::ticket::update_connection(&self.pool, ticket_id, connection_id).await?;
        Ok(())
    }

    async fn merge_tickets(
        &self,
        source_id: Uuid,
        destination_id: Uuid,
        last_message: Option<&str>,
    ) -> Result<u64> {
        queries::ticket::merge_into(&self.pool, source_id, destination_id, last_message).await
    }

    async fn contact_exists(&self, contact_id: Uuid) -> Result<bool> {
        queries::ticket::contact_exists(&self.pool, contact_id).await
    }

    async fn append_system_message(
        &self,
        ticket_id: Uuid,
        contact_id: Option<Uuid>,
        body: &str,
    ) -> Result<TicketMessage> {
        queries::ticket::insert_system_message(&self.pool, ticket_id, contact_id, body).await
    }
}
