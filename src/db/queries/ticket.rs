//! Ticket and ticket message database queries

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::{Ticket, TicketMessage, TicketUpdate};

const TICKET_COLUMNS: &str = r#"
    id, company_id, connection_id, contact_id, status,
    last_message, imported_at, is_force_delete_connection,
    created_at, updated_at
"#;

/// Pending tickets created by an import on or after `since`
pub async fn list_pending_imported(
    pool: &PgPool,
    connection_id: Uuid,
    since: DateTime<Utc>,
) -> Result<Vec<Ticket>> {
    let query = format!(
        r#"
        SELECT {}
        FROM tickets
        WHERE connection_id = $1
          AND status = 'pending'
          AND imported_at IS NOT NULL
          AND imported_at >= $2
        ORDER BY imported_at
        "#,
        TICKET_COLUMNS
    );
    let tickets = sqlx::query_as::<_, Ticket>(&query)
        .bind(connection_id)
        .bind(since)
        .fetch_all(pool)
        .await?;

    Ok(tickets)
}

/// Open and pending tickets on a connection
pub async fn list_active_for_connection(pool: &PgPool, connection_id: Uuid) -> Result<Vec<Ticket>> {
    let query = format!(
        r#"
        SELECT {}
        FROM tickets
        WHERE connection_id = $1 AND status IN ('open', 'pending')
        ORDER BY created_at
        "#,
        TICKET_COLUMNS
    );
    let tickets = sqlx::query_as::<_, Ticket>(&query)
        .bind(connection_id)
        .fetch_all(pool)
        .await?;

    Ok(tickets)
}

/// Most recent open or pending ticket for a contact on a connection
pub async fn find_active_for_contact(
    pool: &PgPool,
    contact_id: Uuid,
    company_id: Uuid,
    connection_id: Uuid,
) -> Result<Option<Ticket>> {
    let query = format!(
        r#"
        SELECT {}
        FROM tickets
        WHERE contact_id = $1 AND company_id = $2 AND connection_id = $3
          AND status IN ('open', 'pending')
        ORDER BY updated_at DESC
        LIMIT 1
        "#,
        TICKET_COLUMNS
    );
    let ticket = sqlx::query_as::<_, Ticket>(&query)
        .bind(contact_id)
        .bind(company_id)
        .bind(connection_id)
        .fetch_optional(pool)
        .await?;

    Ok(ticket)
}

pub async fn update_connection(pool: &PgPool, ticket_id: Uuid, connection_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tickets SET connection_id = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(ticket_id)
    .bind(connection_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Apply a partial ticket update, returning the updated row
pub async fn update_ticket(
    pool: &PgPool,
    ticket_id: Uuid,
    company_id: Uuid,
    update: &TicketUpdate,
) -> Result<Option<Ticket>> {
    let query = format!(
        r#"
        UPDATE tickets
        SET status = COALESCE($3, status),
            is_force_delete_connection = COALESCE($4, is_force_delete_connection),
            updated_at = NOW()
        WHERE id = $1 AND company_id = $2
        RETURNING {}
        "#,
        TICKET_COLUMNS
    );
    let ticket = sqlx::query_as::<_, Ticket>(&query)
        .bind(ticket_id)
        .bind(company_id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.is_force_delete_connection)
        .fetch_optional(pool)
        .await?;

    Ok(ticket)
}

/// Merge `source_id` into `destination_id` inside one transaction.
///
/// Messages are selected by their current owner, so re-running after a
/// partial failure only moves what is still left on the source.
pub async fn merge_into(
    pool: &PgPool,
    source_id: Uuid,
    destination_id: Uuid,
    last_message: Option<&str>,
) -> Result<u64> {
    let mut tx = pool.begin().await?;

    let moved = sqlx::query("UPDATE messages SET ticket_id = $2 WHERE ticket_id = $1")
        .bind(source_id)
        .bind(destination_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    sqlx::query(
        "UPDATE tickets SET last_message = COALESCE($2, last_message), updated_at = NOW() WHERE id = $1",
    )
    .bind(destination_id)
    .bind(last_message)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM tickets WHERE id = $1")
        .bind(source_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(moved)
}

pub async fn contact_exists(pool: &PgPool, contact_id: Uuid) -> Result<bool> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM contacts WHERE id = $1)")
        .bind(contact_id)
        .fetch_one(pool)
        .await?;

    Ok(exists)
}

/// Insert a system-authored message on a ticket
pub async fn insert_system_message(
    pool: &PgPool,
    ticket_id: Uuid,
    contact_id: Option<Uuid>,
    body: &str,
) -> Result<TicketMessage> {
    let message = sqlx::query_as::<_, TicketMessage>(
        r#"
        INSERT INTO messages (id, ticket_id, contact_id, body, from_me, is_system, created_at)
        VALUES ($1, $2, $3, $4, TRUE, TRUE, NOW())
        RETURNING id, ticket_id, contact_id, body, from_me, is_system, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(ticket_id)
    .bind(contact_id)
    .bind(body)
    .fetch_one(pool)
    .await?;

    Ok(message)
}
