//! Connection database queries

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::{Connection, ConnectionImportStatus};

const CONNECTION_COLUMNS: &str = r#"
    id, company_id, name, import_status,
    import_total_messages, import_imported_messages,
    import_total_batches, import_completed_batches,
    import_started_at, close_imported_tickets
"#;

/// Get a connection by ID
pub async fn get_connection(pool: &PgPool, id: Uuid) -> Result<Option<Connection>> {
    let query = format!("SELECT {} FROM connections WHERE id = $1", CONNECTION_COLUMNS);
    let connection = sqlx::query_as::<_, Connection>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(connection)
}

/// Claim a connection for an import; busy connections (running or closing) are left alone
pub async fn begin_import(
    pool: &PgPool,
    id: Uuid,
    total_messages: i32,
    total_batches: i32,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE connections
        SET import_status = 'running',
            import_total_messages = $2,
            import_imported_messages = 0,
            import_total_batches = $3,
            import_completed_batches = 0,
            import_started_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND import_status IN ('idle', 'awaiting_manual_close')
        "#,
    )
    .bind(id)
    .bind(total_messages)
    .bind(total_batches)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Increment counters for one completed batch, returning the new row
pub async fn add_completed_batch(
    pool: &PgPool,
    id: Uuid,
    imported_messages: i32,
) -> Result<Option<Connection>> {
    let query = format!(
        r#"
        UPDATE connections
        SET import_imported_messages = import_imported_messages + $2,
            import_completed_batches = import_completed_batches + 1,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        CONNECTION_COLUMNS
    );
    let connection = sqlx::query_as::<_, Connection>(&query)
        .bind(id)
        .bind(imported_messages)
        .fetch_optional(pool)
        .await?;

    Ok(connection)
}

/// Change the import status only if it still is `from`
pub async fn transition_import_status(
    pool: &PgPool,
    id: Uuid,
    from: ConnectionImportStatus,
    to: ConnectionImportStatus,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE connections
        SET import_status = $3, updated_at = NOW()
        WHERE id = $1 AND import_status = $2
        "#,
    )
    .bind(id)
    .bind(from.as_str())
    .bind(to.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}
