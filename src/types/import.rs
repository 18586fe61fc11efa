//! Import types: gateway messages, batches and the import request/response shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ConnectionImportStatus;

// ==========================================================================
// Gateway types
// ==========================================================================

/// A message as buffered by the messaging gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawInboundMessage {
    /// Gateway-assigned message id, unique per connection
    pub external_id: String,
    /// Remote chat address the message belongs to
    pub routing_key: String,
    /// Alternate address for the same chat, when the gateway knows one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_routing_key: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawInboundMessage {
    /// Routing key the ingestion handler should use instead of `routing_key`.
    /// Group chats are always addressed by the group itself.
    pub fn routing_key_override(&self) -> Option<&str> {
        if self.is_group {
            return None;
        }
        self.alt_routing_key.as_deref()
    }
}

/// Opaque session handle the gateway hands out for a connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayHandle {
    pub connection_id: Uuid,
    pub session: String,
}

// ==========================================================================
// Batches
// ==========================================================================

/// One slice of a normalized import
#[derive(Debug, Clone, PartialEq)]
pub struct MessageBatch {
    pub batch_index: u32,
    pub total_batches: u32,
    pub messages: Vec<RawInboundMessage>,
}

// ==========================================================================
// Progress
// ==========================================================================

/// Progress event published to observers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub connection_id: Uuid,
    pub processed_count: u32,
    pub total_count: u32,
    pub status_label: String,
    pub batch_label: String,
    pub percentage: u8,
}

impl ImportProgress {
    pub fn new(
        connection_id: Uuid,
        processed_count: u32,
        total_count: u32,
        status_label: impl Into<String>,
        batch_label: impl Into<String>,
    ) -> Self {
        Self {
            connection_id,
            processed_count,
            total_count,
            status_label: status_label.into(),
            batch_label: batch_label.into(),
            percentage: percentage(processed_count, total_count),
        }
    }
}

/// Whole-number percentage, 100 for an empty total
pub fn percentage(processed: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (processed.min(total) as u64 * 100) / total as u64;
    pct as u8
}

/// Human readable "batch i of n" label (1-based)
pub fn batch_label(batch_index: u32, total_batches: u32) -> String {
    format!("{}/{}", batch_index + 1, total_batches)
}

// ==========================================================================
// Requests / responses
// ==========================================================================

/// Request to start a historical import
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartImportRequest {
    pub connection_id: Uuid,
    pub company_id: Uuid,
    /// Messages to import; when absent the gateway buffer is used
    #[serde(default)]
    pub messages: Option<Vec<RawInboundMessage>>,
}

/// Response when an import has been accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartImportResponse {
    pub connection_id: Uuid,
    pub total_messages: u32,
    pub total_batches: u32,
    pub job_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub connection_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedConnectionRequest {
    pub connection_id: Uuid,
    pub company_id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchInfo {
    pub completed_batches: u32,
    pub total_batches: u32,
}

/// Polling view of a connection's import
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportStatusResponse {
    pub status: ConnectionImportStatus,
    pub total_messages: u32,
    pub imported_messages: u32,
    pub batch_info: BatchInfo,
}

/// Outcome of a close-imported-tickets sweep
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloseSweepReport {
    pub candidates: u32,
    pub closed: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTicketsRequest {
    pub old_connection_id: Uuid,
    pub new_connection_id: Uuid,
    pub user_id: Uuid,
}

/// Outcome of a connection-change consolidation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferReport {
    /// Tickets relocated to the new connection
    pub moved: u32,
    /// Tickets merged into an existing ticket on the new connection
    pub merged: u32,
    pub failed: u32,
}

/// Outcome of the deleted-connection sweep
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ForceCloseReport {
    pub closed: u32,
    /// Tickets that also received a system message
    pub messaged: u32,
    pub failed: u32,
}
