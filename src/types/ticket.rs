//! Ticket, message and connection entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Maximum length of a ticket's last-message preview
pub const LAST_MESSAGE_MAX_CHARS: usize = 255;

/// Ticket status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    Pending,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Pending => "pending",
            Self::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "pending" => Some(Self::Pending),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Open and pending tickets are both "active" conversations
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open | Self::Pending)
    }
}

/// Import lifecycle state of a connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionImportStatus {
    #[default]
    Idle,
    Running,
    Closing,
    AwaitingManualClose,
}

impl ConnectionImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::AwaitingManualClose => "awaiting_manual_close",
        }
    }

    /// An import or close sweep is in flight; the connection cannot be claimed
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Running | Self::Closing)
    }

    /// Status label shown to observers, same spelling as the wire format
    pub fn label(&self) -> &'static str {
        match self {
            Self::AwaitingManualClose => "awaitingManualClose",
            other => other.as_str(),
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "closing" => Some(Self::Closing),
            "awaiting_manual_close" => Some(Self::AwaitingManualClose),
            _ => None,
        }
    }
}

/// A configured gateway session (one account) through which messages flow
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    pub import_status: String,
    pub import_total_messages: i32,
    pub import_imported_messages: i32,
    pub import_total_batches: i32,
    pub import_completed_batches: i32,
    pub import_started_at: Option<DateTime<Utc>>,
    /// Close pending tickets created by an import automatically when it finishes
    pub close_imported_tickets: bool,
}

impl Connection {
    /// Parsed import status; unknown values are treated as idle
    pub fn status(&self) -> ConnectionImportStatus {
        ConnectionImportStatus::from_str(&self.import_status).unwrap_or_default()
    }
}

/// Ticket entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: Uuid,
    pub company_id: Uuid,
    pub connection_id: Uuid,
    pub contact_id: Uuid,
    pub status: String,
    pub last_message: Option<String>,
    pub imported_at: Option<DateTime<Utc>>,
    pub is_force_delete_connection: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn status(&self) -> Option<TicketStatus> {
        TicketStatus::from_str(&self.status)
    }
}

/// Message row belonging to a ticket
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TicketMessage {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub contact_id: Option<Uuid>,
    pub body: String,
    pub from_me: bool,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

/// Partial update applied through the ticket update collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TicketUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TicketStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_force_delete_connection: Option<bool>,
}

impl TicketUpdate {
    pub fn close() -> Self {
        Self {
            status: Some(TicketStatus::Closed),
            ..Default::default()
        }
    }

    pub fn force_close() -> Self {
        Self {
            status: Some(TicketStatus::Closed),
            is_force_delete_connection: Some(true),
        }
    }
}

/// Join two last-message previews with `|` and cap the result at 255 characters
pub fn merge_previews(destination: Option<&str>, source: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [destination, source]
        .into_iter()
        .flatten()
        .filter(|p| !p.is_empty())
        .collect();

    if parts.is_empty() {
        return None;
    }

    Some(parts.join("|").chars().take(LAST_MESSAGE_MAX_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_status_roundtrips_through_str() {
        for status in [TicketStatus::Open, TicketStatus::Pending, TicketStatus::Closed] {
            assert_eq!(TicketStatus::from_str(status.as_str()), Some(status));
        }
        assert!(TicketStatus::from_str("archived").is_none());
    }

    #[test]
    fn test_only_open_and_pending_are_active() {
        assert!(TicketStatus::Open.is_active());
        assert!(TicketStatus::Pending.is_active());
        assert!(!TicketStatus::Closed.is_active());
    }

    #[test]
    fn test_import_status_serializes_camel_case() {
        let json = serde_json::to_string(&ConnectionImportStatus::AwaitingManualClose).unwrap();
        assert_eq!(json, "\"awaitingManualClose\"");
    }

    #[test]
    fn test_merge_previews_joins_with_pipe() {
        let merged = merge_previews(Some("see you"), Some("hello"));
        assert_eq!(merged.as_deref(), Some("see you|hello"));
    }

    #[test]
    fn test_merge_previews_truncates_to_limit() {
        let long = "a".repeat(200);
        let merged = merge_previews(Some(&long), Some(&long)).unwrap();
        assert_eq!(merged.chars().count(), LAST_MESSAGE_MAX_CHARS);
        assert!(merged.contains('|'));
    }

    #[test]
    fn test_merge_previews_truncates_on_char_boundary() {
        let long = "ž".repeat(300);
        let merged = merge_previews(Some(&long), None).unwrap();
        assert_eq!(merged.chars().count(), LAST_MESSAGE_MAX_CHARS);
    }

    #[test]
    fn test_merge_previews_skips_missing() {
        assert_eq!(merge_previews(None, Some("only")).as_deref(), Some("only"));
        assert_eq!(merge_previews(Some(""), None), None);
    }

    #[test]
    fn test_force_close_update_sets_flag() {
        let update = TicketUpdate::force_close();
        assert_eq!(update.status, Some(TicketStatus::Closed));
        assert_eq!(update.is_force_delete_connection, Some(true));
    }
}
