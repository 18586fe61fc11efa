//! In-memory store for tests

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::store::{ConnectionStore, ImportCounters, TicketStore};
use crate::services::collaborators::TicketUpdater;
use crate::types::{
    Connection, ConnectionImportStatus, Ticket, TicketMessage, TicketStatus, TicketUpdate,
};

#[derive(Default)]
struct State {
    connections: HashMap<Uuid, Connection>,
    contacts: HashSet<Uuid>,
    tickets: HashMap<Uuid, Ticket>,
    messages: Vec<TicketMessage>,
}

/// Implements the store traits and the ticket updater over shared maps.
/// Ticket ids in `fail_updates` / `fail_merges` make those calls error.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pub fail_updates: Mutex<HashSet<Uuid>>,
    pub fail_merges: Mutex<HashSet<Uuid>>,
    pub updates: Mutex<Vec<(Uuid, TicketUpdate)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&self, company_id: Uuid, name: &str, close_imported_tickets: bool) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().connections.insert(
            id,
            Connection {
                id,
                company_id,
                name: name.to_string(),
                import_status: ConnectionImportStatus::Idle.as_str().to_string(),
                import_total_messages: 0,
                import_imported_messages: 0,
                import_total_batches: 0,
                import_completed_batches: 0,
                import_started_at: None,
                close_imported_tickets,
            },
        );
        id
    }

    pub fn add_contact(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().contacts.insert(id);
        id
    }

    pub fn add_ticket(
        &self,
        company_id: Uuid,
        connection_id: Uuid,
        contact_id: Uuid,
        status: TicketStatus,
        imported_at: Option<DateTime<Utc>>,
        last_message: Option<&str>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.state.lock().tickets.insert(
            id,
            Ticket {
                id,
                company_id,
                connection_id,
                contact_id,
                status: status.as_str().to_string(),
                last_message: last_message.map(str::to_string),
                imported_at,
                is_force_delete_connection: false,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    pub fn add_message(&self, ticket_id: Uuid, body: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().messages.push(TicketMessage {
            id,
            ticket_id,
            contact_id: None,
            body: body.to_string(),
            from_me: false,
            is_system: false,
            created_at: Utc::now(),
        });
        id
    }

    pub fn connection(&self, id: Uuid) -> Option<Connection> {
        self.state.lock().connections.get(&id).cloned()
    }

    pub fn ticket(&self, id: Uuid) -> Option<Ticket> {
        self.state.lock().tickets.get(&id).cloned()
    }

    pub fn tickets_on(&self, connection_id: Uuid) -> Vec<Ticket> {
        self.state
            .lock()
            .tickets
            .values()
            .filter(|t| t.connection_id == connection_id)
            .cloned()
            .collect()
    }

    pub fn messages_of(&self, ticket_id: Uuid) -> Vec<TicketMessage> {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.ticket_id == ticket_id)
            .cloned()
            .collect()
    }

    pub fn total_messages(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn set_status(&self, connection_id: Uuid, status: ConnectionImportStatus) {
        if let Some(c) = self.state.lock().connections.get_mut(&connection_id) {
            c.import_status = status.as_str().to_string();
        }
    }
}

#[async_trait]
impl ConnectionStore for MemoryStore {
    async fn get_connection(&self, connection_id: Uuid) -> Result<Option<Connection>> {
        Ok(self.connection(connection_id))
    }

    async fn try_begin_import(
        &self,
        connection_id: Uuid,
        total_messages: u32,
        total_batches: u32,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(c) = state.connections.get_mut(&connection_id) else {
            return Ok(false);
        };
        if c.status().is_busy() {
            return Ok(false);
        }
        c.import_status = ConnectionImportStatus::Running.as_str().to_string();
        c.import_total_messages = total_messages as i32;
        c.import_imported_messages = 0;
        c.import_total_batches = total_batches as i32;
        c.import_completed_batches = 0;
        c.import_started_at = Some(Utc::now());
        Ok(true)
    }

    async fn record_batch_completed(
        &self,
        connection_id: Uuid,
        imported_messages: u32,
    ) -> Result<ImportCounters> {
        let mut state = self.state.lock();
        let c = state
            .connections
            .get_mut(&connection_id)
            .ok_or_else(|| anyhow!("connection {} not found", connection_id))?;
        c.import_imported_messages += imported_messages as i32;
        c.import_completed_batches += 1;
        Ok(ImportCounters::from_connection(c))
    }

    async fn transition_import_status(
        &self,
        connection_id: Uuid,
        from: ConnectionImportStatus,
        to: ConnectionImportStatus,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        match state.connections.get_mut(&connection_id) {
            Some(c) if c.status() == from => {
                c.import_status = to.as_str().to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn pending_imported_tickets(
        &self,
        connection_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>> {
        Ok(self
            .tickets_on(connection_id)
            .into_iter()
            .filter(|t| t.status() == Some(TicketStatus::Pending))
            .filter(|t| t.imported_at.is_some_and(|at| at >= since))
            .collect())
    }

    async fn active_tickets(&self, connection_id: Uuid) -> Result<Vec<Ticket>> {
        let mut tickets: Vec<Ticket> = self
            .tickets_on(connection_id)
            .into_iter()
            .filter(|t| t.status().is_some_and(|s| s.is_active()))
            .collect();
        tickets.sort_by_key(|t| t.created_at);
        Ok(tickets)
    }

    async fn find_active_ticket(
        &self,
        contact_id: Uuid,
        company_id: Uuid,
        connection_id: Uuid,
    ) -> Result<Option<Ticket>> {
        Ok(self
            .tickets_on(connection_id)
            .into_iter()
            .filter(|t| t.contact_id == contact_id && t.company_id == company_id)
            .filter(|t| t.status().is_some_and(|s| s.is_active()))
            .max_by_key(|t| t.updated_at))
    }

    async fn reassign_connection(&self, ticket_id: Uuid, connection_id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        let ticket = state
            .tickets
            .get_mut(&ticket_id)
            .ok_or_else(|| anyhow!("ticket {} not found", ticket_id))?;
        ticket.connection_id = connection_id;
        ticket.updated_at = Utc::now();
        Ok(())
    }

    async fn merge_tickets(
        &self,
        source_id: Uuid,
        destination_id: Uuid,
        last_message: Option<&str>,
    ) -> Result<u64> {
        if self.fail_merges.lock().contains(&source_id) {
            anyhow::bail!("deadlock detected while merging {}", source_id);
        }
        let mut state = self.state.lock();
        let mut moved = 0;
        for message in state.messages.iter_mut().filter(|m| m.ticket_id == source_id) {
            message.ticket_id = destination_id;
            moved += 1;
        }
        if let Some(dest) = state.tickets.get_mut(&destination_id) {
            if let Some(preview) = last_message {
                dest.last_message = Some(preview.to_string());
            }
            dest.updated_at = Utc::now();
        }
        state.tickets.remove(&source_id);
        Ok(moved)
    }

    async fn contact_exists(&self, contact_id: Uuid) -> Result<bool> {
        Ok(self.state.lock().contacts.contains(&contact_id))
    }

    async fn append_system_message(
        &self,
        ticket_id: Uuid,
        contact_id: Option<Uuid>,
        body: &str,
    ) -> Result<TicketMessage> {
        let message = TicketMessage {
            id: Uuid::new_v4(),
            ticket_id,
            contact_id,
            body: body.to_string(),
            from_me: true,
            is_system: true,
            created_at: Utc::now(),
        };
        self.state.lock().messages.push(message.clone());
        Ok(message)
    }
}

#[async_trait]
impl TicketUpdater for MemoryStore {
    async fn update(&self, ticket_id: Uuid, company_id: Uuid, update: TicketUpdate) -> Result<Ticket> {
        if self.fail_updates.lock().contains(&ticket_id) {
            anyhow::bail!("update rejected for ticket {}", ticket_id);
        }
        self.updates.lock().push((ticket_id, update.clone()));
        let mut state = self.state.lock();
        let ticket = state
            .tickets
            .get_mut(&ticket_id)
            .filter(|t| t.company_id == company_id)
            .ok_or_else(|| anyhow!("ticket {} not found", ticket_id))?;
        if let Some(status) = update.status {
            ticket.status = status.as_str().to_string();
        }
        if let Some(flag) = update.is_force_delete_connection {
            ticket.is_force_delete_connection = flag;
        }
        ticket.updated_at = Utc::now();
        Ok(ticket.clone())
    }
}
