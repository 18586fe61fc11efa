//! Ticket consolidation when a contact's connection changes
//!
//! Moving a contact from connection A to B must leave B with at most one
//! active ticket per contact. A ticket without a counterpart on B is simply
//! reassigned; otherwise it is merged into the existing ticket and deleted.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{ConnectionStore, TicketStore};
use crate::error::{ImportError, ImportResult};
use crate::services::collaborators::TicketUpdater;
use crate::types::{
    merge_previews, Connection, ForceCloseReport, Ticket, TicketUpdate, TransferReport,
};

const DELETED_CONNECTION_NOTICE: &str =
    "This conversation was closed because its connection was deleted.";

enum Transfer {
    Moved,
    Merged { messages: u64 },
}

pub struct TicketConsolidator {
    connections: Arc<dyn ConnectionStore>,
    tickets: Arc<dyn TicketStore>,
    updater: Arc<dyn TicketUpdater>,
}

impl TicketConsolidator {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        tickets: Arc<dyn TicketStore>,
        updater: Arc<dyn TicketUpdater>,
    ) -> Self {
        Self {
            connections,
            tickets,
            updater,
        }
    }

    /// Move every open or pending ticket of `old_connection_id` onto
    /// `new_connection_id`. Failing tickets are logged and skipped.
    pub async fn transfer_tickets(
        &self,
        old_connection_id: Uuid,
        new_connection_id: Uuid,
        user_id: Uuid,
    ) -> ImportResult<TransferReport> {
        let source = self.load(old_connection_id).await?;
        let destination = self.load(new_connection_id).await?;
        if source.company_id != destination.company_id {
            return Err(ImportError::CompanyMismatch(source.id, destination.id));
        }

        let tickets = self.tickets.active_tickets(source.id).await?;
        let mut report = TransferReport::default();

        for ticket in &tickets {
            match self.transfer_one(ticket, &source, &destination, user_id).await {
                Ok(Transfer::Moved) => report.moved += 1,
                Ok(Transfer::Merged { messages }) => {
                    report.merged += 1;
                    info!(
                        ticket_id = %ticket.id,
                        connection_id = %destination.id,
                        "Merged ticket ({} messages moved)",
                        messages
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        ticket_id = %ticket.id,
                        connection_id = %source.id,
                        "Failed to transfer ticket to connection {}: {:#}",
                        destination.id,
                        e
                    );
                }
            }
        }

        info!(
            connection_id = %source.id,
            "Transferred tickets to {}: {} moved, {} merged, {} failed",
            destination.id, report.moved, report.merged, report.failed
        );
        Ok(report)
    }

    async fn transfer_one(
        &self,
        ticket: &Ticket,
        source: &Connection,
        destination: &Connection,
        user_id: Uuid,
    ) -> anyhow::Result<Transfer> {
        let existing = self
            .tickets
            .find_active_ticket(ticket.contact_id, ticket.company_id, destination.id)
            .await?;

        let Some(target) = existing else {
            self.tickets
                .reassign_connection(ticket.id, destination.id)
                .await?;
            let notice = format!(
                "Ticket transferred from connection \"{}\" to \"{}\" by user {}.",
                source.name, destination.name, user_id
            );
            self.tickets
                .append_system_message(ticket.id, None, &notice)
                .await?;
            return Ok(Transfer::Moved);
        };

        let preview = merge_previews(target.last_message.as_deref(), ticket.last_message.as_deref());
        let messages = self
            .tickets
            .merge_tickets(ticket.id, target.id, preview.as_deref())
            .await?;

        let notice = format!(
            "Ticket {} from connection \"{}\" was merged into this ticket on \"{}\" by user {}.",
            ticket.id, source.name, destination.name, user_id
        );
        self.tickets
            .append_system_message(target.id, None, &notice)
            .await?;

        Ok(Transfer::Merged { messages })
    }

    /// Force-close every open or pending ticket of a deleted connection.
    /// The connection row itself may already be gone.
    pub async fn close_tickets_for_deleted_connection(
        &self,
        connection_id: Uuid,
        company_id: Uuid,
    ) -> ImportResult<ForceCloseReport> {
        let tickets: Vec<Ticket> = self
            .tickets
            .active_tickets(connection_id)
            .await?
            .into_iter()
            .filter(|t| t.company_id == company_id)
            .collect();

        let mut report = ForceCloseReport::default();

        for ticket in &tickets {
            if let Err(e) = self
                .updater
                .update(ticket.id, company_id, TicketUpdate::force_close())
                .await
            {
                report.failed += 1;
                error!(
                    ticket_id = %ticket.id,
                    connection_id = %connection_id,
                    "Failed to force-close ticket: {:#}",
                    e
                );
                continue;
            }
            report.closed += 1;

            match self.notify_contact(ticket).await {
                Ok(true) => report.messaged += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    ticket_id = %ticket.id,
                    connection_id = %connection_id,
                    "Closed ticket but could not append notice: {:#}",
                    e
                ),
            }
        }

        info!(
            connection_id = %connection_id,
            "Deleted connection sweep: {} closed, {} messaged, {} failed",
            report.closed, report.messaged, report.failed
        );
        Ok(report)
    }

    async fn notify_contact(&self, ticket: &Ticket) -> anyhow::Result<bool> {
        if !self.tickets.contact_exists(ticket.contact_id).await? {
            return Ok(false);
        }
        self.tickets
            .append_system_message(ticket.id, Some(ticket.contact_id), DELETED_CONNECTION_NOTICE)
            .await?;
        Ok(true)
    }

    async fn load(&self, connection_id: Uuid) -> ImportResult<Connection> {
        self.connections
            .get_connection(connection_id)
            .await?
            .ok_or(ImportError::ConnectionNotFound(connection_id))
    }
}
