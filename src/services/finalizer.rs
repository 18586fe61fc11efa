//! Ticket lifecycle after an import
//!
//! Connection status moves `idle -> running -> closing | awaitingManualClose
//! -> idle`. With auto-close configured the finalizer sweeps the pending
//! tickets the import created; otherwise it parks the connection until an
//! operator closes them.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{ConnectionStore, ImportCounters, TicketStore};
use crate::error::{ImportError, ImportResult};
use crate::services::collaborators::TicketUpdater;
use crate::services::progress::ProgressReporter;
use crate::types::{
    batch_label, CloseSweepReport, Connection, ConnectionImportStatus, ImportProgress,
    TicketUpdate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    AutoClosed(CloseSweepReport),
    AwaitingManualClose,
}

pub struct TicketFinalizer {
    connections: Arc<dyn ConnectionStore>,
    tickets: Arc<dyn TicketStore>,
    updater: Arc<dyn TicketUpdater>,
    progress: ProgressReporter,
    /// Only pending tickets imported within this window are closed
    window: ChronoDuration,
}

impl TicketFinalizer {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        tickets: Arc<dyn TicketStore>,
        updater: Arc<dyn TicketUpdater>,
        progress: ProgressReporter,
        window: ChronoDuration,
    ) -> Self {
        Self {
            connections,
            tickets,
            updater,
            progress,
            window,
        }
    }

    /// Called once the final batch of an import has completed
    pub async fn finalize(
        &self,
        connection_id: Uuid,
        company_id: Uuid,
    ) -> anyhow::Result<FinalizeOutcome> {
        let connection = self.load(connection_id).await?;

        if connection.close_imported_tickets {
            let report = self.sweep(&connection).await?;
            return Ok(FinalizeOutcome::AutoClosed(report));
        }

        let parked = self
            .connections
            .transition_import_status(
                connection_id,
                connection.status(),
                ConnectionImportStatus::AwaitingManualClose,
            )
            .await?;
        if !parked {
            anyhow::bail!(
                "import status of connection {} changed while finalizing",
                connection_id
            );
        }

        let counters = ImportCounters::from_connection(&connection);
        self.progress.report_batch(
            company_id,
            ImportProgress::new(
                connection_id,
                counters.imported_messages,
                counters.total_messages,
                ConnectionImportStatus::AwaitingManualClose.label(),
                batch_label(
                    counters.completed_batches.saturating_sub(1),
                    counters.total_batches,
                ),
            ),
        );

        info!(
            connection_id = %connection_id,
            "Import finished, {} messages imported; awaiting manual close",
            counters.imported_messages
        );
        Ok(FinalizeOutcome::AwaitingManualClose)
    }

    /// Operator-triggered sweep. Rejected while an import or another sweep
    /// is in flight.
    pub async fn close_imported_tickets(
        &self,
        connection_id: Uuid,
    ) -> ImportResult<CloseSweepReport> {
        let connection = self.load(connection_id).await?;
        if connection.status().is_busy() {
            return Err(ImportError::ImportInProgress(connection_id));
        }

        self.sweep(&connection).await
    }

    async fn load(&self, connection_id: Uuid) -> ImportResult<Connection> {
        self.connections
            .get_connection(connection_id)
            .await?
            .ok_or(ImportError::ConnectionNotFound(connection_id))
    }

    /// Closes pending imported tickets. The connection moves from the status
    /// it was loaded with to `closing`, and back to `idle` only if nothing
    /// claimed it in the meantime.
    async fn sweep(&self, connection: &Connection) -> ImportResult<CloseSweepReport> {
        let claimed = self
            .connections
            .transition_import_status(
                connection.id,
                connection.status(),
                ConnectionImportStatus::Closing,
            )
            .await?;
        if !claimed {
            return Err(ImportError::ImportInProgress(connection.id));
        }

        let since = Utc::now() - self.window;
        let candidates = self
            .tickets
            .pending_imported_tickets(connection.id, since)
            .await?;

        let mut report = CloseSweepReport {
            candidates: candidates.len() as u32,
            ..Default::default()
        };

        for ticket in &candidates {
            match self
                .updater
                .update(ticket.id, ticket.company_id, TicketUpdate::close())
                .await
            {
                Ok(_) => report.closed += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(
                        connection_id = %connection.id,
                        ticket_id = %ticket.id,
                        "Failed to close imported ticket: {:#}",
                        e
                    );
                }
            }
        }

        let released = self
            .connections
            .transition_import_status(
                connection.id,
                ConnectionImportStatus::Closing,
                ConnectionImportStatus::Idle,
            )
            .await?;
        if released {
            self.progress.refresh(connection.company_id, connection.id);
        } else {
            warn!(
                connection_id = %connection.id,
                "Import status changed during the close sweep; leaving it as is"
            );
        }

        info!(
            connection_id = %connection.id,
            "Closed {}/{} imported tickets",
            report.closed, report.candidates
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::services::collaborators::testing::RecordingBroadcaster;
    use crate::services::progress::{company_channel, ProgressReporter};
    use crate::types::{Ticket, TicketStatus};

    struct Fixture {
        store: Arc<MemoryStore>,
        broadcaster: Arc<RecordingBroadcaster>,
        progress: ProgressReporter,
        finalizer: TicketFinalizer,
        company: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let progress = ProgressReporter::spawn(broadcaster.clone(), 10);
        let finalizer = TicketFinalizer::new(
            store.clone(),
            store.clone(),
            store.clone(),
            progress.clone(),
            ChronoDuration::hours(5),
        );
        Fixture {
            store,
            broadcaster,
            progress,
            finalizer,
            company: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_auto_close_only_touches_pending_inside_window() {
        let f = fixture();
        let conn = f.store.add_connection(f.company, "main", true);
        let contact = f.store.add_contact();
        let now = Utc::now();

        let fresh = f.store.add_ticket(f.company, conn, contact, TicketStatus::Pending, Some(now - ChronoDuration::hours(1)), None);
        let stale = f.store.add_ticket(f.company, conn, contact, TicketStatus::Pending, Some(now - ChronoDuration::hours(6)), None);
        let live = f.store.add_ticket(f.company, conn, contact, TicketStatus::Pending, None, None);
        let open = f.store.add_ticket(f.company, conn, contact, TicketStatus::Open, Some(now), None);

        let outcome = f.finalizer.finalize(conn, f.company).await.unwrap();

        assert_eq!(
            outcome,
            FinalizeOutcome::AutoClosed(CloseSweepReport { candidates: 1, closed: 1, failed: 0 })
        );
        assert_eq!(f.store.ticket(fresh).unwrap().status(), Some(TicketStatus::Closed));
        assert_eq!(f.store.ticket(stale).unwrap().status(), Some(TicketStatus::Pending));
        assert_eq!(f.store.ticket(live).unwrap().status(), Some(TicketStatus::Pending));
        assert_eq!(f.store.ticket(open).unwrap().status(), Some(TicketStatus::Open));
        assert_eq!(f.store.connection(conn).unwrap().status(), ConnectionImportStatus::Idle);

        f.progress.flush().await;
        let events = f.broadcaster.on_channel(&company_channel(f.company));
        assert_eq!(events.last().unwrap()["action"], "refresh");
    }

    #[tokio::test]
    async fn test_without_auto_close_awaits_manual_close() {
        let f = fixture();
        let conn = f.store.add_connection(f.company, "main", false);
        let contact = f.store.add_contact();
        let ticket = f.store.add_ticket(f.company, conn, contact, TicketStatus::Pending, Some(Utc::now()), None);

        let outcome = f.finalizer.finalize(conn, f.company).await.unwrap();

        assert_eq!(outcome, FinalizeOutcome::AwaitingManualClose);
        assert_eq!(
            f.store.connection(conn).unwrap().status(),
            ConnectionImportStatus::AwaitingManualClose
        );
        assert_eq!(f.store.ticket(ticket).unwrap().status(), Some(TicketStatus::Pending));

        f.progress.flush().await;
        let events = f.broadcaster.on_channel(&company_channel(f.company));
        assert_eq!(events.last().unwrap()["statusLabel"], "awaitingManualClose");
    }

    #[tokio::test]
    async fn test_sweep_continues_past_failed_ticket() {
        let f = fixture();
        let conn = f.store.add_connection(f.company, "main", false);
        let contact = f.store.add_contact();
        let now = Utc::now();
        let bad = f.store.add_ticket(f.company, conn, contact, TicketStatus::Pending, Some(now), None);
        let good = f.store.add_ticket(f.company, conn, contact, TicketStatus::Pending, Some(now), None);
        f.store.fail_updates.lock().insert(bad);
        f.store.set_status(conn, ConnectionImportStatus::AwaitingManualClose);

        let report = f.finalizer.close_imported_tickets(conn).await.unwrap();

        assert_eq!(report, CloseSweepReport { candidates: 2, closed: 1, failed: 1 });
        assert_eq!(f.store.ticket(good).unwrap().status(), Some(TicketStatus::Closed));
        assert_eq!(f.store.connection(conn).unwrap().status(), ConnectionImportStatus::Idle);
    }

    #[tokio::test]
    async fn test_manual_close_rejected_while_running() {
        let f = fixture();
        let conn = f.store.add_connection(f.company, "main", false);
        f.store.set_status(conn, ConnectionImportStatus::Running);

        let err = f.finalizer.close_imported_tickets(conn).await.unwrap_err();
        assert!(matches!(err, ImportError::ImportInProgress(id) if id == conn));
    }

    #[tokio::test]
    async fn test_manual_close_rejected_while_another_sweep_runs() {
        let f = fixture();
        let conn = f.store.add_connection(f.company, "main", false);
        let contact = f.store.add_contact();
        let ticket = f.store.add_ticket(f.company, conn, contact, TicketStatus::Pending, Some(Utc::now()), None);
        f.store.set_status(conn, ConnectionImportStatus::Closing);

        let err = f.finalizer.close_imported_tickets(conn).await.unwrap_err();
        assert!(matches!(err, ImportError::ImportInProgress(id) if id == conn));
        assert_eq!(f.store.ticket(ticket).unwrap().status(), Some(TicketStatus::Pending));
        assert_eq!(f.store.connection(conn).unwrap().status(), ConnectionImportStatus::Closing);
    }

    /// Closes tickets through the store, but moves the connection to
    /// `running` first, as a newer import claiming it mid-sweep would
    struct ReclaimingUpdater {
        store: Arc<MemoryStore>,
        connection_id: Uuid,
    }

    #[async_trait::async_trait]
    impl TicketUpdater for ReclaimingUpdater {
        async fn update(
            &self,
            ticket_id: Uuid,
            company_id: Uuid,
            update: TicketUpdate,
        ) -> anyhow::Result<Ticket> {
            self.store.set_status(self.connection_id, ConnectionImportStatus::Running);
            self.store.update(ticket_id, company_id, update).await
        }
    }

    #[tokio::test]
    async fn test_sweep_does_not_overwrite_newer_status() {
        let f = fixture();
        let conn = f.store.add_connection(f.company, "main", true);
        let contact = f.store.add_contact();
        let ticket = f.store.add_ticket(f.company, conn, contact, TicketStatus::Pending, Some(Utc::now()), None);
        let finalizer = TicketFinalizer::new(
            f.store.clone(),
            f.store.clone(),
            Arc::new(ReclaimingUpdater {
                store: f.store.clone(),
                connection_id: conn,
            }),
            f.progress.clone(),
            ChronoDuration::hours(5),
        );

        let outcome = finalizer.finalize(conn, f.company).await.unwrap();

        assert_eq!(
            outcome,
            FinalizeOutcome::AutoClosed(CloseSweepReport { candidates: 1, closed: 1, failed: 0 })
        );
        assert_eq!(f.store.ticket(ticket).unwrap().status(), Some(TicketStatus::Closed));
        assert_eq!(f.store.connection(conn).unwrap().status(), ConnectionImportStatus::Running);

        f.progress.flush().await;
        let events = f.broadcaster.on_channel(&company_channel(f.company));
        assert!(events.iter().all(|e| e["action"] != "refresh"));
    }

    #[tokio::test]
    async fn test_unknown_connection_is_an_error() {
        let f = fixture();
        assert!(f.finalizer.finalize(Uuid::new_v4(), f.company).await.is_err());
        assert!(matches!(
            f.finalizer.close_imported_tickets(Uuid::new_v4()).await,
            Err(ImportError::ConnectionNotFound(_))
        ));
    }
}
