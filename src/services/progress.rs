//! Import progress reporting
//!
//! Replay must never wait on the broker, so `report_*` only pushes onto a
//! bounded channel; a background task publishes in order. A full channel
//! drops the event.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::collaborators::Broadcaster;
use crate::types::ImportProgress;

const DEFAULT_CAPACITY: usize = 1024;

/// Company-wide import channel (coarse events)
pub fn company_channel(company_id: Uuid) -> String {
    format!("chatdesk.company.{}.import", company_id)
}

/// Per-connection import channel (fine-grained events)
pub fn connection_channel(company_id: Uuid, connection_id: Uuid) -> String {
    format!(
        "chatdesk.company.{}.connection.{}.import",
        company_id, connection_id
    )
}

/// Event body published on the import channels
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ImportEvent {
    Progress(ImportProgress),
    #[serde(rename_all = "camelCase")]
    Refresh { connection_id: Uuid },
}

enum Command {
    Publish {
        channel: String,
        event: ImportEvent,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct ProgressReporter {
    tx: mpsc::Sender<Command>,
    progress_every: u32,
}

impl ProgressReporter {
    /// Spawn the publisher task. Must be called inside a tokio runtime.
    pub fn spawn(broadcaster: Arc<dyn Broadcaster>, progress_every: u32) -> Self {
        Self::with_capacity(broadcaster, progress_every, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(
        broadcaster: Arc<dyn Broadcaster>,
        progress_every: u32,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(publish_loop(broadcaster, rx));
        Self {
            tx,
            progress_every: progress_every.max(1),
        }
    }

    /// Queue an event without waiting
    pub fn report(&self, channel: String, event: ImportEvent) {
        match self.tx.try_send(Command::Publish { channel, event }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(Command::Publish { channel, .. })) => {
                warn!(channel = %channel, "Progress channel full, dropping event");
            }
            Err(_) => {
                warn!("Progress publisher stopped, dropping event");
            }
        }
    }

    /// Coarse event on the company channel (batch start/end, completion)
    pub fn report_batch(&self, company_id: Uuid, progress: ImportProgress) {
        self.report(company_channel(company_id), ImportEvent::Progress(progress));
    }

    /// Fine event on the connection channel, emitted every `progress_every`
    /// messages and on the last one
    pub fn report_message(&self, company_id: Uuid, progress: ImportProgress) {
        let due = progress.processed_count % self.progress_every == 0
            || progress.processed_count >= progress.total_count;
        if due {
            let channel = connection_channel(company_id, progress.connection_id);
            self.report(channel, ImportEvent::Progress(progress));
        }
    }

    /// Ask observers to reload the connection's tickets
    pub fn refresh(&self, company_id: Uuid, connection_id: Uuid) {
        self.report(
            company_channel(company_id),
            ImportEvent::Refresh { connection_id },
        );
    }

    /// Wait until every event queued before this call has been handed to the
    /// broadcaster
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn publish_loop(broadcaster: Arc<dyn Broadcaster>, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Publish { channel, event } => {
                let payload = match serde_json::to_value(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, "Failed to serialize progress event: {}", e);
                        continue;
                    }
                };
                if let Err(e) = broadcaster.publish(&channel, payload).await {
                    warn!(channel = %channel, "Failed to publish progress: {}", e);
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Progress publisher stopped");
}
