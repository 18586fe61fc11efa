//! Job handler for the import queue
//!
//! A batch job replays its messages, publishes progress and bumps the
//! connection counters. The job for the final batch hands back a finalize
//! job so the lifecycle transition retries on its own, without replaying
//! messages again.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::db::ConnectionStore;
use crate::error::ImportError;
use crate::services::batch_queue::JobHandler;
use crate::services::collaborators::GatewayClient;
use crate::services::finalizer::{FinalizeOutcome, TicketFinalizer};
use crate::services::progress::ProgressReporter;
use crate::services::replay::ReplayEngine;
use crate::types::{
    batch_label, ConnectionImportStatus, FinalizeImportJob, ImportBatchJob, ImportProgress,
    JobOptions, JobOutcome, JobPayload, JobPriority,
};

pub struct ImportPipeline {
    gateway: Arc<dyn GatewayClient>,
    connections: Arc<dyn ConnectionStore>,
    replay: ReplayEngine,
    progress: ProgressReporter,
    finalizer: Arc<TicketFinalizer>,
    /// Retry policy for finalize jobs
    finalize_opts: JobOptions,
}

impl ImportPipeline {
    pub fn new(
        gateway: Arc<dyn GatewayClient>,
        connections: Arc<dyn ConnectionStore>,
        replay: ReplayEngine,
        progress: ProgressReporter,
        finalizer: Arc<TicketFinalizer>,
        finalize_opts: JobOptions,
    ) -> Self {
        Self {
            gateway,
            connections,
            replay,
            progress,
            finalizer,
            finalize_opts: JobOptions {
                priority: JobPriority::Normal,
                ..finalize_opts
            },
        }
    }

    async fn import_batch(&self, job: &ImportBatchJob) -> anyhow::Result<JobOutcome> {
        let connection_id = job.connection_id;
        let handle = self
            .gateway
            .connection_handle(connection_id)
            .await?
            .ok_or(ImportError::GatewayUnavailable(connection_id))?;

        let label = batch_label(job.batch_index, job.total_batches);
        let batch_len = job.messages.len() as u32;
        let running = ConnectionImportStatus::Running.label();

        debug!(
            connection_id = %connection_id,
            batch_index = job.batch_index,
            "Replaying batch {} ({} messages)",
            label, batch_len
        );
        self.progress.report_batch(
            job.company_id,
            ImportProgress::new(connection_id, 0, batch_len, running, label.clone()),
        );

        let report = self
            .replay
            .replay(&job.messages, &handle, job.company_id, |r| {
                self.progress.report_message(
                    job.company_id,
                    ImportProgress::new(connection_id, r.processed, batch_len, running, label.clone()),
                );
            })
            .await;

        let counters = self
            .connections
            .record_batch_completed(connection_id, report.succeeded)
            .await?;

        self.progress.report_batch(
            job.company_id,
            ImportProgress::new(
                connection_id,
                counters.imported_messages,
                counters.total_messages,
                running,
                label.clone(),
            ),
        );

        info!(
            connection_id = %connection_id,
            batch_index = job.batch_index,
            "Batch {} done: {} imported, {} skipped ({}/{} batches complete)",
            label,
            report.succeeded,
            report.failed,
            counters.completed_batches,
            counters.total_batches
        );

        let mut outcome = JobOutcome::processed(report.succeeded);
        if job.is_last() {
            let finalize = JobPayload::FinalizeImport(FinalizeImportJob {
                connection_id,
                company_id: job.company_id,
            });
            outcome.follow_up = Some((finalize, self.finalize_opts.clone()));
        }
        Ok(outcome)
    }

    async fn finalize(&self, job: &FinalizeImportJob) -> anyhow::Result<JobOutcome> {
        let outcome = self
            .finalizer
            .finalize(job.connection_id, job.company_id)
            .await?;

        let closed = match outcome {
            FinalizeOutcome::AutoClosed(report) => report.closed,
            FinalizeOutcome::AwaitingManualClose => 0,
        };
        Ok(JobOutcome::processed(closed))
    }
}

#[async_trait]
impl JobHandler for ImportPipeline {
    async fn handle(&self, payload: &JobPayload) -> anyhow::Result<JobOutcome> {
        match payload {
            JobPayload::ImportBatch(job) => self.import_batch(job).await,
            JobPayload::FinalizeImport(job) => self.finalize(job).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::services::collaborators::testing::{
        RecordingBroadcaster, RecordingInbound, StaticGateway,
    };
    use crate::services::progress::connection_channel;
    use crate::services::replay::ReplayRate;
    use crate::types::RawInboundMessage;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use std::sync::atomic::Ordering;

    struct Fixture {
        store: Arc<MemoryStore>,
        gateway: Arc<StaticGateway>,
        inbound: Arc<RecordingInbound>,
        broadcaster: Arc<RecordingBroadcaster>,
        progress: ProgressReporter,
        pipeline: ImportPipeline,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(StaticGateway::default());
        let inbound = Arc::new(RecordingInbound::default());
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let progress = ProgressReporter::spawn(broadcaster.clone(), 2);
        let finalizer = Arc::new(TicketFinalizer::new(
            store.clone(),
            store.clone(),
            store.clone(),
            progress.clone(),
            ChronoDuration::hours(5),
        ));
        let pipeline = ImportPipeline::new(
            gateway.clone(),
            store.clone(),
            ReplayEngine::new(inbound.clone(), ReplayRate::unlimited()),
            progress.clone(),
            finalizer,
            JobOptions::default(),
        );
        Fixture {
            store,
            gateway,
            inbound,
            broadcaster,
            progress,
            pipeline,
        }
    }

    fn messages(n: usize) -> Vec<RawInboundMessage> {
        (0..n)
            .map(|i| RawInboundMessage {
                external_id: format!("m{}", i),
                routing_key: "r@chat".to_string(),
                alt_routing_key: None,
                timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + i as i64, 0).unwrap(),
                from_me: false,
                is_group: false,
                push_name: None,
                payload: serde_json::Value::Null,
            })
            .collect()
    }

    fn job(f: &Fixture, batch_index: u32, total_batches: u32) -> (ImportBatchJob, uuid::Uuid) {
        let company = uuid::Uuid::new_v4();
        let conn = f.store.add_connection(company, "main", false);
        (
            ImportBatchJob {
                connection_id: conn,
                company_id: company,
                batch_index,
                total_batches,
                messages: messages(5),
            },
            conn,
        )
    }

    #[tokio::test]
    async fn test_batch_updates_counters_and_emits_progress() {
        let f = fixture();
        let (batch, conn) = job(&f, 0, 2);
        f.store.try_begin_import(conn, 10, 2).await.unwrap();

        let outcome = f.pipeline.handle(&JobPayload::ImportBatch(batch.clone())).await.unwrap();

        assert_eq!(outcome.processed, 5);
        assert!(outcome.follow_up.is_none());
        assert_eq!(f.inbound.handled_ids().len(), 5);

        let connection = f.store.connection(conn).unwrap();
        assert_eq!(connection.import_imported_messages, 5);
        assert_eq!(connection.import_completed_batches, 1);

        f.progress.flush().await;
        let fine = f.broadcaster.on_channel(&connection_channel(batch.company_id, conn));
        let counts: Vec<u64> = fine.iter().map(|e| e["processedCount"].as_u64().unwrap()).collect();
        assert_eq!(counts, vec![2, 4, 5]);
        assert_eq!(fine[0]["batchLabel"], "1/2");
    }

    #[tokio::test]
    async fn test_last_batch_returns_finalize_follow_up() {
        let f = fixture();
        let (batch, conn) = job(&f, 1, 2);
        f.store.try_begin_import(conn, 10, 2).await.unwrap();

        let outcome = f.pipeline.handle(&JobPayload::ImportBatch(batch)).await.unwrap();

        let (payload, opts) = outcome.follow_up.unwrap();
        assert!(matches!(payload, JobPayload::FinalizeImport(ref j) if j.connection_id == conn));
        assert_eq!(opts.priority, JobPriority::Normal);
    }

    #[tokio::test]
    async fn test_offline_gateway_fails_batch_for_retry() {
        let f = fixture();
        let (batch, conn) = job(&f, 0, 1);
        f.store.try_begin_import(conn, 5, 1).await.unwrap();
        f.gateway.offline.store(true, Ordering::SeqCst);

        assert!(f.pipeline.handle(&JobPayload::ImportBatch(batch)).await.is_err());
        assert!(f.inbound.handled_ids().is_empty());
        assert_eq!(f.store.connection(conn).unwrap().import_completed_batches, 0);
    }

    #[tokio::test]
    async fn test_finalize_job_runs_finalizer() {
        let f = fixture();
        let (_, conn) = job(&f, 0, 1);
        let company = f.store.connection(conn).unwrap().company_id;

        let payload = JobPayload::FinalizeImport(FinalizeImportJob {
            connection_id: conn,
            company_id: company,
        });
        f.pipeline.handle(&payload).await.unwrap();

        assert_eq!(
            f.store.connection(conn).unwrap().status(),
            ConnectionImportStatus::AwaitingManualClose
        );
    }
}
