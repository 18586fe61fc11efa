//! Import facade
//!
//! Entry points used by the NATS handlers. Builds the pipeline, the queue
//! service, the finalizer and the consolidator from the collaborators.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ImportConfig;
use crate::db::{ConnectionStore, ImportCounters, TicketStore};
use crate::error::{ImportError, ImportResult};
use crate::services::batch_queue::{BatchQueue, ImportQueue};
use crate::services::collaborators::{Broadcaster, GatewayClient, InboundHandler, TicketUpdater};
use crate::services::consolidator::TicketConsolidator;
use crate::services::finalizer::TicketFinalizer;
use crate::services::import_pipeline::ImportPipeline;
use crate::services::normalizer::{normalize, partition};
use crate::services::progress::ProgressReporter;
use crate::services::replay::ReplayEngine;
use crate::types::{
    batch_label, BatchInfo, CloseSweepReport, Connection, ConnectionImportStatus,
    FinalizeImportJob, ForceCloseReport, ImportBatchJob, ImportProgress, ImportStatusResponse,
    JobOptions, JobPayload, QueueOverview, StartImportRequest, StartImportResponse,
    TransferReport, TransferTicketsRequest,
};

/// Everything the import pipeline talks to
#[derive(Clone)]
pub struct ImportDeps {
    pub connections: Arc<dyn ConnectionStore>,
    pub tickets: Arc<dyn TicketStore>,
    pub updater: Arc<dyn TicketUpdater>,
    pub gateway: Arc<dyn GatewayClient>,
    pub inbound: Arc<dyn InboundHandler>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

pub struct ImportService {
    connections: Arc<dyn ConnectionStore>,
    gateway: Arc<dyn GatewayClient>,
    queue: ImportQueue,
    finalizer: Arc<TicketFinalizer>,
    consolidator: TicketConsolidator,
    progress: ProgressReporter,
    batch_size: usize,
    batch_opts: JobOptions,
    finalize_opts: JobOptions,
    shutdown_grace: Duration,
}

impl ImportService {
    /// Wire up the pipeline. Spawns the progress publisher, so it must run
    /// inside a tokio runtime; the queue itself starts on first import.
    pub fn new(deps: ImportDeps, config: &ImportConfig) -> Self {
        let progress = ProgressReporter::spawn(deps.broadcaster.clone(), config.progress_every);

        let finalizer = Arc::new(TicketFinalizer::new(
            deps.connections.clone(),
            deps.tickets.clone(),
            deps.updater.clone(),
            progress.clone(),
            config.auto_close_window,
        ));

        let pipeline = ImportPipeline::new(
            deps.gateway.clone(),
            deps.connections.clone(),
            ReplayEngine::new(deps.inbound.clone(), config.replay_rate()),
            progress.clone(),
            finalizer.clone(),
            config.finalize_job_options(),
        );

        let consolidator = TicketConsolidator::new(
            deps.connections.clone(),
            deps.tickets.clone(),
            deps.updater.clone(),
        );

        Self {
            connections: deps.connections,
            gateway: deps.gateway,
            queue: ImportQueue::new(Arc::new(pipeline), config.queue_config()),
            finalizer,
            consolidator,
            progress,
            batch_size: config.batch_size,
            batch_opts: config.batch_job_options(),
            finalize_opts: config.finalize_job_options(),
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Normalize, partition and enqueue an import. Returns as soon as the
    /// jobs are queued.
    pub async fn start_import(&self, request: StartImportRequest) -> ImportResult<StartImportResponse> {
        let connection = self.load(request.connection_id).await?;
        if connection.company_id != request.company_id {
            return Err(ImportError::CompanyMismatch(connection.id, request.company_id));
        }
        match connection.status() {
            ConnectionImportStatus::Running => {
                return Err(ImportError::AlreadyRunning(connection.id));
            }
            ConnectionImportStatus::Closing => {
                return Err(ImportError::ImportInProgress(connection.id));
            }
            ConnectionImportStatus::Idle | ConnectionImportStatus::AwaitingManualClose => {}
        }

        let raw = match request.messages {
            Some(messages) => messages,
            None => self.gateway.buffered_messages(connection.id).await?,
        };
        let raw_count = raw.len();
        let normalized = normalize(raw);
        let total_messages = normalized.len() as u32;
        let batches = partition(normalized, self.batch_size);
        let total_batches = batches.len() as u32;

        let mut payloads: Vec<(JobPayload, JobOptions)> = batches
            .into_iter()
            .map(|batch| {
                let job = ImportBatchJob::from_batch(connection.id, connection.company_id, batch);
                (JobPayload::ImportBatch(job), self.batch_opts.clone())
            })
            .collect();
        if payloads.is_empty() {
            // Nothing to replay, go straight to the lifecycle transition
            let finalize = JobPayload::FinalizeImport(FinalizeImportJob {
                connection_id: connection.id,
                company_id: connection.company_id,
            });
            payloads.push((finalize, self.finalize_opts.clone()));
        }
        for (payload, _) in &payloads {
            payload.validate().map_err(ImportError::InvalidJob)?;
        }

        if !self
            .connections
            .try_begin_import(connection.id, total_messages, total_batches)
            .await?
        {
            return Err(ImportError::AlreadyRunning(connection.id));
        }

        let queue = match self.queue.get_or_init().await {
            Ok(queue) => queue,
            Err(e) => {
                self.release(connection.id).await;
                return Err(e);
            }
        };

        let mut job_ids = Vec::with_capacity(payloads.len());
        for (payload, opts) in payloads {
            match queue.enqueue(payload, opts) {
                Ok(handle) => job_ids.push(handle.job_id),
                Err(e) => {
                    error!(
                        connection_id = %connection.id,
                        "Failed to enqueue import job after {} queued: {}",
                        job_ids.len(),
                        e
                    );
                    self.abandon(&queue, connection.id, &job_ids).await;
                    return Err(e);
                }
            }
        }

        self.progress.report_batch(
            connection.company_id,
            ImportProgress::new(
                connection.id,
                0,
                total_messages,
                ConnectionImportStatus::Running.label(),
                batch_label(0, total_batches),
            ),
        );

        info!(
            connection_id = %connection.id,
            "Import started: {} messages ({} raw) in {} batches",
            total_messages, raw_count, total_batches
        );

        Ok(StartImportResponse {
            connection_id: connection.id,
            total_messages,
            total_batches,
            job_ids,
        })
    }

    pub async fn import_status(&self, connection_id: Uuid) -> ImportResult<ImportStatusResponse> {
        let connection = self.load(connection_id).await?;
        let counters = ImportCounters::from_connection(&connection);

        Ok(ImportStatusResponse {
            status: connection.status(),
            total_messages: counters.total_messages,
            imported_messages: counters.imported_messages,
            batch_info: BatchInfo {
                completed_batches: counters.completed_batches,
                total_batches: counters.total_batches,
            },
        })
    }

    pub async fn close_imported_tickets(&self, connection_id: Uuid) -> ImportResult<CloseSweepReport> {
        self.finalizer.close_imported_tickets(connection_id).await
    }

    pub async fn transfer_tickets(&self, request: TransferTicketsRequest) -> ImportResult<TransferReport> {
        self.consolidator
            .transfer_tickets(
                request.old_connection_id,
                request.new_connection_id,
                request.user_id,
            )
            .await
    }

    pub async fn connection_deleted(
        &self,
        connection_id: Uuid,
        company_id: Uuid,
    ) -> ImportResult<ForceCloseReport> {
        self.consolidator
            .close_tickets_for_deleted_connection(connection_id, company_id)
            .await
    }

    /// Queue counters and dead letters; empty before the first import
    pub async fn queue_overview(&self) -> QueueOverview {
        match self.queue.current().await {
            Some(queue) => queue.overview(),
            None => QueueOverview {
                stats: Default::default(),
                dead_letters: Vec::new(),
            },
        }
    }

    /// Let queued imports drain for up to the grace period, then stop the
    /// queue and push out any buffered progress events
    pub async fn shutdown(&self) {
        if let Some(queue) = self.queue.current().await {
            if tokio::time::timeout(self.shutdown_grace, queue.wait_idle())
                .await
                .is_err()
            {
                warn!(
                    "Import queue still busy after {:?}, stopping anyway",
                    self.shutdown_grace
                );
            }
        }
        self.queue.shutdown().await;
        self.progress.flush().await;
    }

    async fn load(&self, connection_id: Uuid) -> ImportResult<Connection> {
        self.connections
            .get_connection(connection_id)
            .await?
            .ok_or(ImportError::ConnectionNotFound(connection_id))
    }

    /// Withdraw the jobs of a partially queued import. The connection is
    /// released only when none of them has started; otherwise the import
    /// stays `running` so its counters keep a single owner.
    async fn abandon(&self, queue: &BatchQueue, connection_id: Uuid, job_ids: &[Uuid]) {
        let withdrawn = queue.cancel_pending(job_ids);
        if withdrawn == job_ids.len() {
            self.release(connection_id).await;
        } else {
            warn!(
                connection_id = %connection_id,
                "{} of {} queued jobs already started, import left running",
                job_ids.len() - withdrawn,
                job_ids.len()
            );
        }
    }

    /// Give the connection back after an import that could not be queued
    async fn release(&self, connection_id: Uuid) {
        match self
            .connections
            .transition_import_status(
                connection_id,
                ConnectionImportStatus::Running,
                ConnectionImportStatus::Idle,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                connection_id = %connection_id,
                "Import status moved on before release, leaving it"
            ),
            Err(e) => warn!(
                connection_id = %connection_id,
                "Failed to reset import status: {:#}",
                e
            ),
        }
    }
}
