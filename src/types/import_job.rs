//! Import queue job types
//!
//! These types describe the units scheduled on the import batch queue:
//! - Replay of one normalized message batch
//! - Lifecycle finalization once the last batch of an import completes

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{MessageBatch, RawInboundMessage};

// ==========================================================================
// Tests First (TDD)
// ==========================================================================


// ==========================================================================
// Payloads
// ==========================================================================

/// Replay one normalized batch of an import
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportBatchJob {
    pub connection_id: Uuid,
    pub company_id: Uuid,
    pub batch_index: u32,
    pub total_batches: u32,
    pub messages: Vec<RawInboundMessage>,
}

impl ImportBatchJob {
    pub fn from_batch(connection_id: Uuid, company_id: Uuid, batch: MessageBatch) -> Self {
        Self {
            connection_id,
            company_id,
            batch_index: batch.batch_index,
            total_batches: batch.total_batches,
            messages: batch.messages,
        }
    }

    pub fn is_last(&self) -> bool {
        self.batch_index + 1 == self.total_batches
    }
}

/// Transition the connection's import lifecycle after its final batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeImportJob {
    pub connection_id: Uuid,
    pub company_id: Uuid,
}

/// Job payload scheduled on the import queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobPayload {
    ImportBatch(ImportBatchJob),
    FinalizeImport(FinalizeImportJob),
}

impl JobPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            JobPayload::ImportBatch(_) => "import.batch",
            JobPayload::FinalizeImport(_) => "import.finalize",
        }
    }

    pub fn connection_id(&self) -> Uuid {
        match self {
            JobPayload::ImportBatch(job) => job.connection_id,
            JobPayload::FinalizeImport(job) => job.connection_id,
        }
    }

    pub fn batch_index(&self) -> Option<u32> {
        match self {
            JobPayload::ImportBatch(job) => Some(job.batch_index),
            JobPayload::FinalizeImport(_) => None,
        }
    }

    /// Structural checks performed before a job is accepted by the queue
    pub fn validate(&self) -> Result<(), String> {
        match self {
            JobPayload::ImportBatch(job) => {
                if job.total_batches == 0 {
                    return Err("total batches must be at least 1".to_string());
                }
                if job.batch_index >= job.total_batches {
                    return Err(format!(
                        "batch index {} out of range for {} batches",
                        job.batch_index, job.total_batches
                    ));
                }
                if job.messages.is_empty() {
                    return Err(format!("batch {} has no messages", job.batch_index));
                }
                Ok(())
            }
            JobPayload::FinalizeImport(_) => Ok(()),
        }
    }
}

// ==========================================================================
// Scheduling options
// ==========================================================================

/// Job priority; live traffic outranks bulk imports
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum JobPriority {
    /// Bulk background work (import batches)
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

/// Per-job scheduling options
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Total attempts including the first one
    pub attempts: u32,
    /// Delay before the first retry; doubled for every following retry
    pub backoff_base: Duration,
    pub priority: JobPriority,
    /// Drop the job record as soon as the job succeeds
    pub remove_on_complete: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(5),
            priority: JobPriority::Normal,
            remove_on_complete: true,
        }
    }
}

impl JobOptions {
    pub fn import_batch() -> Self {
        Self {
            priority: JobPriority::Low,
            ..Default::default()
        }
    }

    /// Delay before retrying after `failed_attempt` (1-based) failed
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exponent)
    }
}

// ==========================================================================
// Records
// ==========================================================================

/// Lifecycle of a queued job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Queued,
    Running,
    /// Failed, waiting for its backoff before the next attempt
    Retrying,
    Completed,
    DeadLettered,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::DeadLettered)
    }
}

/// Bookkeeping the queue keeps for each job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: Uuid,
    pub job_type: String,
    pub connection_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<u32>,
    pub state: JobState,
    /// Attempts started so far
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed: Option<u32>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: Uuid, payload: &JobPayload, opts: &JobOptions) -> Self {
        Self {
            id,
            job_type: payload.type_name().to_string(),
            connection_id: payload.connection_id(),
            batch_index: payload.batch_index(),
            state: JobState::Queued,
            attempts: 0,
            max_attempts: opts.attempts,
            last_error: None,
            processed: None,
            enqueued_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Failed attempts before the current one
    #[cfg(test)]
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Returned by `enqueue`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: Uuid,
    pub job_type: String,
}

/// What a successful job reports back to the queue
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub processed: u32,
    /// Job to schedule once this one has succeeded
    pub follow_up: Option<(JobPayload, JobOptions)>,
}

impl JobOutcome {
    pub fn processed(processed: u32) -> Self {
        Self {
            processed,
            follow_up: None,
        }
    }
}

/// Snapshot of the queue
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u32,
    pub running: u32,
    pub retrying: u32,
    pub dead_lettered: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOverview {
    pub stats: QueueStats,
    pub dead_letters: Vec<JobRecord>,
}
