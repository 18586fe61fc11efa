//! Business logic services

pub mod batch_queue;
pub mod collaborators;
pub mod consolidator;
pub mod finalizer;
pub mod import_pipeline;
pub mod import_service;
pub mod job_records;
pub mod nats_collaborators;
pub mod normalizer;
pub mod progress;
pub mod replay;
pub mod ticket_update;
