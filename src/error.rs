//! Domain errors returned by the import facade

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Connection not found: {0}")]
    ConnectionNotFound(Uuid),

    #[error("Import already running on connection {0}")]
    AlreadyRunning(Uuid),

    #[error("Import in progress on connection {0}, try again when it finishes")]
    ImportInProgress(Uuid),

    #[error("Connections {0} and {1} belong to different companies")]
    CompanyMismatch(Uuid, Uuid),

    #[error("Invalid job payload: {0}")]
    InvalidJob(String),

    #[error("Import queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Gateway unavailable for connection {0}")]
    GatewayUnavailable(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl ImportError {
    /// Stable code sent to callers in error replies
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            ImportError::AlreadyRunning(_) => "IMPORT_ALREADY_RUNNING",
            ImportError::ImportInProgress(_) => "IMPORT_IN_PROGRESS",
            ImportError::CompanyMismatch(_, _) => "COMPANY_MISMATCH",
            ImportError::InvalidJob(_) => "INVALID_JOB",
            ImportError::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
            ImportError::GatewayUnavailable(_) => "GATEWAY_UNAVAILABLE",
            ImportError::Store(_) => "STORE_ERROR",
        }
    }
}

pub type ImportResult<T> = Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_wraps_anyhow() {
        let err: ImportError = anyhow::anyhow!("connection reset").into();
        assert_eq!(err.code(), "STORE_ERROR");
        assert!(err.to_string().contains("connection reset"));
    }
}
