use std::path::PathBuf;

/// Failures talking to the upstream model catalog.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Upstream protocol error: {0}")]
    UpstreamProtocolError(String),
}

impl FetchError {
    /// Only network-layer failures are worth a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::UpstreamUnavailable(_))
    }
}

/// Failures while applying a candidate document to disk.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("Validation failed, previous document restored: {0}")]
    ValidationFailed(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize document: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("Rollback failed after {cause}: {source}")]
    RollbackFailed {
        cause: String,
        #[source]
        source: std::io::Error,
    },
}

impl TransactionError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransactionError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Everything that can end a sync run. The orchestrator is the only place these
/// are turned into an exit status.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Upstream returned no eligible chat models ({discovered} discovered)")]
    EmptyClassificationResult { discovered: usize },

    #[error("Config document {path} is unreadable: {message}")]
    DocumentUnreadable { path: PathBuf, message: String },

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl SyncError {
    /// Stable identifier written to the result artifact.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Fetch(FetchError::UpstreamUnavailable(_)) => "upstream_unavailable",
            SyncError::Fetch(FetchError::AuthenticationFailed(_)) => "authentication_failed",
            SyncError::Fetch(FetchError::UpstreamProtocolError(_)) => "upstream_protocol_error",
            SyncError::EmptyClassificationResult { .. } => "empty_classification_result",
            SyncError::DocumentUnreadable { .. } => "document_unreadable",
            SyncError::Transaction(TransactionError::ValidationFailed(_)) => "validation_failed",
            SyncError::Transaction(TransactionError::RollbackFailed { .. }) => "rollback_failed",
            SyncError::Transaction(_) => "transaction_failed",
        }
    }
}
