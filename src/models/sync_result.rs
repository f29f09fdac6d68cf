use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    /// Committed, but a post-commit step (pruning, reload signal) failed.
    Partial,
    /// Another run held the lock.
    Skipped,
    Failed,
}

impl SyncStatus {
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncStatus::Failed => 1,
            _ => 0,
        }
    }
}

/// Names of synced entries touched by a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangedEntries {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl ChangedEntries {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub kind: &'static str,
    pub message: String,
}

impl From<&SyncError> for SyncFailure {
    fn from(e: &SyncError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Outcome of one orchestration run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: SyncStatus,
    pub models_discovered: usize,
    pub models_eligible: usize,
    pub changed_entries: ChangedEntries,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SyncFailure>,
}

impl SyncResult {
    pub fn new(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            status: SyncStatus::Success,
            models_discovered: 0,
            models_eligible: 0,
            changed_entries: ChangedEntries::default(),
            backup_path: None,
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn finish(mut self, status: SyncStatus) -> Self {
        self.status = status;
        self.finished_at = Utc::now();
        self
    }

    pub fn fail(mut self, error: &SyncError) -> Self {
        self.error = Some(SyncFailure::from(error));
        self.finish(SyncStatus::Failed)
    }
}
