//! Backup → write → validate → commit-or-rollback for the live config document,
//! guarded by the single-flight lock.
//!
//! A journal is written to the backup directory between the backup and the
//! write and removed on commit or rollback. Finding one when the lock is taken
//! means a previous run died mid-transaction; it is resolved before anything
//! else happens.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::error::TransactionError;
use crate::models::classified::is_synced_name;
use crate::models::document::{ConfigDocument, ModelEntry};
use crate::services::lock::SyncLock;

const JOURNAL_FILE_NAME: &str = "pending-sync.json";
const BACKUP_SUFFIX: &str = ".bak";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Locked,
    BackedUp,
    Written,
    Validated,
    Committed,
    RollingBack,
    RolledBack,
}

/// What a previous, interrupted run left behind and how it was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// The interrupted write validated and was kept.
    Adopted,
    /// The live document was restored from the journalled backup.
    Restored(PathBuf),
    /// The interrupted run created the document; it was removed.
    Removed,
}

#[derive(Debug)]
pub enum ApplyOutcome {
    /// Another run holds the lock; nothing was touched.
    Skipped,
    Committed(CommitReport),
}

#[derive(Debug, Default)]
pub struct CommitReport {
    pub backup_path: Option<PathBuf>,
    pub pruned: usize,
    /// Set when pruning old backups failed after a successful commit.
    pub prune_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingSync {
    backup_path: Option<PathBuf>,
    written_sha256: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReconciliationTransaction {
    config_path: PathBuf,
    backup_dir: PathBuf,
    retention: usize,
    lock_path: PathBuf,
    lock_stale_after: Duration,
}

impl ReconciliationTransaction {
    pub fn new(config: &Config) -> Self {
        Self {
            config_path: config.config_path.clone(),
            backup_dir: config.backup_dir.clone(),
            retention: config.backup_retention.max(1),
            lock_path: config.lock_path.clone(),
            lock_stale_after: config.lock_stale_after,
        }
    }

    /// Take the lock and resolve any interrupted previous run. `None` when the
    /// lock is held elsewhere.
    pub fn begin(&self) -> Result<Option<LockedTransaction<'_>>, TransactionError> {
        let lock = SyncLock::try_acquire(&self.lock_path, self.lock_stale_after)
            .map_err(|e| TransactionError::io(&self.lock_path, e))?;
        let Some(lock) = lock else {
            tracing::info!(
                "Sync lock {} is held by another run, skipping",
                self.lock_path.display()
            );
            return Ok(None);
        };

        let mut tx = LockedTransaction {
            tx: self,
            _lock: lock,
            state: TransactionState::Idle,
            recovered: None,
        };
        tx.advance(TransactionState::Locked);
        tx.recovered = self.recover()?;
        Ok(Some(tx))
    }

    /// Lock, then commit `candidate`.
    pub fn apply(&self, candidate: &ConfigDocument) -> Result<ApplyOutcome, TransactionError> {
        match self.begin()? {
            None => Ok(ApplyOutcome::Skipped),
            Some(tx) => tx.commit(candidate).map(ApplyOutcome::Committed),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn journal_path(&self) -> PathBuf {
        self.backup_dir.join(JOURNAL_FILE_NAME)
    }

    fn backup_prefix(&self) -> String {
        let name = self
            .config_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config".to_string());
        format!("{name}.")
    }

    fn recover(&self) -> Result<Option<Recovery>, TransactionError> {
        let journal_path = self.journal_path();
        let text = match fs::read_to_string(&journal_path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TransactionError::io(&journal_path, e)),
        };
        let pending: Option<PendingSync> = serde_json::from_str(&text).ok();
        tracing::warn!(
            "Found journal {} from an interrupted sync, recovering",
            journal_path.display()
        );

        let live = fs::read(&self.config_path).ok();
        let live_valid = live
            .as_deref()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .map(|text| validate_text(text).is_ok())
            .unwrap_or(false);

        let recovery = match (&pending, live_valid) {
            (_, true) => {
                let completed = match (&pending, &live) {
                    (Some(p), Some(bytes)) => sha256_hex(bytes) == p.written_sha256,
                    _ => false,
                };
                tracing::info!(
                    "Live document is valid ({}), keeping it",
                    if completed { "interrupted write completed" } else { "write never happened" }
                );
                Recovery::Adopted
            }
            (Some(PendingSync { backup_path: Some(backup), .. }), false) => {
                replace_file(backup, &self.config_path)
                    .map_err(|e| TransactionError::io(&self.config_path, e))?;
                tracing::warn!("Restored {} from {}", self.config_path.display(), backup.display());
                Recovery::Restored(backup.clone())
            }
            (Some(PendingSync { backup_path: None, .. }), false) => {
                remove_if_exists(&self.config_path)
                    .map_err(|e| TransactionError::io(&self.config_path, e))?;
                tracing::warn!(
                    "Removed invalid {} created by the interrupted run",
                    self.config_path.display()
                );
                Recovery::Removed
            }
            (None, false) => {
                tracing::error!(
                    "Journal is unreadable and {} does not validate; leaving it as is",
                    self.config_path.display()
                );
                Recovery::Adopted
            }
        };

        remove_if_exists(&journal_path).map_err(|e| TransactionError::io(&journal_path, e))?;
        Ok(Some(recovery))
    }

    fn prune_backups(&self) -> std::io::Result<usize> {
        let prefix = self.backup_prefix();
        let mut backups: Vec<PathBuf> = fs::read_dir(&self.backup_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(BACKUP_SUFFIX))
            })
            .collect();
        if backups.len() <= self.retention {
            return Ok(0);
        }

        // Timestamped names sort chronologically.
        backups.sort();
        let excess = backups.len() - self.retention;
        for path in &backups[..excess] {
            fs::remove_file(path)?;
            tracing::debug!("Pruned backup {}", path.display());
        }
        Ok(excess)
    }
}

/// A transaction holding the lock. Dropping it releases the lock.
pub struct LockedTransaction<'a> {
    tx: &'a ReconciliationTransaction,
    _lock: SyncLock,
    state: TransactionState,
    recovered: Option<Recovery>,
}

impl LockedTransaction<'_> {
    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn recovered(&self) -> Option<&Recovery> {
        self.recovered.as_ref()
    }

    /// Raw text of the live document, `None` when it does not exist yet.
    pub fn read_current(&self) -> Result<Option<String>, TransactionError> {
        match fs::read_to_string(&self.tx.config_path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransactionError::io(&self.tx.config_path, e)),
        }
    }

    fn advance(&mut self, next: TransactionState) {
        tracing::debug!("Sync transaction {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Back up, write, validate and commit `candidate`. On any failure after
    /// the backup the previous document is put back before returning.
    pub fn commit(mut self, candidate: &ConfigDocument) -> Result<CommitReport, TransactionError> {
        let text = candidate.to_yaml()?;
        let live = self.tx.config_path.clone();
        let journal_path = self.tx.journal_path();

        fs::create_dir_all(&self.tx.backup_dir)
            .map_err(|e| TransactionError::io(&self.tx.backup_dir, e))?;

        let backup_path = if live.exists() {
            let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
            let path = self
                .tx
                .backup_dir
                .join(format!("{}{stamp}{BACKUP_SUFFIX}", self.tx.backup_prefix()));
            fs::copy(&live, &path).map_err(|e| TransactionError::io(&path, e))?;
            tracing::info!("Backed up {} to {}", live.display(), path.display());
            Some(path)
        } else {
            None
        };
        self.advance(TransactionState::BackedUp);

        let pending = PendingSync {
            backup_path: backup_path.clone(),
            written_sha256: sha256_hex(text.as_bytes()),
            started_at: Utc::now(),
        };
        let journal = serde_json::to_vec_pretty(&pending)
            .map_err(|e| TransactionError::io(&journal_path, std::io::Error::other(e)))?;
        fs::write(&journal_path, journal).map_err(|e| TransactionError::io(&journal_path, e))?;

        if let Err(e) = write_atomically(&live, text.as_bytes()) {
            let err = TransactionError::io(&live, e);
            return Err(self.rollback(backup_path.as_deref(), err));
        }
        self.advance(TransactionState::Written);

        let check = fs::read_to_string(&live)
            .map_err(|e| e.to_string())
            .and_then(|written| {
                if sha256_hex(written.as_bytes()) != pending.written_sha256 {
                    return Err("written document does not match the candidate".to_string());
                }
                validate_text(&written)
            });
        if let Err(message) = check {
            tracing::error!("Validation of {} failed: {}", live.display(), message);
            let err = TransactionError::ValidationFailed(message);
            return Err(self.rollback(backup_path.as_deref(), err));
        }
        self.advance(TransactionState::Validated);

        if let Err(e) = remove_if_exists(&journal_path) {
            tracing::warn!("Failed to remove journal {}: {}", journal_path.display(), e);
        }
        self.advance(TransactionState::Committed);

        let mut report = CommitReport {
            backup_path,
            ..CommitReport::default()
        };
        match self.tx.prune_backups() {
            Ok(n) => report.pruned = n,
            Err(e) => {
                tracing::warn!("Failed to prune backups in {}: {}", self.tx.backup_dir.display(), e);
                report.prune_error = Some(e.to_string());
            }
        }
        Ok(report)
    }

    /// Put the pre-transaction document back and return the error to surface.
    fn rollback(&mut self, backup: Option<&Path>, cause: TransactionError) -> TransactionError {
        self.advance(TransactionState::RollingBack);
        let live = &self.tx.config_path;
        let restored = match backup {
            Some(backup) => replace_file(backup, live),
            None => remove_if_exists(live),
        };
        if let Err(source) = restored {
            tracing::error!("Rollback of {} failed: {}", live.display(), source);
            // The journal stays so the next run can retry the recovery.
            return TransactionError::RollbackFailed {
                cause: cause.to_string(),
                source,
            };
        }

        let journal_path = self.tx.journal_path();
        if let Err(e) = remove_if_exists(&journal_path) {
            tracing::warn!("Failed to remove journal {}: {}", journal_path.display(), e);
        }
        self.advance(TransactionState::RolledBack);
        tracing::warn!("Rolled back {}", live.display());
        cause
    }
}

/// Check a document the way the proxy will need it: parseable, a non-empty
/// `model_list`, and every synced entry carrying the required fields.
pub fn validate_document(doc: &ConfigDocument) -> Result<(), String> {
    if doc.entries().is_empty() {
        return Err("model_list is empty".to_string());
    }
    for entry in doc.entries() {
        let Some(name) = ConfigDocument::entry_name(entry) else {
            continue;
        };
        if !is_synced_name(name) {
            continue;
        }
        let parsed: ModelEntry = serde_yaml::from_value(entry.clone())
            .map_err(|e| format!("entry {name} is malformed: {e}"))?;
        if parsed.litellm_params.model.trim().is_empty() {
            return Err(format!("entry {name} has an empty litellm_params.model"));
        }
    }
    Ok(())
}

fn validate_text(text: &str) -> Result<(), String> {
    let doc = ConfigDocument::parse(text).map_err(|e| e.to_string())?;
    validate_document(&doc)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write via a synced temp file in the same directory and rename it over the
/// target, so readers never see a partial file. A symlinked target keeps its
/// link and the file it points at is replaced.
fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let target = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp_file = tempfile::Builder::new()
        .prefix(".copilot-sync")
        .tempfile_in(parent)?;
    temp_file.write_all(bytes)?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(&target).map_err(|error| error.error)?;
    Ok(())
}

fn replace_file(from: &Path, to: &Path) -> std::io::Result<()> {
    let bytes = fs::read(from)?;
    write_atomically(to, &bytes)
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::classified::{copilot_headers, ClassifiedModel, TokenLimits};
    use crate::services::merger::merge;

    const ORIGINAL: &str = "model_list:\n- model_name: my-custom-model\n  litellm_params:\n    model: openai/gpt-4o\n";

    fn setup() -> (tempfile::TempDir, ReconciliationTransaction) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_directory(dir.path(), "http://127.0.0.1:9/models");
        config.backup_retention = 2;
        let tx = ReconciliationTransaction::new(&config);
        (dir, tx)
    }

    fn candidate(current: &str) -> ConfigDocument {
        let model = ClassifiedModel {
            qualified_name: "github_copilot/gpt-4o".into(),
            capabilities: Default::default(),
            token_limits: TokenLimits::derive(Some(64_000), None, None),
            cacheable: true,
            headers: copilot_headers(),
        };
        merge(&ConfigDocument::parse(current).unwrap(), &[model]).unwrap().0
    }

    fn backups(dir: &Path) -> Vec<PathBuf> {
        let mut v: Vec<_> = fs::read_dir(dir.join("backups"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().ends_with(BACKUP_SUFFIX))
            .collect();
        v.sort();
        v
    }

    #[test]
    fn commit_backs_up_and_writes() {
        let (dir, tx) = setup();
        fs::write(tx.config_path(), ORIGINAL).unwrap();

        let doc = candidate(ORIGINAL);
        let outcome = tx.apply(&doc).unwrap();
        let ApplyOutcome::Committed(report) = outcome else {
            panic!("expected commit");
        };

        let backup = report.backup_path.unwrap();
        assert_eq!(fs::read_to_string(&backup).unwrap(), ORIGINAL);
        let live = ConfigDocument::parse(&fs::read_to_string(tx.config_path()).unwrap()).unwrap();
        assert_eq!(live, doc);
        assert!(!dir.path().join("backups").join(JOURNAL_FILE_NAME).exists());
        assert!(!dir.path().join("copilot-model-sync.lock").exists());
    }

    #[test]
    fn first_commit_has_no_backup() {
        let (_dir, tx) = setup();
        let ApplyOutcome::Committed(report) = tx.apply(&candidate("")).unwrap() else {
            panic!("expected commit");
        };
        assert!(report.backup_path.is_none());
        assert!(tx.config_path().exists());
    }

    #[test]
    fn validation_failure_restores_backup() {
        let (dir, tx) = setup();
        fs::write(tx.config_path(), ORIGINAL).unwrap();

        let mut empty = ConfigDocument::parse(ORIGINAL).unwrap();
        empty.set_entries(Vec::new());
        let err = tx.apply(&empty).unwrap_err();

        assert!(matches!(err, TransactionError::ValidationFailed(_)));
        assert_eq!(fs::read_to_string(tx.config_path()).unwrap(), ORIGINAL);
        assert!(!dir.path().join("backups").join(JOURNAL_FILE_NAME).exists());
        assert!(!dir.path().join("copilot-model-sync.lock").exists());
    }

    #[test]
    fn validation_failure_without_prior_document_removes_it() {
        let (_dir, tx) = setup();
        let err = tx.apply(&ConfigDocument::default()).unwrap_err();
        assert!(matches!(err, TransactionError::ValidationFailed(_)));
        assert!(!tx.config_path().exists());
    }

    #[test]
    fn held_lock_skips_without_touching_document() {
        let (_dir, tx) = setup();
        fs::write(tx.config_path(), ORIGINAL).unwrap();

        let held = tx.begin().unwrap().unwrap();
        assert_eq!(held.state(), TransactionState::Locked);
        assert!(matches!(tx.apply(&candidate(ORIGINAL)).unwrap(), ApplyOutcome::Skipped));
        assert_eq!(fs::read_to_string(tx.config_path()).unwrap(), ORIGINAL);
        drop(held);

        assert!(matches!(tx.apply(&candidate(ORIGINAL)).unwrap(), ApplyOutcome::Committed(_)));
    }

    #[test]
    fn prunes_to_retention() {
        let (dir, tx) = setup();
        fs::write(tx.config_path(), ORIGINAL).unwrap();
        fs::create_dir_all(dir.path().join("backups")).unwrap();
        for stamp in ["20200101T000000.000Z", "20200102T000000.000Z", "20200103T000000.000Z"] {
            fs::write(dir.path().join(format!("backups/config.yaml.{stamp}.bak")), "old").unwrap();
        }
        fs::write(dir.path().join("backups/unrelated.txt"), "keep").unwrap();

        let ApplyOutcome::Committed(report) = tx.apply(&candidate(ORIGINAL)).unwrap() else {
            panic!("expected commit");
        };

        assert_eq!(report.pruned, 2);
        let left = backups(dir.path());
        assert_eq!(left.len(), 2);
        assert!(left[0].to_string_lossy().contains("20200103"));
        assert_eq!(left[1], report.backup_path.unwrap());
        assert!(dir.path().join("backups/unrelated.txt").exists());
    }

    #[test]
    fn interrupted_run_with_corrupt_document_is_restored() {
        let (dir, tx) = setup();
        let backup = dir.path().join("backups/config.yaml.20200101T000000.000Z.bak");
        fs::create_dir_all(backup.parent().unwrap()).unwrap();
        fs::write(&backup, ORIGINAL).unwrap();
        fs::write(tx.config_path(), "model_list: [half-writ").unwrap();
        let pending = PendingSync {
            backup_path: Some(backup.clone()),
            written_sha256: "deadbeef".into(),
            started_at: Utc::now(),
        };
        fs::write(tx.journal_path(), serde_json::to_string(&pending).unwrap()).unwrap();

        let locked = tx.begin().unwrap().unwrap();
        assert_eq!(locked.recovered(), Some(&Recovery::Restored(backup)));
        assert_eq!(locked.read_current().unwrap().as_deref(), Some(ORIGINAL));
        assert!(!tx.journal_path().exists());
    }

    #[test]
    fn interrupted_run_with_valid_document_is_adopted() {
        let (_dir, tx) = setup();
        let written = candidate(ORIGINAL).to_yaml().unwrap();
        fs::write(tx.config_path(), &written).unwrap();
        fs::create_dir_all(tx.journal_path().parent().unwrap()).unwrap();
        let pending = PendingSync {
            backup_path: None,
            written_sha256: sha256_hex(written.as_bytes()),
            started_at: Utc::now(),
        };
        fs::write(tx.journal_path(), serde_json::to_string(&pending).unwrap()).unwrap();

        let locked = tx.begin().unwrap().unwrap();
        assert_eq!(locked.recovered(), Some(&Recovery::Adopted));
        assert_eq!(locked.read_current().unwrap(), Some(written));
    }

    #[test]
    fn interrupted_run_that_never_wrote_keeps_valid_document() {
        let (dir, tx) = setup();
        let backup = dir.path().join("backups/config.yaml.20200101T000000.000Z.bak");
        fs::create_dir_all(backup.parent().unwrap()).unwrap();
        fs::write(&backup, "model_list: []\n").unwrap();
        fs::write(tx.config_path(), ORIGINAL).unwrap();
        let pending = PendingSync {
            backup_path: Some(backup),
            written_sha256: sha256_hex(b"something else entirely"),
            started_at: Utc::now(),
        };
        fs::write(tx.journal_path(), serde_json::to_string(&pending).unwrap()).unwrap();

        let locked = tx.begin().unwrap().unwrap();
        assert_eq!(locked.recovered(), Some(&Recovery::Adopted));
        assert_eq!(locked.read_current().unwrap().as_deref(), Some(ORIGINAL));
        assert!(!tx.journal_path().exists());
    }

    #[test]
    fn commit_leaves_no_temp_files() {
        let (dir, tx) = setup();
        fs::write(tx.config_path(), ORIGINAL).unwrap();
        tx.apply(&candidate(ORIGINAL)).unwrap();

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["backups", "config.yaml"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_document_keeps_its_link() {
        let (dir, tx) = setup();
        let real = dir.path().join("mounted.yaml");
        fs::write(&real, ORIGINAL).unwrap();
        std::os::unix::fs::symlink(&real, tx.config_path()).unwrap();

        let doc = candidate(ORIGINAL);
        tx.apply(&doc).unwrap();

        assert!(fs::symlink_metadata(tx.config_path()).unwrap().file_type().is_symlink());
        let written = ConfigDocument::parse(&fs::read_to_string(&real).unwrap()).unwrap();
        assert_eq!(written, doc);
    }

    #[test]
    fn validator_requires_synced_fields() {
        let doc = ConfigDocument::parse(
            "model_list:\n- model_name: github_copilot/o1\n  litellm_params:\n    model: github_copilot/o1\n",
        )
        .unwrap();
        assert!(validate_document(&doc).unwrap_err().contains("github_copilot/o1"));

        let doc = ConfigDocument::parse("model_list:\n- model_name: custom\n").unwrap();
        assert!(validate_document(&doc).is_ok());
    }
}
