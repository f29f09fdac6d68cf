use std::path::Path;

use tracing::Instrument;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{SyncError, TransactionError};
use crate::models::classified::ClassifiedModel;
use crate::models::document::{ConfigDocument, ModelEntry};
use crate::models::sync_result::{ChangedEntries, SyncResult, SyncStatus};
use crate::services::catalog_fetcher::CatalogFetcher;
use crate::services::classifier::{classify_all, ClassifiedBatch};
use crate::services::merger::{ensure_default_settings, merge};
use crate::services::reload::request_reload;
use crate::services::token_provider::{self, TokenProvider};
use crate::services::transaction::ReconciliationTransaction;

/// Runs fetch → classify → merge → transact and reports the outcome.
pub struct SyncOrchestrator {
    config: Config,
    fetcher: CatalogFetcher,
    tokens: Box<dyn TokenProvider>,
    transaction: ReconciliationTransaction,
    dry_run: bool,
}

impl SyncOrchestrator {
    pub fn new(config: Config, tokens: Box<dyn TokenProvider>) -> Self {
        let fetcher = CatalogFetcher::new(
            &config.models_url,
            config.http_timeout,
            config.retry_backoff,
        );
        let transaction = ReconciliationTransaction::new(&config);
        Self {
            config,
            fetcher,
            tokens,
            transaction,
            dry_run: false,
        }
    }

    pub fn from_config(config: Config) -> Self {
        let tokens = token_provider::from_config(&config);
        Self::new(config, tokens)
    }

    /// Compute and log the changes without taking the lock or writing.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run(&self) -> SyncResult {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("sync", %run_id);

        async {
            let mut result = SyncResult::new(run_id);
            let outcome = self.execute(&mut result).await;
            let result = match outcome {
                Ok(status) => result.finish(status),
                Err(e) => {
                    tracing::error!("Sync failed: {}", e);
                    result.fail(&e)
                }
            };
            self.write_artifact(&result);
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, result: &mut SyncResult) -> Result<SyncStatus, SyncError> {
        if self.dry_run {
            let batch = self.discover(result).await?;
            let current = match std::fs::read_to_string(&self.config.config_path) {
                Ok(text) => Some(text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(TransactionError::io(&self.config.config_path, e).into()),
            };
            let current = parse_current(&self.config.config_path, current)?;
            let (_, diff) = self.build_candidate(&current, &batch.models)?;
            log_diff(&diff);
            log_models(&batch.models);
            tracing::info!("Dry run, {} left untouched", self.config.config_path.display());
            result.changed_entries = diff;
            return Ok(SyncStatus::Success);
        }

        // The lock covers the whole run, fetch included, so an overlapping
        // run skips instead of fetching again.
        let Some(tx) = self.transaction.begin()? else {
            return Ok(SyncStatus::Skipped);
        };
        if let Some(recovery) = tx.recovered() {
            result
                .warnings
                .push(format!("recovered interrupted sync: {recovery:?}"));
        }

        let batch = self.discover(result).await?;

        let current = parse_current(&self.config.config_path, tx.read_current()?)?;
        let (candidate, diff) = self.build_candidate(&current, &batch.models)?;
        result.changed_entries = diff.clone();

        if candidate == current {
            tracing::info!("{} is already up to date", self.config.config_path.display());
            return Ok(SyncStatus::Success);
        }

        let report = tx.commit(&candidate)?;
        result.backup_path = report.backup_path;
        log_diff(&diff);
        log_models(&batch.models);

        let mut status = SyncStatus::Success;
        if let Some(e) = report.prune_error {
            result.warnings.push(format!("backup pruning failed: {e}"));
            status = SyncStatus::Partial;
        }
        if let Some(pid_file) = &self.config.reload_pid_file {
            if let Err(e) = request_reload(pid_file) {
                tracing::warn!("Config written but proxy reload failed: {}", e);
                result.warnings.push(format!("reload signal failed: {e}"));
                status = SyncStatus::Partial;
            }
        }

        tracing::info!(
            "Updated {} with {} GitHub Copilot models",
            self.config.config_path.display(),
            batch.models.len()
        );
        Ok(status)
    }

    /// Fetch and classify the catalog. An empty result is an error.
    async fn discover(&self, result: &mut SyncResult) -> Result<ClassifiedBatch, SyncError> {
        tracing::info!("Fetching models from {}", self.config.models_url);
        let records = self.fetcher.fetch_catalog(self.tokens.as_ref()).await?;

        let batch = classify_all(&records);
        result.models_discovered = batch.discovered;
        result.models_eligible = batch.models.len();
        tracing::info!(
            "{} of {} upstream models are eligible",
            batch.models.len(),
            batch.discovered
        );
        if batch.models.is_empty() {
            return Err(SyncError::EmptyClassificationResult {
                discovered: batch.discovered,
            });
        }
        Ok(batch)
    }

    fn build_candidate(
        &self,
        current: &ConfigDocument,
        models: &[ClassifiedModel],
    ) -> Result<(ConfigDocument, ChangedEntries), SyncError> {
        let (mut candidate, diff) = merge(current, models).map_err(TransactionError::from)?;
        ensure_default_settings(&mut candidate, self.config.token_dir.as_deref());
        Ok((candidate, diff))
    }

    fn write_artifact(&self, result: &SyncResult) {
        let Some(path) = &self.config.result_path else {
            return;
        };
        let written = serde_json::to_vec_pretty(result)
            .map_err(std::io::Error::other)
            .and_then(|bytes| std::fs::write(path, bytes));
        if let Err(e) = written {
            tracing::warn!("Failed to write sync result to {}: {}", path.display(), e);
        }
    }
}

fn parse_current(path: &Path, text: Option<String>) -> Result<ConfigDocument, SyncError> {
    match text {
        None => {
            tracing::warn!("Config file {} not found, creating a new one", path.display());
            Ok(ConfigDocument::default())
        }
        Some(text) => ConfigDocument::parse(&text).map_err(|e| SyncError::DocumentUnreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        }),
    }
}

fn log_diff(diff: &ChangedEntries) {
    if diff.is_empty() {
        tracing::info!("No model entries changed");
        return;
    }
    for name in &diff.added {
        tracing::info!("Added model: {}", name);
    }
    for name in &diff.updated {
        tracing::info!("Updated model: {}", name);
    }
    for name in &diff.removed {
        tracing::info!("Removed model: {}", name);
    }
}

fn log_models(models: &[ClassifiedModel]) {
    for model in models {
        let entry = ModelEntry::from(model);
        let max_tokens = entry
            .litellm_params
            .model_info
            .max_tokens
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        tracing::info!(
            "  {}: {} (max_tokens: {})",
            entry.model_name,
            entry.capability_summary(),
            max_tokens
        );
    }
}

/// Summarise a finished run in one log line.
pub fn log_summary(result: &SyncResult) {
    let changes = &result.changed_entries;
    match result.status {
        SyncStatus::Success | SyncStatus::Partial => tracing::info!(
            "Sync {:?}: {} discovered, {} eligible, +{} ~{} -{}",
            result.status,
            result.models_discovered,
            result.models_eligible,
            changes.added.len(),
            changes.updated.len(),
            changes.removed.len()
        ),
        SyncStatus::Skipped => tracing::info!("Sync skipped: another run holds the lock"),
        SyncStatus::Failed => tracing::error!(
            "Sync failed: {}",
            result
                .error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error")
        ),
    }
    for warning in &result.warnings {
        tracing::warn!("{}", warning);
    }
}
