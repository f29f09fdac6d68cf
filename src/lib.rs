//! Keeps the `github_copilot/*` entries of a LiteLLM proxy config in step with
//! the models GitHub Copilot currently offers, without touching anything else
//! in the file.

pub mod config;
pub mod error;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::{FetchError, SyncError, TransactionError};
pub use models::sync_result::{SyncResult, SyncStatus};
pub use services::orchestrator::SyncOrchestrator;
