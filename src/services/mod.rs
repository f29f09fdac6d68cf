pub mod catalog_fetcher;
pub mod classifier;
pub mod lock;
pub mod merger;
pub mod orchestrator;
pub mod reload;
pub mod token_provider;
pub mod transaction;
