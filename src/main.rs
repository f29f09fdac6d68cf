use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use copilot_model_sync::services::orchestrator::log_summary;
use copilot_model_sync::{Config, SyncOrchestrator};

/// Sync GitHub Copilot models into a LiteLLM proxy config.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the config file (overrides SYNC_CONFIG_PATH)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Show what would change without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Write the JSON run result here (overrides SYNC_RESULT_PATH)
    #[arg(long)]
    result_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Load .env file (ignore if missing)
    dotenvy::dotenv().ok();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = Config::from_env()?;
    if let Some(path) = cli.config {
        config = config.with_config_path(path);
    }
    if let Some(path) = cli.result_file {
        config.result_path = Some(path);
    }
    tracing::info!("Syncing GitHub Copilot models into {}", config.config_path.display());

    let result = SyncOrchestrator::from_config(config)
        .dry_run(cli.dry_run)
        .run()
        .await;
    log_summary(&result);

    Ok(ExitCode::from(result.status.exit_code()))
}
