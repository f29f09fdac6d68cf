use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MODELS_URL: &str = "https://api.githubcopilot.com/models";
const DEFAULT_LOCK_FILE_NAME: &str = "copilot-model-sync.lock";

#[derive(Debug, Clone)]
pub struct Config {
    /// Live routing configuration document.
    pub config_path: PathBuf,
    /// Directory holding timestamped backups and the pending-sync journal.
    pub backup_dir: PathBuf,
    /// Number of backups kept after a successful commit.
    pub backup_retention: usize,
    /// Fixed, well-known path of the single-flight lock.
    pub lock_path: PathBuf,
    /// A lock older than this is treated as abandoned.
    pub lock_stale_after: Duration,
    pub models_url: String,
    pub http_timeout: Duration,
    /// Fixed delay before the single retry of a transient fetch failure.
    pub retry_backoff: Duration,
    /// Directory the external authenticator writes its tokens to.
    pub token_dir: Option<PathBuf>,
    pub api_key_file: String,
    /// Fixed API key that bypasses the token directory.
    pub static_api_key: Option<String>,
    /// Pid file of the running proxy; when set it is sent SIGHUP after a commit.
    pub reload_pid_file: Option<PathBuf>,
    /// Where to write the JSON result artifact.
    pub result_path: Option<PathBuf>,
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn path_env(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Backups live next to the document unless configured otherwise.
pub fn default_backup_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("backups")
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let config_path = path_env("SYNC_CONFIG_PATH").unwrap_or_else(|| "config.yaml".into());
        let backup_dir =
            path_env("SYNC_BACKUP_DIR").unwrap_or_else(|| default_backup_dir(&config_path));

        let models_url = env::var("COPILOT_MODELS_URL").unwrap_or_else(|_| DEFAULT_MODELS_URL.into());
        if !models_url.starts_with("http://") && !models_url.starts_with("https://") {
            return Err(anyhow::anyhow!(
                "COPILOT_MODELS_URL must be an http(s) URL, got {models_url}"
            ));
        }

        let token_dir = path_env("GITHUB_COPILOT_TOKEN_DIR").or_else(|| {
            path_env("HOME").map(|home| home.join(".config/litellm/github_copilot"))
        });

        Ok(Self {
            config_path,
            backup_dir,
            backup_retention: parse_env("SYNC_BACKUP_RETENTION", 10),
            lock_path: path_env("SYNC_LOCK_PATH")
                .unwrap_or_else(|| env::temp_dir().join(DEFAULT_LOCK_FILE_NAME)),
            lock_stale_after: Duration::from_secs(parse_env("SYNC_LOCK_STALE_SECS", 1800)),
            models_url,
            http_timeout: Duration::from_secs(parse_env("SYNC_HTTP_TIMEOUT_SECS", 30)),
            retry_backoff: Duration::from_millis(parse_env("SYNC_RETRY_BACKOFF_MS", 500)),
            token_dir,
            api_key_file: env::var("GITHUB_COPILOT_API_KEY_FILE")
                .unwrap_or_else(|_| "api-key.json".into()),
            static_api_key: env::var("COPILOT_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            reload_pid_file: path_env("LITELLM_PID_FILE"),
            result_path: path_env("SYNC_RESULT_PATH"),
        })
    }

    /// Point the run at a different document. The backup directory follows the
    /// document unless it was set explicitly.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        if path_env("SYNC_BACKUP_DIR").is_none() {
            self.backup_dir = default_backup_dir(&path);
        }
        self.config_path = path;
        self
    }

    /// Config rooted in a single directory, with no token dir, reload target or
    /// result artifact. Used by tests and embedding callers.
    pub fn for_directory(dir: &Path, models_url: &str) -> Self {
        let config_path = dir.join("config.yaml");
        Self {
            backup_dir: default_backup_dir(&config_path),
            config_path,
            backup_retention: 10,
            lock_path: dir.join(DEFAULT_LOCK_FILE_NAME),
            lock_stale_after: Duration::from_secs(1800),
            models_url: models_url.to_string(),
            http_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(50),
            token_dir: None,
            api_key_file: "api-key.json".into(),
            static_api_key: None,
            reload_pid_file: None,
            result_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_dir_sits_next_to_document() {
        assert_eq!(
            default_backup_dir(Path::new("/etc/litellm/config.yaml")),
            PathBuf::from("/etc/litellm/backups")
        );
        assert_eq!(
            default_backup_dir(Path::new("config.yaml")),
            PathBuf::from("./backups")
        );
    }

    #[test]
    fn directory_config_keeps_everything_local() {
        let dir = Path::new("/tmp/sync-test");
        let config = Config::for_directory(dir, "http://127.0.0.1:1/models");
        assert_eq!(config.config_path, dir.join("config.yaml"));
        assert_eq!(config.backup_dir, dir.join("backups"));
        assert!(config.lock_path.starts_with(dir));
        assert!(config.reload_pid_file.is_none());
    }
}
