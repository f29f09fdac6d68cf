use std::path::PathBuf;

use chrono::Utc;
use serde::Deserialize;

use crate::config::Config;
use crate::error::FetchError;

/// Source of the bearer token for the catalog API. Refreshing tokens is the
/// provider's business; callers only see `AuthenticationFailed`.
pub trait TokenProvider: Send + Sync {
    fn api_key(&self) -> Result<String, FetchError>;
}

/// A fixed key, e.g. from `COPILOT_API_KEY`.
pub struct StaticTokenProvider(String);

impl StaticTokenProvider {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl TokenProvider for StaticTokenProvider {
    fn api_key(&self) -> Result<String, FetchError> {
        if self.0.trim().is_empty() {
            return Err(FetchError::AuthenticationFailed("API key is empty".into()));
        }
        Ok(self.0.clone())
    }
}

/// `api-key.json` as written by the external authenticator.
#[derive(Debug, Deserialize)]
struct ApiKeyFile {
    token: Option<String>,
    #[serde(default)]
    expires_at: Option<f64>,
}

/// Reads the API key the external authenticator keeps in its token directory.
pub struct FileTokenProvider {
    token_dir: Option<PathBuf>,
    api_key_file: String,
}

impl FileTokenProvider {
    pub fn new(token_dir: Option<PathBuf>, api_key_file: impl Into<String>) -> Self {
        Self {
            token_dir,
            api_key_file: api_key_file.into(),
        }
    }
}

impl TokenProvider for FileTokenProvider {
    fn api_key(&self) -> Result<String, FetchError> {
        let dir = self.token_dir.as_ref().ok_or_else(|| {
            FetchError::AuthenticationFailed("no token directory configured".into())
        })?;
        let path = dir.join(&self.api_key_file);

        let text = std::fs::read_to_string(&path).map_err(|e| {
            FetchError::AuthenticationFailed(format!("cannot read {}: {e}", path.display()))
        })?;
        let info: ApiKeyFile = serde_json::from_str(&text).map_err(|e| {
            FetchError::AuthenticationFailed(format!("invalid {}: {e}", path.display()))
        })?;

        // A key without an expiry is treated as already expired.
        if info.expires_at.unwrap_or(0.0) <= Utc::now().timestamp() as f64 {
            return Err(FetchError::AuthenticationFailed(format!(
                "API key in {} has expired",
                path.display()
            )));
        }

        match info.token {
            Some(token) if !token.trim().is_empty() => Ok(token),
            _ => Err(FetchError::AuthenticationFailed(format!(
                "{} has no token",
                path.display()
            ))),
        }
    }
}

/// A fixed key when one is configured, otherwise the token directory.
pub fn from_config(config: &Config) -> Box<dyn TokenProvider> {
    match &config.static_api_key {
        Some(key) => Box::new(StaticTokenProvider::new(key.clone())),
        None => Box::new(FileTokenProvider::new(
            config.token_dir.clone(),
            config.api_key_file.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_key(dir: &std::path::Path, value: serde_json::Value) {
        std::fs::write(dir.join("api-key.json"), value.to_string()).unwrap();
    }

    #[test]
    fn reads_unexpired_token() {
        let dir = tempfile::tempdir().unwrap();
        let expires = Utc::now().timestamp() + 600;
        write_key(dir.path(), json!({ "token": "tid=abc", "expires_at": expires }));

        let provider = FileTokenProvider::new(Some(dir.path().to_path_buf()), "api-key.json");
        assert_eq!(provider.api_key().unwrap(), "tid=abc");
    }

    #[test]
    fn expired_token_fails_authentication() {
        let dir = tempfile::tempdir().unwrap();
        write_key(dir.path(), json!({ "token": "tid=abc", "expires_at": 1 }));

        let provider = FileTokenProvider::new(Some(dir.path().to_path_buf()), "api-key.json");
        assert!(matches!(provider.api_key(), Err(FetchError::AuthenticationFailed(_))));
    }

    #[test]
    fn token_without_expiry_is_expired() {
        let dir = tempfile::tempdir().unwrap();
        write_key(dir.path(), json!({ "token": "tid=abc" }));

        let provider = FileTokenProvider::new(Some(dir.path().to_path_buf()), "api-key.json");
        assert!(matches!(provider.api_key(), Err(FetchError::AuthenticationFailed(_))));
    }

    #[test]
    fn missing_dir_or_file_fails_authentication() {
        let provider = FileTokenProvider::new(None, "api-key.json");
        assert!(matches!(provider.api_key(), Err(FetchError::AuthenticationFailed(_))));

        let dir = tempfile::tempdir().unwrap();
        let provider = FileTokenProvider::new(Some(dir.path().to_path_buf()), "api-key.json");
        assert!(matches!(provider.api_key(), Err(FetchError::AuthenticationFailed(_))));
    }

    #[test]
    fn tokenless_file_fails_authentication() {
        let dir = tempfile::tempdir().unwrap();
        write_key(dir.path(), json!({ "expires_at": Utc::now().timestamp() + 600 }));

        let provider = FileTokenProvider::new(Some(dir.path().to_path_buf()), "api-key.json");
        assert!(matches!(provider.api_key(), Err(FetchError::AuthenticationFailed(_))));
    }

    #[test]
    fn static_key_must_be_non_empty() {
        assert!(StaticTokenProvider::new("").api_key().is_err());
        assert_eq!(StaticTokenProvider::new("k").api_key().unwrap(), "k");
    }
}
