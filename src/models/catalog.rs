use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

/// Treat a value of the wrong type as absent instead of failing the record.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Envelope returned by `GET /models`.
#[derive(Debug, Deserialize)]
pub struct CatalogResponse {
    pub data: Vec<serde_json::Value>,
}

/// One model as reported upstream. Every field is optional; missing or
/// mistyped values only affect inclusion and derivation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawModelRecord {
    #[serde(default, deserialize_with = "lenient")]
    pub id: String,
    #[serde(
        default,
        rename = "model_picker_enabled",
        alias = "enabled_for_picker",
        deserialize_with = "lenient"
    )]
    pub enabled_for_picker: bool,
    #[serde(default, deserialize_with = "lenient")]
    pub capabilities: RawCapabilities,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCapabilities {
    /// "chat", "embeddings", ...
    #[serde(default, rename = "type", deserialize_with = "lenient")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub supports: BTreeMap<String, serde_json::Value>,
    #[serde(default, deserialize_with = "lenient")]
    pub limits: RawLimits,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLimits {
    #[serde(
        default,
        rename = "max_context_window_tokens",
        alias = "max_tokens",
        deserialize_with = "lenient"
    )]
    pub max_tokens: Option<u64>,
    #[serde(
        default,
        rename = "max_prompt_tokens",
        alias = "max_input_tokens",
        deserialize_with = "lenient"
    )]
    pub max_input_tokens: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub max_output_tokens: Option<u64>,
}

impl RawModelRecord {
    /// Whether upstream reports `supports.<name> == true`. Anything else is false.
    pub fn supports(&self, name: &str) -> bool {
        self.capabilities
            .supports
            .get(name)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}
