use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use super::classified::{Capability, ClassifiedModel, CACHE_MODELS_FOR_SECS, SYNCED_NAMESPACE};

const MODEL_LIST_KEY: &str = "model_list";

/// The routing configuration as read from disk. Top-level keys and foreign
/// `model_list` entries are kept as raw YAML values so they round-trip untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDocument {
    root: Mapping,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("top level must be a mapping")]
    NotAMapping,

    #[error("`model_list` must be a sequence")]
    ModelListNotASequence,
}

impl ConfigDocument {
    /// Parse YAML text. An empty file is an empty document.
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        let value: Value = serde_yaml::from_str(text)?;
        let root = match value {
            Value::Null => Mapping::new(),
            Value::Mapping(m) => m,
            _ => return Err(DocumentError::NotAMapping),
        };
        match root.get(MODEL_LIST_KEY) {
            None | Some(Value::Null) | Some(Value::Sequence(_)) => Ok(Self { root }),
            Some(_) => Err(DocumentError::ModelListNotASequence),
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.root)
    }

    pub fn entries(&self) -> &[Value] {
        match self.root.get(MODEL_LIST_KEY) {
            Some(Value::Sequence(seq)) => seq,
            _ => &[],
        }
    }

    pub fn set_entries(&mut self, entries: Vec<Value>) {
        self.root
            .insert(Value::from(MODEL_LIST_KEY), Value::Sequence(entries));
    }

    /// `model_name` of an entry, if it has a string one.
    pub fn entry_name(entry: &Value) -> Option<&str> {
        entry.get("model_name").and_then(Value::as_str)
    }

    /// Insert `section.key = value` unless `key` is already present. Returns
    /// whether anything changed. A non-mapping `section` is left alone.
    pub fn ensure_setting(&mut self, section: &str, key: &str, value: Value) -> bool {
        let section_value = self
            .root
            .entry(Value::from(section))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if section_value.is_null() {
            *section_value = Value::Mapping(Mapping::new());
        }
        match section_value {
            Value::Mapping(map) if !map.contains_key(key) => {
                map.insert(Value::from(key), value);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }
}

/// A synced `model_list` entry, in LiteLLM's format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub model_name: String,
    pub litellm_params: LitellmParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LitellmParams {
    pub model: String,
    pub extra_headers: BTreeMap<String, String>,
    pub model_info: ModelInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_models_for: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub litellm_provider: String,
    pub mode: String,
    #[serde(default)]
    pub input_cost_per_token: f64,
    #[serde(default)]
    pub output_cost_per_token: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub supports_function_calling: bool,
    #[serde(default)]
    pub supports_tool_calls: bool,
    #[serde(default)]
    pub supports_parallel_function_calling: bool,
    #[serde(default)]
    pub supports_structured_outputs: bool,
    #[serde(default)]
    pub supports_response_schema: bool,
    #[serde(default)]
    pub supports_system_messages: bool,
}

impl From<&ClassifiedModel> for ModelEntry {
    fn from(model: &ClassifiedModel) -> Self {
        let limits = model.token_limits;
        Self {
            model_name: model.qualified_name.clone(),
            litellm_params: LitellmParams {
                model: model.qualified_name.clone(),
                extra_headers: model.headers.clone(),
                model_info: ModelInfo {
                    litellm_provider: SYNCED_NAMESPACE.to_string(),
                    mode: "chat".to_string(),
                    input_cost_per_token: 0.0,
                    output_cost_per_token: 0.0,
                    max_tokens: limits.max_tokens,
                    max_input_tokens: limits.max_input_tokens,
                    max_output_tokens: limits.max_output_tokens,
                    supports_vision: model.has(Capability::Vision),
                    supports_function_calling: model.has(Capability::FunctionCalling),
                    supports_tool_calls: model.has(Capability::FunctionCalling),
                    supports_parallel_function_calling: model
                        .has(Capability::ParallelFunctionCalling),
                    supports_structured_outputs: model.has(Capability::StructuredOutputs),
                    supports_response_schema: model.has(Capability::ResponseSchema),
                    supports_system_messages: true,
                },
                cache_models_for: model.cacheable.then_some(CACHE_MODELS_FOR_SECS),
            },
        }
    }
}

impl ModelEntry {
    pub fn to_value(&self) -> Result<Value, serde_yaml::Error> {
        serde_yaml::to_value(self)
    }

    /// Capabilities for the human-readable summary.
    pub fn capability_summary(&self) -> String {
        let info = &self.litellm_params.model_info;
        let mut caps = Vec::new();
        if info.supports_vision {
            caps.push("vision");
        }
        if info.supports_function_calling {
            caps.push("function_calling");
        }
        if info.supports_structured_outputs {
            caps.push("structured_outputs");
        }
        if caps.is_empty() {
            "basic_chat".to_string()
        } else {
            caps.join(", ")
        }
    }
}
