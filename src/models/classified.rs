use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

/// Prefix owned by this tool in `model_list`; also the LiteLLM provider name.
pub const SYNCED_NAMESPACE: &str = "github_copilot";

/// Protocol-identification headers sent to the catalog and stored on every
/// synced entry.
pub const COPILOT_HEADERS: [(&str, &str); 4] = [
    ("Editor-Version", "vscode/1.85.1"),
    ("Editor-Plugin-Version", "copilot/1.155.0"),
    ("User-Agent", "GithubCopilot/1.155.0"),
    ("Copilot-Integration-Id", "vscode-chat"),
];

/// Share of the context window assumed for input when upstream omits it.
pub const INPUT_SHARE_PERCENT: u64 = 75;
/// Share of the context window assumed for output when upstream omits it.
pub const OUTPUT_SHARE_PERCENT: u64 = 25;

/// How long the proxy may cache the model list of a cacheable model.
pub const CACHE_MODELS_FOR_SECS: u64 = 7200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Vision,
    FunctionCalling,
    ParallelFunctionCalling,
    StructuredOutputs,
    ResponseSchema,
}

impl Capability {
    /// Upstream `supports.*` flag each capability is read from.
    pub const UPSTREAM_FLAGS: [(&'static str, Capability); 5] = [
        ("vision", Capability::Vision),
        ("tool_calls", Capability::FunctionCalling),
        ("parallel_tool_calls", Capability::ParallelFunctionCalling),
        ("structured_outputs", Capability::StructuredOutputs),
        ("response_schema", Capability::ResponseSchema),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Vision => "vision",
            Capability::FunctionCalling => "function_calling",
            Capability::ParallelFunctionCalling => "parallel_function_calling",
            Capability::StructuredOutputs => "structured_outputs",
            Capability::ResponseSchema => "response_schema",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenLimits {
    pub max_tokens: Option<u64>,
    pub max_input_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
}

impl TokenLimits {
    /// Fill in whatever upstream did not report from the context window using
    /// the fixed input/output shares. Reported values always win.
    pub fn derive(
        max_tokens: Option<u64>,
        reported_input: Option<u64>,
        reported_output: Option<u64>,
    ) -> Self {
        // Split before multiplying so huge reported windows cannot overflow.
        let share = |percent: u64| {
            max_tokens.map(|total| total / 100 * percent + total % 100 * percent / 100)
        };
        Self {
            max_tokens,
            max_input_tokens: reported_input.or_else(|| share(INPUT_SHARE_PERCENT)),
            max_output_tokens: reported_output.or_else(|| share(OUTPUT_SHARE_PERCENT)),
        }
    }
}

/// A catalog record that passed inclusion, in the shape the merger needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedModel {
    /// `github_copilot/<upstream id>`
    pub qualified_name: String,
    pub capabilities: BTreeSet<Capability>,
    pub token_limits: TokenLimits,
    pub cacheable: bool,
    pub headers: BTreeMap<String, String>,
}

impl ClassifiedModel {
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

pub fn qualified_name(upstream_id: &str) -> String {
    format!("{SYNCED_NAMESPACE}/{upstream_id}")
}

pub fn is_synced_name(name: &str) -> bool {
    name.strip_prefix(SYNCED_NAMESPACE)
        .is_some_and(|rest| rest.starts_with('/'))
}

pub fn copilot_headers() -> BTreeMap<String, String> {
    COPILOT_HEADERS
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
