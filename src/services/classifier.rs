use std::collections::HashMap;

use crate::models::catalog::RawModelRecord;
use crate::models::classified::{copilot_headers, qualified_name, Capability, ClassifiedModel, TokenLimits};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionReason {
    MissingId,
    NotPickerEnabled,
    NotChat(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Included(ClassifiedModel),
    Excluded(ExclusionReason),
}

/// Decide whether an upstream record is synced and, if so, normalize it.
/// Never fails: malformed input is simply excluded.
pub fn classify(record: &RawModelRecord) -> Classification {
    let id = record.id.trim();
    if id.is_empty() {
        return Classification::Excluded(ExclusionReason::MissingId);
    }
    if !record.enabled_for_picker {
        return Classification::Excluded(ExclusionReason::NotPickerEnabled);
    }
    let kind = record.capabilities.kind.as_deref();
    if kind != Some("chat") {
        return Classification::Excluded(ExclusionReason::NotChat(kind.map(str::to_string)));
    }

    let capabilities = Capability::UPSTREAM_FLAGS
        .iter()
        .filter(|(flag, _)| record.supports(flag))
        .map(|(_, cap)| *cap)
        .collect();

    let limits = &record.capabilities.limits;

    Classification::Included(ClassifiedModel {
        qualified_name: qualified_name(id),
        capabilities,
        token_limits: TokenLimits::derive(
            limits.max_tokens,
            limits.max_input_tokens,
            limits.max_output_tokens,
        ),
        cacheable: record.supports("streaming"),
        headers: copilot_headers(),
    })
}

/// Result of classifying a whole catalog snapshot.
#[derive(Debug, Default)]
pub struct ClassifiedBatch {
    pub discovered: usize,
    pub models: Vec<ClassifiedModel>,
}

/// Classify every record, deduplicating by qualified name. A later duplicate
/// replaces the earlier one but keeps its position.
pub fn classify_all(records: &[RawModelRecord]) -> ClassifiedBatch {
    let mut models: Vec<ClassifiedModel> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records {
        match classify(record) {
            Classification::Included(model) => {
                if let Some(&pos) = index.get(&model.qualified_name) {
                    tracing::warn!(
                        "Upstream reported {} more than once, keeping the last record",
                        model.qualified_name
                    );
                    models[pos] = model;
                } else {
                    index.insert(model.qualified_name.clone(), models.len());
                    models.push(model);
                }
            }
            Classification::Excluded(reason) => {
                tracing::debug!("Skipping model {:?}: {:?}", record.id, reason);
            }
        }
    }

    ClassifiedBatch {
        discovered: records.len(),
        models,
    }
}
