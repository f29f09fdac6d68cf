use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde_yaml::{Mapping, Value};

use crate::models::classified::{is_synced_name, ClassifiedModel};
use crate::models::document::{ConfigDocument, ModelEntry};
use crate::models::sync_result::ChangedEntries;

/// Merge freshly classified models into `current`.
///
/// Synced entries are replaced in place, appended when new, and dropped when
/// upstream no longer offers them. Every other entry is copied through in its
/// original position.
pub fn merge(
    current: &ConfigDocument,
    classified: &[ClassifiedModel],
) -> Result<(ConfigDocument, ChangedEntries), serde_yaml::Error> {
    let mut target_order: Vec<String> = Vec::with_capacity(classified.len());
    let mut target: HashMap<String, Value> = HashMap::with_capacity(classified.len());
    for model in classified {
        let entry = ModelEntry::from(model).to_value()?;
        if target.insert(model.qualified_name.clone(), entry).is_some() {
            tracing::warn!(
                "Duplicate model {} in merge input, keeping the later one",
                model.qualified_name
            );
        } else {
            target_order.push(model.qualified_name.clone());
        }
    }

    let mut diff = ChangedEntries::default();
    let mut placed: HashSet<String> = HashSet::new();
    let mut entries: Vec<Value> = Vec::with_capacity(current.entries().len() + classified.len());

    for existing in current.entries() {
        let name = match ConfigDocument::entry_name(existing) {
            Some(name) if is_synced_name(name) => name,
            _ => {
                entries.push(existing.clone());
                continue;
            }
        };

        match target.get(name) {
            Some(_) if placed.contains(name) => {
                tracing::warn!("Dropping repeated entry {} from config document", name);
            }
            Some(fresh) => {
                if fresh != existing {
                    diff.updated.push(name.to_string());
                }
                entries.push(fresh.clone());
                placed.insert(name.to_string());
            }
            None => {
                if !diff.removed.iter().any(|r| r == name) {
                    diff.removed.push(name.to_string());
                }
            }
        }
    }

    for name in target_order {
        if placed.contains(&name) {
            continue;
        }
        if let Some(entry) = target.remove(&name) {
            entries.push(entry);
            diff.added.push(name);
        }
    }

    let mut candidate = current.clone();
    candidate.set_entries(entries);
    Ok((candidate, diff))
}

/// Add the proxy settings a synced config relies on, if they are missing.
/// Returns whether the document changed.
pub fn ensure_default_settings(doc: &mut ConfigDocument, token_dir: Option<&Path>) -> bool {
    let mut cache_config = Mapping::new();
    cache_config.insert("type".into(), "redis".into());
    cache_config.insert("host".into(), "redis".into());
    cache_config.insert("port".into(), Value::from(6379_u64));
    cache_config.insert("password".into(), "".into());
    cache_config.insert("db".into(), Value::from(0_u64));

    let mut copilot = Mapping::new();
    let token_dir = token_dir
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/github_auth".to_string());
    copilot.insert("token_dir".into(), token_dir.into());
    copilot.insert("cache_models".into(), true.into());

    let cache_added =
        doc.ensure_setting("litellm_settings", "cache_config", Value::Mapping(cache_config));
    let copilot_added =
        doc.ensure_setting("general_settings", "github_copilot", Value::Mapping(copilot));
    cache_added || copilot_added
}
