use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use coderelay_schema::{MessageCategory, SettingsKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Compound key of one engine session mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionMappingKey {
    pub base_session_id: String,
    pub working_path: String,
}

impl SessionMappingKey {
    pub fn new(base_session_id: impl Into<String>, working_path: impl Into<String>) -> Self {
        Self {
            base_session_id: base_session_id.into(),
            working_path: working_path.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsRecord {
    pub hidden_categories: BTreeSet<MessageCategory>,
    pub custom_working_directory: Option<String>,
    pub session_mappings: BTreeMap<SessionMappingKey, String>,
}

impl SettingsRecord {
    pub fn is_hidden(&self, category: MessageCategory) -> bool {
        self.hidden_categories.contains(&category)
    }

    pub fn session_mapping(&self, base_session_id: &str, working_path: &str) -> Option<&str> {
        self.session_mappings
            .get(&SessionMappingKey::new(base_session_id, working_path))
            .map(String::as_str)
    }

    fn from_document(key: &SettingsKey, doc: RecordDocument) -> Self {
        let mut hidden_categories = BTreeSet::new();
        for raw in doc.hidden_categories {
            match MessageCategory::parse(&raw) {
                Some(category) => {
                    hidden_categories.insert(category);
                }
                None => tracing::warn!(
                    settings_key = %key,
                    category = %raw,
                    "dropping unknown hidden category"
                ),
            }
        }

        let mut session_mappings = BTreeMap::new();
        for (base, entry) in doc.session_mappings {
            let Value::Object(paths) = entry else {
                // pre-path form `base -> id` cannot be attributed to a directory
                tracing::info!(
                    settings_key = %key,
                    base_session_id = %base,
                    "dropping legacy flat session mapping"
                );
                continue;
            };
            for (path, id) in paths {
                match id {
                    Value::String(id) => {
                        session_mappings.insert(SessionMappingKey::new(base.clone(), path), id);
                    }
                    other => tracing::warn!(
                        settings_key = %key,
                        working_path = %path,
                        "dropping non-string session id: {other}"
                    ),
                }
            }
        }

        Self {
            hidden_categories,
            custom_working_directory: doc.custom_working_directory.filter(|dir| !dir.is_empty()),
            session_mappings,
        }
    }

    fn to_document(&self) -> RecordDocument {
        let mut session_mappings: BTreeMap<String, Value> = BTreeMap::new();
        for (key, id) in &self.session_mappings {
            let paths = session_mappings
                .entry(key.base_session_id.clone())
                .or_insert_with(|| Value::Object(Default::default()));
            if let Value::Object(paths) = paths {
                paths.insert(key.working_path.clone(), Value::String(id.clone()));
            }
        }

        RecordDocument {
            hidden_categories: self
                .hidden_categories
                .iter()
                .map(|category| category.as_str().to_string())
                .collect(),
            custom_working_directory: self.custom_working_directory.clone(),
            session_mappings,
        }
    }
}

/// On-disk shape of one record. Snake-case aliases accept older documents.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordDocument {
    #[serde(default, alias = "hidden_message_types")]
    hidden_categories: Vec<String>,
    #[serde(default, alias = "custom_cwd")]
    custom_working_directory: Option<String>,
    #[serde(default, alias = "session_mappings")]
    session_mappings: BTreeMap<String, Value>,
}

pub(crate) type Records = BTreeMap<SettingsKey, SettingsRecord>;

pub(crate) struct Decoded {
    pub records: Records,
    /// The stored text differs from what `encode` would produce.
    pub needs_rewrite: bool,
}

pub(crate) fn decode(raw: &str) -> Result<Decoded> {
    let stored: Value = serde_json::from_str(raw).context("settings document is not valid JSON")?;
    let entries: BTreeMap<String, Value> = serde_json::from_value(stored.clone())
        .context("settings document is not an object of records")?;

    let mut records = Records::new();
    for (raw_key, raw_record) in entries {
        let key = SettingsKey::new(&raw_key);
        let doc: RecordDocument = match serde_json::from_value(raw_record) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(settings_key = %raw_key, "skipping unreadable settings record: {e}");
                continue;
            }
        };
        // the canonical spelling wins when legacy forms collide
        if raw_key != key.as_str() && records.contains_key(&key) {
            tracing::warn!(
                settings_key = %key,
                legacy = %raw_key,
                "discarding duplicate legacy settings record"
            );
            continue;
        }
        let record = SettingsRecord::from_document(&key, doc);
        records.insert(key, record);
    }

    let needs_rewrite = encode_value(&records)? != stored;
    Ok(Decoded {
        records,
        needs_rewrite,
    })
}

fn encode_value(records: &Records) -> Result<Value> {
    let documents: BTreeMap<&str, RecordDocument> = records
        .iter()
        .map(|(key, record)| (key.as_str(), record.to_document()))
        .collect();
    Ok(serde_json::to_value(documents)?)
}

pub(crate) fn encode(records: &Records) -> Result<String> {
    Ok(serde_json::to_string_pretty(&encode_value(records)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_nests_mappings_by_base_session() {
        let mut record = SettingsRecord::default();
        record.hidden_categories.insert(MessageCategory::System);
        record
            .session_mappings
            .insert(SessionMappingKey::new("telegram:1", "/a"), "s-a".to_string());
        record
            .session_mappings
            .insert(SessionMappingKey::new("telegram:1", "/b"), "s-b".to_string());
        let mut records = Records::new();
        records.insert(SettingsKey::from(1_i64), record);

        let value: Value = serde_json::from_str(&encode(&records).unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "1": {
                    "hiddenCategories": ["system"],
                    "customWorkingDirectory": null,
                    "sessionMappings": { "telegram:1": { "/a": "s-a", "/b": "s-b" } }
                }
            })
        );
    }

    #[test]
    fn decode_of_canonical_document_needs_no_rewrite() {
        let raw = r#"{"7":{"hiddenCategories":["result"],"customWorkingDirectory":"/w","sessionMappings":{}}}"#;
        let decoded = decode(raw).unwrap();
        assert!(!decoded.needs_rewrite);
        let record = &decoded.records[&SettingsKey::from(7_i64)];
        assert!(record.is_hidden(MessageCategory::Result));
        assert_eq!(record.custom_working_directory.as_deref(), Some("/w"));
    }

    #[test]
    fn canonical_spelling_wins_over_legacy_duplicate() {
        let raw = r#"{
            " 9": {"hiddenCategories": ["system"]},
            "9": {"hiddenCategories": ["result"]}
        }"#;
        let decoded = decode(raw).unwrap();
        assert!(decoded.needs_rewrite);
        let record = &decoded.records[&SettingsKey::from(9_i64)];
        assert!(record.is_hidden(MessageCategory::Result));
        assert!(!record.is_hidden(MessageCategory::System));
    }
}
