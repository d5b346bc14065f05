//! Durable per-key user settings.
//!
//! The whole store is loaded once in [`SettingsStore::open`] and kept in memory.
//! Every mutation rewrites the full document through the backend before the
//! call returns. A failed write is logged and the in-memory state stays
//! authoritative.

use std::sync::Arc;

use anyhow::Result;
use coderelay_schema::{MessageCategory, SettingsKey};
use tokio::sync::Mutex as TokioMutex;

mod backend;
mod record;

pub use backend::{JsonFileBackend, MemoryBackend, SettingsBackend};
pub use record::{SessionMappingKey, SettingsRecord};

use record::Records;

pub struct SettingsStore {
    records: TokioMutex<Records>,
    backend: Arc<dyn SettingsBackend>,
}

impl SettingsStore {
    /// Loads the stored document, normalizing legacy forms in place.
    ///
    /// A document that cannot be parsed is logged and treated as empty. It is
    /// left untouched on disk until the first mutation.
    pub async fn open(backend: Arc<dyn SettingsBackend>) -> Result<Self> {
        let records = match backend.load().await? {
            None => Records::new(),
            Some(raw) => match record::decode(&raw) {
                Ok(decoded) => {
                    if decoded.needs_rewrite {
                        tracing::info!(
                            records = decoded.records.len(),
                            "normalizing legacy settings document"
                        );
                        Self::write(backend.as_ref(), &decoded.records).await;
                    }
                    decoded.records
                }
                Err(e) => {
                    tracing::warn!("ignoring unreadable settings document: {e:#}");
                    Records::new()
                }
            },
        };

        tracing::debug!(records = records.len(), "settings store loaded");
        Ok(Self {
            records: TokioMutex::new(records),
            backend,
        })
    }

    pub async fn in_memory() -> Self {
        Self {
            records: TokioMutex::new(Records::new()),
            backend: Arc::new(MemoryBackend::new()),
        }
    }

    /// Returns the record, creating and persisting a default one on first access.
    pub async fn get_or_create(&self, key: &SettingsKey) -> SettingsRecord {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get(key) {
            return record.clone();
        }
        records.insert(key.clone(), SettingsRecord::default());
        Self::write(self.backend.as_ref(), &records).await;
        SettingsRecord::default()
    }

    pub async fn replace(&self, key: &SettingsKey, record: SettingsRecord) {
        self.mutate(key, |current| *current = record).await;
    }

    /// Flips one category and returns whether it is hidden afterwards.
    pub async fn toggle_hidden_category(
        &self,
        key: &SettingsKey,
        category: MessageCategory,
    ) -> bool {
        self.mutate(key, |record| {
            if record.hidden_categories.remove(&category) {
                false
            } else {
                record.hidden_categories.insert(category);
                true
            }
        })
        .await
    }

    pub async fn is_hidden(&self, key: &SettingsKey, category: MessageCategory) -> bool {
        self.get_or_create(key).await.is_hidden(category)
    }

    pub async fn set_working_directory(&self, key: &SettingsKey, directory: Option<String>) {
        self.mutate(key, |record| record.custom_working_directory = directory)
            .await;
    }

    pub async fn working_directory(&self, key: &SettingsKey) -> Option<String> {
        self.get_or_create(key).await.custom_working_directory
    }

    pub async fn set_session_mapping(
        &self,
        key: &SettingsKey,
        base_session_id: &str,
        working_path: &str,
        engine_session_id: &str,
    ) {
        let mapping = SessionMappingKey::new(base_session_id, working_path);
        self.mutate(key, |record| {
            record
                .session_mappings
                .insert(mapping, engine_session_id.to_string());
        })
        .await;
    }

    pub async fn session_mapping(
        &self,
        key: &SettingsKey,
        base_session_id: &str,
        working_path: &str,
    ) -> Option<String> {
        self.get_or_create(key)
            .await
            .session_mapping(base_session_id, working_path)
            .map(str::to_string)
    }

    /// Removes one path's mapping, or every path under the base session when
    /// `working_path` is `None`. Returns how many entries went away.
    pub async fn clear_session_mapping(
        &self,
        key: &SettingsKey,
        base_session_id: &str,
        working_path: Option<&str>,
    ) -> usize {
        self.mutate(key, |record| {
            let before = record.session_mappings.len();
            record.session_mappings.retain(|mapping, _| {
                mapping.base_session_id != base_session_id
                    || working_path.is_some_and(|path| mapping.working_path != path)
            });
            before - record.session_mappings.len()
        })
        .await
    }

    pub async fn clear_all_session_mappings(&self, key: &SettingsKey) {
        self.mutate(key, |record| record.session_mappings.clear())
            .await;
    }

    async fn mutate<R>(
        &self,
        key: &SettingsKey,
        apply: impl FnOnce(&mut SettingsRecord) -> R,
    ) -> R {
        let mut records = self.records.lock().await;
        let output = apply(records.entry(key.clone()).or_default());
        // the lock is held across the write so documents land in mutation order
        Self::write(self.backend.as_ref(), &records).await;
        output
    }

    async fn write(backend: &dyn SettingsBackend, records: &Records) {
        let result = match record::encode(records) {
            Ok(document) => backend.store(&document).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!("failed to persist settings, keeping in-memory state: {e:#}");
        }
    }
}
