use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;

/// Durable home of the settings document.
///
/// The store always hands over the complete document; backends never patch.
#[async_trait]
pub trait SettingsBackend: Send + Sync {
    /// `None` when nothing has been stored yet.
    async fn load(&self) -> Result<Option<String>>;

    async fn store(&self, document: &str) -> Result<()>;
}

pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "settings.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SettingsBackend for JsonFileBackend {
    async fn load(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read settings file: {}", self.path.display()))?;
        Ok(Some(content))
    }

    async fn store(&self, document: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create settings dir: {}", parent.display())
                })?;
            }
        }

        // the document on disk is always complete
        let staging = self.staging_path();
        tokio::fs::write(&staging, document)
            .await
            .with_context(|| format!("failed to write settings file: {}", staging.display()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("failed to replace settings file: {}", self.path.display()))?;
        Ok(())
    }
}

/// Process-local backend for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryBackend {
    document: TokioMutex<Option<String>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: impl Into<String>) -> Self {
        Self {
            document: TokioMutex::new(Some(document.into())),
            ..Self::default()
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn document(&self) -> Option<String> {
        self.document.lock().await.clone()
    }

    /// Makes every following `store` fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SettingsBackend for MemoryBackend {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.document.lock().await.clone())
    }

    async fn store(&self, document: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("memory backend rejected write");
        }
        *self.document.lock().await = Some(document.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
