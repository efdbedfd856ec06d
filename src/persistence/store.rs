use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;

/// One record per account, stored as an opaque JSON payload
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, account_id: &str, payload: &str) -> Result<()>;

    async fn load(&self, account_id: &str) -> Result<Option<String>>;

    async fn delete(&self, account_id: &str) -> Result<()>;
}

/// `<dir>/<account>.json`, replaced atomically through a temp file
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, account_id: &str) -> PathBuf {
        let name: String = account_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, account_id: &str, payload: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(account_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Wrote snapshot {}", path.display());
        Ok(())
    }

    async fn load(&self, account_id: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(account_id)).await {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, account_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(account_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    records: RwLock<HashMap<String, String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, account_id: &str, payload: &str) -> Result<()> {
        self.records
            .write()
            .await
            .insert(account_id.to_string(), payload.to_string());
        Ok(())
    }

    async fn load(&self, account_id: &str) -> Result<Option<String>> {
        Ok(self.records.read().await.get(account_id).cloned())
    }

    async fn delete(&self, account_id: &str) -> Result<()> {
        self.records.write().await.remove(account_id);
        Ok(())
    }
}
