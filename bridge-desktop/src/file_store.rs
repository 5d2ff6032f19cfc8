//! JSON-file backed key-value store

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::KeyValueStore,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_APP_DIR: &str = "gateway-client";
const DEFAULT_FILE_NAME: &str = "session.json";

/// Stores every key in one JSON object on disk.
///
/// The file is read lazily on first access and rewritten in full on each
/// mutation, via a temporary file and rename so a crash never leaves a
/// half-written record behind. A file that fails to parse is logged and
/// treated as empty.
pub struct FileKeyValueStore {
    path: PathBuf,
    cache: Mutex<Option<BTreeMap<String, String>>>,
}

impl FileKeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    /// `<data dir>/gateway-client/session.json`
    pub fn default_location() -> Result<Self> {
        let data_dir = dirs::data_dir().ok_or_else(|| {
            BridgeError::NotAvailable("Platform data directory could not be determined".into())
        })?;
        Ok(Self::new(
            data_dir.join(DEFAULT_APP_DIR).join(DEFAULT_FILE_NAME),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, String>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable storage file");
                Ok(BTreeMap::new())
            }
        }
    }

    async fn persist(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(map)
            .map_err(|e| BridgeError::Storage(format!("Failed to encode storage file: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), keys = map.len(), "Wrote storage file");
        Ok(())
    }

    /// Apply `mutate` to the cached map and write the result.
    ///
    /// The cache is only updated once the write succeeded.
    async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> bool + Send,
    {
        let mut guard = self.cache.lock().await;
        let mut map = match guard.as_ref() {
            Some(map) => map.clone(),
            None => self.load().await?,
        };

        if mutate(&mut map) {
            self.persist(&map).await?;
        }
        *guard = Some(map);
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        Ok(guard.as_ref().and_then(|map| map.get(key).cloned()))
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.update(|map| {
            map.insert(key.to_string(), value.to_string());
            true
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.update(|map| map.remove(key).is_some()).await
    }

    async fn set_many(&self, entries: &[(String, String)]) -> Result<()> {
        self.update(|map| {
            for (key, value) in entries {
                map.insert(key.clone(), value.clone());
            }
            !entries.is_empty()
        })
        .await
    }

    async fn remove_many(&self, keys: &[String]) -> Result<()> {
        self.update(|map| {
            let mut changed = false;
            for key in keys {
                changed |= map.remove(key).is_some();
            }
            changed
        })
        .await
    }
}
