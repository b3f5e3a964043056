//! Artifact storage for hazard and impact layers.
//!
//! Job bodies write their outputs through an [`ArtifactStore`] and report the
//! resulting path in their result payload (`hazard_path`, `impact_path`).
//!
//! - On-disk storage under an output root in deployments
//! - In-memory storage for tests
//!
//! This is a thin wrapper around `object_store`, which provides both backends.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use object_store::ObjectStore;
use object_store::ObjectStoreExt;
use object_store::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),

    #[error("path {0} is outside the artifact root")]
    OutsideRoot(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object_store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Filesystem,
    Memory,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::Filesystem => "filesystem",
            StorageKind::Memory => "memory",
        }
    }

    /// Parse a `STORAGE_BACKEND` value.
    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "filesystem" | "fs" => Ok(StorageKind::Filesystem),
            "memory" | "mem" => Ok(StorageKind::Memory),
            other => Err(StorageError::InvalidConfig(format!(
                "unsupported STORAGE_BACKEND={other} (expected filesystem|memory)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub kind: StorageKind,
    /// Output root. Reported artifact paths are `root/<key>`.
    pub root: PathBuf,
}

impl StorageConfig {
    /// In-memory store that reports paths as if written under `root`.
    pub fn memory(root: impl Into<PathBuf>) -> Self {
        Self {
            kind: StorageKind::Memory,
            root: root.into(),
        }
    }

    pub fn filesystem(root: impl Into<PathBuf>) -> Self {
        Self {
            kind: StorageKind::Filesystem,
            root: root.into(),
        }
    }
}

/// Where job bodies read inputs from and write layers to.
#[derive(Clone)]
pub struct ArtifactStore {
    kind: StorageKind,
    store: Arc<dyn ObjectStore>,
    root: PathBuf,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("kind", &self.kind)
            .field("root", &self.root)
            .finish()
    }
}

impl ArtifactStore {
    pub async fn new(cfg: StorageConfig) -> Result<Self, StorageError> {
        let store: Arc<dyn ObjectStore> = match cfg.kind {
            StorageKind::Filesystem => {
                ensure_dir(&cfg.root)?;
                Arc::new(object_store::local::LocalFileSystem::new_with_prefix(&cfg.root)?)
            }
            StorageKind::Memory => Arc::new(object_store::memory::InMemory::new()),
        };

        Ok(Self {
            kind: cfg.kind,
            store,
            root: cfg.root,
        })
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub fn root(&self) -> &FsPath {
        &self.root
    }

    fn to_path(&self, key: &str) -> Result<Path, StorageError> {
        let key = key.trim_matches('/');
        if key.is_empty() {
            return Err(StorageError::InvalidConfig(
                "object key must not be empty".to_string(),
            ));
        }
        Ok(Path::from(key))
    }

    /// Absolute path an artifact key is reported under.
    pub fn public_path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_matches('/'))
    }

    /// Key of an artifact given its reported path.
    pub fn key_for(&self, path: &FsPath) -> Result<String, StorageError> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::OutsideRoot(path.to_path_buf()))?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if key.is_empty() {
            return Err(StorageError::OutsideRoot(path.to_path_buf()));
        }
        Ok(key)
    }

    /// Store `bytes` under `key` and return the reported path.
    pub async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<PathBuf, StorageError> {
        let path = self.to_path(key)?;
        self.store
            .put(&path, object_store::PutPayload::from(bytes))
            .await?;
        tracing::debug!(key, backend = self.kind.as_str(), "Stored artifact");
        Ok(self.public_path(key))
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.to_path(key)?;
        let res = self.store.get(&path).await?;
        Ok(res.bytes().await?)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.to_path(key)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.to_path(key)?;
        self.store.delete(&path).await?;
        Ok(())
    }

    pub async fn put_json_value(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<PathBuf, StorageError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.put_bytes(key, Bytes::from(bytes)).await
    }

    pub async fn get_json_value(&self, key: &str) -> Result<serde_json::Value, StorageError> {
        let bytes = self.get_bytes(key).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn ensure_dir(root: &FsPath) -> Result<(), StorageError> {
    std::fs::create_dir_all(root)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    #[tokio::test]
    async fn memory_store_reports_paths_under_root() -> Result<(), StorageError> {
        let store = ArtifactStore::new(StorageConfig::memory("/home/realtime/ashmaps")).await?;
        let path = store
            .put_bytes("201702211904+0700_Merapi/ash_fall.tif", Bytes::from("layer"))
            .await?;
        assert_eq!(
            path,
            PathBuf::from("/home/realtime/ashmaps/201702211904+0700_Merapi/ash_fall.tif")
        );
        assert_eq!(
            store.key_for(&path)?,
            "201702211904+0700_Merapi/ash_fall.tif"
        );
        assert!(store.exists("201702211904+0700_Merapi/ash_fall.tif").await?);
        assert!(!store.exists("201702211904+0700_Merapi/impact.tif").await?);
        Ok(())
    }

    #[tokio::test]
    async fn filesystem_store_writes_real_files() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let store = ArtifactStore::new(StorageConfig::filesystem(dir.path())).await?;

        let path = store
            .put_bytes("20180220163351-initial/hazard.tif", Bytes::from("mmi"))
            .await?;
        assert_eq!(path, dir.path().join("20180220163351-initial/hazard.tif"));
        assert_eq!(std::fs::read(&path)?, b"mmi");

        let value = serde_json::json!({"shake_id": "20180220163351", "magnitude": 5.1});
        store.put_json_value("20180220163351-initial/metadata.json", &value).await?;
        assert_eq!(
            store.get_json_value("20180220163351-initial/metadata.json").await?,
            value
        );

        store.delete("20180220163351-initial/hazard.tif").await?;
        assert!(!store.exists("20180220163351-initial/hazard.tif").await?);
        Ok(())
    }

    #[test]
    fn paths_outside_root_are_rejected() {
        let cfg = StorageConfig::memory("/srv/out");
        assert_eq!(cfg.kind, StorageKind::Memory);
        assert!(matches!(StorageKind::parse("s3"), Err(StorageError::InvalidConfig(_))));
        assert_eq!(StorageKind::parse("FS").ok(), Some(StorageKind::Filesystem));
    }

    #[tokio::test]
    async fn key_for_rejects_foreign_paths() -> Result<(), StorageError> {
        let store = ArtifactStore::new(StorageConfig::memory("/srv/out")).await?;
        assert!(matches!(
            store.key_for(FsPath::new("/etc/passwd")),
            Err(StorageError::OutsideRoot(_))
        ));
        assert!(matches!(
            store.key_for(FsPath::new("/srv/out")),
            Err(StorageError::OutsideRoot(_))
        ));
        Ok(())
    }
}
