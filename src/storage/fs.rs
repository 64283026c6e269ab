//! Filesystem object store rooted at a directory: `{root}/{bucket}/{key}`.

use super::{ObjectMetadata, ObjectStore, ObjectStoreError, StorageRef};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;

/// Local directory acting as an object store.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Serve objects from beneath `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a reference to a path, refusing anything that escapes the root.
    fn object_path(&self, location: &StorageRef) -> Result<PathBuf, ObjectStoreError> {
        let mut path = self.root.clone();
        for part in [location.bucket.as_str(), location.key.as_str()] {
            let relative = Path::new(part);
            if part.is_empty()
                || relative
                    .components()
                    .any(|component| !matches!(component, Component::Normal(_)))
            {
                return Err(ObjectStoreError::InvalidReference(location.to_string()));
            }
            path.push(relative);
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn exists(&self, location: &StorageRef) -> Result<bool, ObjectStoreError> {
        let path = self.object_path(location)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn metadata(&self, location: &StorageRef) -> Result<ObjectMetadata, ObjectStoreError> {
        let path = self.object_path(location)?;
        let meta = match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(ObjectStoreError::Missing(location.clone())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ObjectStoreError::Missing(location.clone()));
            }
            Err(err) => return Err(err.into()),
        };

        let mut metadata = ObjectMetadata::new();
        metadata.insert("content-length".into(), meta.len().to_string());
        if let Some(modified) = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        {
            metadata.insert("last-modified".into(), modified.as_secs().to_string());
        }
        Ok(metadata)
    }

    async fn bytes(&self, location: &StorageRef) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.object_path(location)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ObjectStoreError::Missing(location.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }
}
