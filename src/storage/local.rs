//! Local directory backend.
//!
//! Useful for running the whole pipeline on one machine: the directory plays
//! the bucket, and `file://` URIs stand in for extract destinations.

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use snafu::prelude::*;
use std::sync::Arc;
use tracing::debug;

use crate::error::{IoSnafu, ObjectStoreSnafu, StorageError};

use super::{BackendConfig, StorageProvider};

/// A directory on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub path: String,
    pub key: Option<Path>,
}

impl StorageProvider {
    /// Open `config.path` as a store, creating the directory if needed.
    ///
    /// The root URI uses the canonical directory so URIs built from it
    /// survive symlinked temp dirs.
    pub(super) async fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.path)
            .await
            .context(IoSnafu)?;
        let root = tokio::fs::canonicalize(&config.path)
            .await
            .context(IoSnafu)?;
        debug!("Using local shard directory {}", root.display());

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(LocalFileSystem::new_with_prefix(&root).context(ObjectStoreSnafu)?);

        Ok(Self {
            root_uri: format!("file://{}", root.display()),
            config: BackendConfig::Local(config),
            object_store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let config = LocalConfig {
            path: nested.to_string_lossy().into_owned(),
            key: None,
        };

        let storage = StorageProvider::construct_local(config).await.unwrap();

        assert!(nested.is_dir());
        let canonical = std::fs::canonicalize(&nested).unwrap();
        assert_eq!(storage.root_uri(), format!("file://{}", canonical.display()));
    }

    #[tokio::test]
    async fn test_objects_are_plain_files() {
        let dir = TempDir::new().unwrap();
        let config = LocalConfig {
            path: dir.path().to_string_lossy().into_owned(),
            key: None,
        };
        let storage = StorageProvider::construct_local(config).await.unwrap();

        storage
            .put(&Path::from("q/000000000000.json.gz"), b"x".to_vec())
            .await
            .unwrap();

        let on_disk = dir.path().join("q").join("000000000000.json.gz");
        assert_eq!(std::fs::read(on_disk).unwrap(), b"x");
    }
}
