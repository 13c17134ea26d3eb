//! Object storage abstraction.
//!
//! Provides a unified interface over Google Cloud Storage, the local
//! filesystem and an in-memory store. Shards produced by a warehouse extract
//! live here until they are merged and reclaimed.

mod gcs;
mod local;
mod memory;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use regex::Regex;
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use memory::MemoryConfig;

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over different storage backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    /// URI of the configured root, in the scheme a warehouse extract accepts.
    pub(crate) root_uri: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.root_uri)
    }
}

const GCS_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-_\.]+)\.storage\.googleapis\.com(/(?P<key>.+?))?/?$";
const GCS_PATH: &str =
    r"^https://storage\.googleapis\.com/(?P<bucket>[a-z0-9\-_\.]+)(/(?P<key>.+?))?/?$";
const GCS_URL: &str = r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+?))?/?$";

const MEMORY_URL: &str = r"^memory://(/?(?P<key>.+?))?/?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
enum Backend {
    Gcs,
    Memory,
    Local,
}

/// Matchers are tried in this order; `file:` must come after `memory://`.
const BACKEND_ORDER: [Backend; 3] = [Backend::Gcs, Backend::Memory, Backend::Local];

fn matchers() -> &'static HashMap<Backend, Vec<Regex>> {
    static MATCHERS: OnceLock<HashMap<Backend, Vec<Regex>>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("storage URL pattern must compile"))
                .collect()
        };

        let mut m = HashMap::new();
        m.insert(Backend::Gcs, compile(&[GCS_PATH, GCS_VIRTUAL, GCS_URL]));
        m.insert(Backend::Memory, compile(&[MEMORY_URL]));
        m.insert(Backend::Local, compile(&[FILE_URI, FILE_URL, FILE_PATH]));
        m
    })
}

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Gcs(GcsConfig),
    Local(LocalConfig),
    Memory(MemoryConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        let matchers = matchers();
        for backend in BACKEND_ORDER {
            let Some(captures) = matchers[&backend].iter().find_map(|r| r.captures(url)) else {
                continue;
            };
            let key = captures.name("key").map(|m| Path::from(m.as_str()));
            return Ok(match backend {
                Backend::Gcs => BackendConfig::Gcs(GcsConfig {
                    bucket: captures["bucket"].to_string(),
                    key,
                }),
                Backend::Memory => BackendConfig::Memory(MemoryConfig { key }),
                Backend::Local => {
                    let path = captures["path"].trim_end_matches('/');
                    let path = if path.starts_with('/') {
                        path.to_string()
                    } else {
                        format!("/{path}")
                    };
                    BackendConfig::Local(LocalConfig { path, key: None })
                }
            });
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Local(local) => local.key.as_ref(),
            BackendConfig::Memory(memory) => memory.key.as_ref(),
        }
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::Gcs(config) => Self::construct_gcs(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
            BackendConfig::Memory(config) => Ok(Self::construct_memory(config)),
        }
    }

    /// A fresh, empty in-memory store.
    pub fn in_memory() -> Self {
        Self::construct_memory(MemoryConfig { key: None })
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// URI of the configured root (bucket plus key prefix).
    pub fn root_uri(&self) -> &str {
        &self.root_uri
    }

    /// URI of `prefix` below the configured root.
    pub fn uri_for(&self, prefix: &str) -> String {
        if self.root_uri.ends_with('/') {
            format!("{}{}", self.root_uri, prefix)
        } else {
            format!("{}/{}", self.root_uri, prefix)
        }
    }

    /// The part of `uri` below the configured root, for URIs produced by
    /// [`uri_for`](Self::uri_for). `None` if the URI points elsewhere.
    pub fn relative_path<'a>(&self, uri: &'a str) -> Option<&'a str> {
        let rest = uri.strip_prefix(self.root_uri.as_str())?;
        if self.root_uri.ends_with('/') {
            Some(rest)
        } else {
            rest.strip_prefix('/')
        }
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// List objects under a prefix (relative to the configured root).
    ///
    /// Returns paths relative to the configured root, so they can be passed
    /// straight back to `get_stream` and `delete`.
    pub fn list_with_prefix(
        &self,
        prefix: &str,
    ) -> BoxStream<'_, Result<Path, StorageError>> {
        emit!(StorageRequest {
            operation: StorageOperation::List,
            status: RequestStatus::Success,
        });

        let full_prefix = self.qualify_path(&Path::from(prefix)).into_owned();
        let key_part_count = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        self.object_store
            .list(Some(&full_prefix))
            .map_ok(move |meta| -> Path { meta.location.parts().skip(key_part_count).collect() })
            .map_err(|source| StorageError::ObjectStore { source })
            .boxed()
    }

    /// Stream the contents of an object.
    pub async fn get_stream(
        &self,
        path: &Path,
    ) -> Result<BoxStream<'static, Result<Bytes, StorageError>>, StorageError> {
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(path)).await;

        emit!(StorageRequest {
            operation: StorageOperation::Get,
            status: RequestStatus::of(&result),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::Get,
            duration: start.elapsed(),
        });

        let stream = result
            .context(ObjectStoreSnafu)?
            .into_stream()
            .map_err(|source| StorageError::ObjectStore { source })
            .boxed();
        Ok(stream)
    }

    /// Get the full contents of an object.
    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let chunks: Vec<Bytes> = self.get_stream(path).await?.try_collect().await?;
        Ok(chunks.concat().into())
    }

    /// Put bytes to a path.
    pub async fn put(&self, path: &Path, bytes: impl Into<Bytes>) -> Result<(), StorageError> {
        let payload = PutPayload::from(bytes.into());
        let start = Instant::now();
        let result = self
            .object_store
            .put(&self.qualify_path(path), payload)
            .await;

        emit!(StorageRequest {
            operation: StorageOperation::Put,
            status: RequestStatus::of(&result),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::Put,
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Delete the object at the given path.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = self.object_store.delete(&self.qualify_path(path)).await;

        emit!(StorageRequest {
            operation: StorageOperation::Delete,
            status: RequestStatus::of(&result),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::Delete,
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }
}

/// List every object under `prefix`, in list order.
///
/// A missing prefix is an empty listing, not an error.
pub async fn list_objects(
    storage: &StorageProvider,
    prefix: &str,
) -> Result<Vec<Path>, StorageError> {
    let mut objects = Vec::new();
    let mut stream = storage.list_with_prefix(prefix);

    while let Some(result) = stream.next().await {
        match result {
            Ok(path) => objects.push(path),
            Err(e) if e.is_not_found() => {
                tracing::debug!("Prefix not found (treating as empty): {}", prefix);
                break;
            }
            Err(e) => return Err(e),
        }
    }

    tracing::debug!("Listed {} objects under {}", objects.len(), prefix);
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_gcs_url_parsing() {
        let config = BackendConfig::parse_url("gs://mybucket/path/to/exports").unwrap();
        match config {
            BackendConfig::Gcs(gcs) => {
                assert_eq!(gcs.bucket, "mybucket");
                assert_eq!(gcs.key, Some(Path::from("path/to/exports")));
            }
            _ => panic!("Expected Gcs config"),
        }

        let config = BackendConfig::parse_url("gs://tmp").unwrap();
        assert_eq!(
            config,
            BackendConfig::Gcs(GcsConfig {
                bucket: "tmp".to_string(),
                key: None,
            })
        );
    }

    #[test]
    fn test_gcs_https_url_parsing() {
        let config =
            BackendConfig::parse_url("https://storage.googleapis.com/mybucket/exports").unwrap();
        match config {
            BackendConfig::Gcs(gcs) => {
                assert_eq!(gcs.bucket, "mybucket");
                assert_eq!(gcs.key, Some(Path::from("exports")));
            }
            _ => panic!("Expected Gcs config"),
        }
    }

    #[test]
    fn test_local_and_memory_url_parsing() {
        let config = BackendConfig::parse_url("/local/path/to/data/").unwrap();
        assert_eq!(
            config,
            BackendConfig::Local(LocalConfig {
                path: "/local/path/to/data".to_string(),
                key: None,
            })
        );

        let config = BackendConfig::parse_url("file:///srv/shards").unwrap();
        assert!(matches!(config, BackendConfig::Local(ref l) if l.path == "/srv/shards"));

        let config = BackendConfig::parse_url("memory://scratch").unwrap();
        assert_eq!(
            config,
            BackendConfig::Memory(MemoryConfig {
                key: Some(Path::from("scratch")),
            })
        );
    }

    #[test]
    fn test_invalid_url() {
        let err = BackendConfig::parse_url("ftp://nope").unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_uri_round_trip() {
        let storage = StorageProvider::for_url_with_options("memory://base", HashMap::new())
            .await
            .unwrap();
        let uri = storage.uri_for("abc/*.json.gz");
        assert_eq!(uri, "memory://base/abc/*.json.gz");
        assert_eq!(storage.relative_path(&uri), Some("abc/*.json.gz"));
        assert_eq!(storage.relative_path("gs://other/abc"), None);

        let bare = StorageProvider::in_memory();
        let uri = bare.uri_for("abc/*.json.gz");
        assert_eq!(uri, "memory://abc/*.json.gz");
        assert_eq!(bare.relative_path(&uri), Some("abc/*.json.gz"));
    }

    #[tokio::test]
    async fn test_list_returns_relative_paths() {
        let temp_dir = TempDir::new().unwrap();
        let base_path = temp_dir.path();

        let export_dir = base_path.join("exports").join("q1");
        std::fs::create_dir_all(&export_dir).unwrap();
        std::fs::write(export_dir.join("000000000000.json.gz"), b"a").unwrap();
        std::fs::write(export_dir.join("000000000001.json.gz"), b"b").unwrap();
        std::fs::create_dir_all(base_path.join("exports").join("q2")).unwrap();
        std::fs::write(base_path.join("exports/q2/other.json.gz"), b"c").unwrap();

        let storage_url = format!("{}/exports", base_path.display());
        let storage = StorageProvider::for_url_with_options(&storage_url, HashMap::new())
            .await
            .unwrap();

        let mut listed: Vec<String> = list_objects(&storage, "q1")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.to_string())
            .collect();
        listed.sort();

        assert_eq!(
            listed,
            vec!["q1/000000000000.json.gz", "q1/000000000001.json.gz"]
        );

        for path in &listed {
            let content = storage.get(&Path::from(path.as_str())).await.unwrap();
            assert_eq!(content.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_put_get_delete_with_key_prefix() {
        let storage = StorageProvider::for_url_with_options("memory://root/sub", HashMap::new())
            .await
            .unwrap();
        let path = Path::from("id/000000000000.json.gz");

        storage.put(&path, b"payload".to_vec()).await.unwrap();
        assert_eq!(storage.get(&path).await.unwrap().as_ref(), b"payload");
        assert_eq!(list_objects(&storage, "id").await.unwrap(), vec![path.clone()]);

        storage.delete(&path).await.unwrap();
        assert!(list_objects(&storage, "id").await.unwrap().is_empty());
        assert!(storage.get(&path).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_missing_prefix_lists_empty() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageProvider::for_url_with_options(
            temp_dir.path().to_str().unwrap(),
            HashMap::new(),
        )
        .await
        .unwrap();

        assert!(list_objects(&storage, "never-written").await.unwrap().is_empty());
    }
}
