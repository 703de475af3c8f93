//! Object storage layer used for staging columnar files.
//!
//! Bucket URIs of the form `scheme://bucket/path` are resolved to an
//! [`ObjectStore`] per bucket through [`BucketStores`]; the [`Stager`]
//! trait uploads local files under a bucket path and deletes whole prefixes.

use async_trait::async_trait;
use futures::StreamExt;
use object_store::{
    ObjectStore, buffered::BufWriter, local::LocalFileSystem, memory::InMemory,
    path::Path as ObjectPath,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use crate::error::{CommonError, ErrorContext, Result};

/// A parsed `scheme://bucket/path` location.
///
/// Only the bucket (netloc) and path are meaningful; query strings and
/// fragments are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketUri {
    raw: String,
    scheme: String,
    bucket: String,
    key: ObjectPath,
}

impl BucketUri {
    /// Parse a bucket URI such as `gs://my-bucket/work/run-1`.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| {
            CommonError::invalid_uri_error_with_source(format!("cannot parse '{}'", uri), e)
        })?;
        let bucket = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => {
                return Err(CommonError::invalid_uri_error(format!(
                    "'{}' does not name a bucket",
                    uri
                )));
            }
        };
        let key = ObjectPath::from_url_path(url.path()).map_err(|e| {
            CommonError::invalid_uri_error_with_source(
                format!("'{}' is not a valid object path", uri),
                e,
            )
        })?;

        Ok(Self {
            raw: uri.to_string(),
            scheme: url.scheme().to_string(),
            bucket,
            key,
        })
    }

    /// URI scheme, e.g. `gs`.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Bucket name (the URI netloc).
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Decoded path inside the bucket without leading or trailing slashes.
    pub fn path(&self) -> &str {
        self.key.as_ref()
    }

    /// Object key of the location itself.
    pub fn key(&self) -> &ObjectPath {
        &self.key
    }

    /// The URI exactly as it was supplied.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Object key prefix for this location.
    pub fn prefix(&self) -> Option<ObjectPath> {
        (!self.path().is_empty()).then(|| self.key.clone())
    }

    /// Object key of `file_name` placed directly under this location.
    pub fn object_path(&self, file_name: &str) -> ObjectPath {
        self.key.child(file_name)
    }

    /// Fully qualified URI of `file_name` under this location.
    ///
    /// This is plain string concatenation: `gs://` style URIs do not follow
    /// the relative-reference rules of a general URI join.
    pub fn join_file(&self, file_name: &str) -> String {
        format!("{}/{}", self.raw.trim_end_matches('/'), file_name)
    }
}

impl fmt::Display for BucketUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageBackend {
    /// In-memory buckets for testing and development.
    #[default]
    Memory,
    /// Each bucket is a directory below `root_path`.
    LocalFileSystem { root_path: String },
    /// Google Cloud Storage, credentials taken from the environment unless
    /// a service account file is given.
    #[cfg(feature = "gcp")]
    Gcs { service_account_path: Option<String> },
}

/// Resolves bucket names to object stores, caching one handle per bucket.
pub struct BucketStores {
    backend: StorageBackend,
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl Debug for BucketStores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketStores")
            .field("backend", &self.backend)
            .finish()
    }
}

impl BucketStores {
    pub fn new(backend: StorageBackend) -> Self {
        Self {
            backend,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Shorthand for an in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(StorageBackend::Memory)
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    /// Object store holding `bucket`, created on first use.
    pub fn store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| CommonError::internal_error("bucket store cache lock poisoned"))?;
        if let Some(store) = stores.get(bucket) {
            return Ok(store.clone());
        }

        let store = self.create_store(bucket)?;
        stores.insert(bucket.to_string(), store.clone());
        Ok(store)
    }

    fn create_store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = match &self.backend {
            StorageBackend::Memory => Arc::new(InMemory::new()),
            StorageBackend::LocalFileSystem { root_path } => {
                let bucket_root = PathBuf::from(root_path).join(bucket);
                std::fs::create_dir_all(&bucket_root).with_io_context(|| {
                    format!("Failed to create bucket directory {}", bucket_root.display())
                })?;
                let fs = LocalFileSystem::new_with_prefix(&bucket_root).map_err(|e| {
                    CommonError::storage_error_with_source(
                        format!("Failed to create local filesystem storage for '{}'", bucket),
                        e,
                    )
                })?;
                Arc::new(fs)
            }
            #[cfg(feature = "gcp")]
            StorageBackend::Gcs {
                service_account_path,
            } => {
                let mut builder = object_store::gcp::GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket);
                if let Some(path) = service_account_path {
                    builder = builder.with_service_account_path(path);
                }
                let gcs = builder.build().map_err(|e| {
                    CommonError::configuration_error_with_source(
                        format!("Failed to configure GCS bucket '{}'", bucket),
                        e,
                    )
                })?;
                Arc::new(gcs)
            }
        };
        Ok(store)
    }
}

impl Default for BucketStores {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Staging operations on a bucket.
#[async_trait]
pub trait Stager: Send + Sync + Debug {
    /// Upload `local_file` under `bucket_uri`, keeping its base name, and
    /// return the staged object's URI.
    async fn upload(&self, local_file: &Path, bucket_uri: &str) -> Result<String>;

    /// Delete every object under `bucket_uri`. A missing bucket or prefix
    /// is not an error. Returns the number of objects removed.
    async fn delete_prefix(&self, bucket_uri: &str) -> Result<usize>;

    /// Operation counters.
    fn stats(&self) -> StagingStats;
}

/// Staging statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingStats {
    pub upload_count: u64,
    pub uploaded_bytes: u64,
    pub delete_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Default)]
struct InternalStagingStats {
    uploads: AtomicU64,
    uploaded_bytes: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

impl InternalStagingStats {
    fn record_upload(&self, bytes: u64) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.uploaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StagingStats {
        StagingStats {
            upload_count: self.uploads.load(Ordering::Acquire),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Acquire),
            delete_count: self.deletes.load(Ordering::Acquire),
            error_count: self.errors.load(Ordering::Acquire),
        }
    }
}

/// [`Stager`] backed by [`BucketStores`].
#[derive(Debug)]
pub struct ObjectStoreStager {
    stores: Arc<BucketStores>,
    stats: InternalStagingStats,
}

impl ObjectStoreStager {
    pub fn new(stores: Arc<BucketStores>) -> Self {
        Self {
            stores,
            stats: InternalStagingStats::default(),
        }
    }

    pub fn stores(&self) -> &Arc<BucketStores> {
        &self.stores
    }
}

#[async_trait]
impl Stager for ObjectStoreStager {
    async fn upload(&self, local_file: &Path, bucket_uri: &str) -> Result<String> {
        debug!(file = %local_file.display(), bucket_uri, "Upload file to bucket");
        let location = BucketUri::parse(bucket_uri)?;
        let file_name = local_file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                CommonError::io_error(format!(
                    "'{}' has no usable file name",
                    local_file.display()
                ))
            })?;

        let mut file = tokio::fs::File::open(local_file)
            .await
            .with_io_context(|| format!("Failed to open {}", local_file.display()))?;

        let store = self.stores.store(location.bucket())?;
        let key = location.object_path(file_name);
        let mut writer = BufWriter::new(store, key.clone());
        let copied = match tokio::io::copy(&mut file, &mut writer).await {
            Ok(copied) => writer.shutdown().await.map(|()| copied),
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    debug!(key = %key, error = %abort, "Failed to abort upload");
                }
                Err(e)
            }
        };
        if copied.is_err() {
            self.stats.record_error();
        }
        let size = copied.with_storage_context(|| {
            format!("Failed to upload {} to {}", local_file.display(), key)
        })?;
        self.stats.record_upload(size);

        Ok(location.join_file(file_name))
    }

    async fn delete_prefix(&self, bucket_uri: &str) -> Result<usize> {
        let location = BucketUri::parse(bucket_uri)?;
        debug!(
            bucket = location.bucket(),
            path = location.path(),
            "Delete path from bucket"
        );

        let store = match self.stores.store(location.bucket()) {
            Ok(store) => store,
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e),
        };

        let prefix = location.prefix();
        let mut locations = Vec::new();
        let mut listing = store.list(prefix.as_ref());
        while let Some(entry) = listing.next().await {
            match entry {
                Ok(meta) => locations.push(meta.location),
                Err(object_store::Error::NotFound { .. }) => break,
                Err(e) => {
                    self.stats.record_error();
                    return Err(e.into());
                }
            }
        }

        let mut removed = 0;
        for object in locations {
            match store.delete(&object).await {
                Ok(()) => {
                    self.stats.record_delete();
                    removed += 1;
                }
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => {
                    self.stats.record_error();
                    return Err(e.into());
                }
            }
        }

        Ok(removed)
    }

    fn stats(&self) -> StagingStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).expect("Failed to write test file");
        path
    }

    #[test]
    fn test_parse_bucket_uri() {
        let uri = BucketUri::parse("gs://my-bucket/work/run_1").expect("Failed to parse");
        assert_eq!(uri.scheme(), "gs");
        assert_eq!(uri.bucket(), "my-bucket");
        assert_eq!(uri.path(), "work/run_1");
        assert_eq!(
            uri.object_path("staged.parquet").as_ref(),
            "work/run_1/staged.parquet"
        );
    }

    #[test]
    fn test_parse_bucket_root() {
        let uri = BucketUri::parse("gs://my-bucket").expect("Failed to parse");
        assert_eq!(uri.path(), "");
        assert!(uri.prefix().is_none());
        assert_eq!(uri.object_path("a.parquet").as_ref(), "a.parquet");
    }

    #[test]
    fn test_parse_decodes_reserved_characters() {
        let uri = BucketUri::parse("gs://bucket/my dir/run%231").expect("Failed to parse");
        assert_eq!(uri.path(), "my dir/run#1");
        assert_eq!(
            uri.object_path("s.parquet").as_ref(),
            "my dir/run#1/s.parquet"
        );
    }

    #[test]
    fn test_parse_rejects_missing_bucket() {
        assert!(BucketUri::parse("not a uri").is_err());
        assert!(BucketUri::parse("file:///tmp/data").is_err());
    }

    #[test]
    fn test_join_file_is_plain_concatenation() {
        let uri = BucketUri::parse("gs://bucket/work").expect("Failed to parse");
        assert_eq!(uri.join_file("staged.parquet"), "gs://bucket/work/staged.parquet");

        let trailing = BucketUri::parse("gs://bucket/work/").expect("Failed to parse");
        assert_eq!(
            trailing.join_file("staged.parquet"),
            "gs://bucket/work/staged.parquet"
        );
    }

    #[test]
    fn test_memory_stores_are_cached_per_bucket() {
        let stores = BucketStores::in_memory();
        let a = stores.store("a").expect("Failed to create store");
        let a_again = stores.store("a").expect("Failed to create store");
        let b = stores.store("b").expect("Failed to create store");
        assert!(Arc::ptr_eq(&a, &a_again));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_upload_returns_staged_uri() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let file = write_file(&dir, "staged.parquet", b"PAR1");

        let stores = Arc::new(BucketStores::in_memory());
        let stager = ObjectStoreStager::new(stores.clone());
        let staged = stager
            .upload(&file, "gs://bucket/work")
            .await
            .expect("Failed to upload");
        assert_eq!(staged, "gs://bucket/work/staged.parquet");

        let store = stores.store("bucket").expect("Failed to get store");
        let bytes = store
            .get(&ObjectPath::from("work/staged.parquet"))
            .await
            .expect("Object missing")
            .bytes()
            .await
            .expect("Failed to read object");
        assert_eq!(bytes.as_ref(), b"PAR1");

        let stats = stager.stats();
        assert_eq!(stats.upload_count, 1);
        assert_eq!(stats.uploaded_bytes, 4);
    }

    #[tokio::test]
    async fn test_upload_missing_local_file_fails() {
        let stager = ObjectStoreStager::new(Arc::new(BucketStores::in_memory()));
        let result = stager
            .upload(Path::new("/definitely/not/here.parquet"), "gs://bucket/work")
            .await;
        assert!(matches!(result, Err(CommonError::IoError { .. })));
    }

    #[tokio::test]
    async fn test_delete_prefix_removes_only_matching_objects() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let a = write_file(&dir, "a.parquet", b"a");
        let b = write_file(&dir, "b.parquet", b"b");

        let stores = Arc::new(BucketStores::in_memory());
        let stager = ObjectStoreStager::new(stores.clone());
        stager.upload(&a, "gs://bucket/work").await.expect("upload");
        stager.upload(&b, "gs://bucket/work").await.expect("upload");
        stager.upload(&a, "gs://bucket/keep").await.expect("upload");

        let removed = stager
            .delete_prefix("gs://bucket/work")
            .await
            .expect("Failed to delete prefix");
        assert_eq!(removed, 2);

        let store = stores.store("bucket").expect("store");
        let remaining: Vec<_> = store
            .list(None)
            .map(|meta| meta.expect("list").location.to_string())
            .collect()
            .await;
        assert_eq!(remaining, vec!["keep/a.parquet".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_empty_prefix_is_idempotent() {
        let stager = ObjectStoreStager::new(Arc::new(BucketStores::in_memory()));

        let first = stager
            .delete_prefix("gs://bucket/never-written")
            .await
            .expect("delete of missing prefix should succeed");
        let second = stager
            .delete_prefix("gs://bucket/never-written")
            .await
            .expect("repeated delete should succeed");
        assert_eq!(first, 0);
        assert_eq!(second, 0);
        assert_eq!(stager.stats(), StagingStats::default());
    }

    #[tokio::test]
    async fn test_local_filesystem_backend() {
        let root = TempDir::new().expect("Failed to create temp directory");
        let scratch = TempDir::new().expect("Failed to create temp directory");
        let file = write_file(&scratch, "rows.parquet", b"rows");

        let stores = Arc::new(BucketStores::new(StorageBackend::LocalFileSystem {
            root_path: root.path().to_string_lossy().to_string(),
        }));
        let stager = ObjectStoreStager::new(stores);
        let staged = stager
            .upload(&file, "gs://landing/2024")
            .await
            .expect("Failed to upload");
        assert_eq!(staged, "gs://landing/2024/rows.parquet");
        assert!(root.path().join("landing/2024/rows.parquet").exists());

        let removed = stager
            .delete_prefix("gs://landing/2024")
            .await
            .expect("Failed to delete");
        assert_eq!(removed, 1);
        assert!(!root.path().join("landing/2024/rows.parquet").exists());
    }

    #[tokio::test]
    async fn test_upload_key_matches_returned_uri_with_space() {
        let root = TempDir::new().expect("Failed to create temp directory");
        let scratch = TempDir::new().expect("Failed to create temp directory");
        let file = write_file(&scratch, "s.parquet", b"PAR1");

        let stores = Arc::new(BucketStores::new(StorageBackend::LocalFileSystem {
            root_path: root.path().to_string_lossy().to_string(),
        }));
        let stager = ObjectStoreStager::new(stores.clone());
        let staged = stager
            .upload(&file, "gs://b/my dir")
            .await
            .expect("Failed to upload");
        assert_eq!(staged, "gs://b/my dir/s.parquet");
        assert!(root.path().join("b").join("my dir").join("s.parquet").exists());

        let staged_uri = BucketUri::parse(&staged).expect("Failed to parse staged uri");
        let bytes = stores
            .store("b")
            .expect("store")
            .get(staged_uri.key())
            .await
            .expect("Staged object missing")
            .bytes()
            .await
            .expect("Failed to read object");
        assert_eq!(bytes.as_ref(), b"PAR1");

        let removed = stager
            .delete_prefix("gs://b/my dir")
            .await
            .expect("Failed to delete");
        assert_eq!(removed, 1);
    }
}
