//! Object store facade for blob bytes.
//!
//! Wraps the `object_store` crate behind a small put/get/delete surface keyed
//! by the storage keys minted in `blob-db`. The backend (S3, MinIO, local
//! filesystem, in-memory) is chosen from configuration; S3 credentials are
//! read from the standard AWS environment variables.

use std::{path::PathBuf, str::FromStr, sync::Arc};

use bytes::Bytes;
use object_store::{
    aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, path::Path as ObjectPath,
    ObjectStore, PutPayload,
};
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by the object store facade.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store configuration error: {0}")]
    Config(String),
    #[error("object '{0}' not found")]
    NotFound(String),
    #[error("object store backend error: {0}")]
    Backend(#[from] object_store::Error),
}

/// Supported storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Amazon S3 (region + credentials from the environment).
    S3,
    /// Any S3-compatible endpoint such as MinIO.
    Minio,
    /// Local filesystem rooted at `local_root`.
    Local,
    /// In-process memory store, for tests.
    Memory,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreBackend::S3 => "s3",
            StoreBackend::Minio => "minio",
            StoreBackend::Local => "local",
            StoreBackend::Memory => "memory",
        }
    }
}

impl FromStr for StoreBackend {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, StoreError> {
        match s {
            "s3" => Ok(StoreBackend::S3),
            "minio" => Ok(StoreBackend::Minio),
            "local" => Ok(StoreBackend::Local),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(StoreError::Config(format!(
                "unsupported backend '{}'",
                other
            ))),
        }
    }
}

/// Connection settings for the object store.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub backend: StoreBackend,
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub use_ssl: bool,
    pub local_root: Option<PathBuf>,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::S3,
            bucket: "blobs".to_string(),
            region: None,
            endpoint: None,
            use_ssl: true,
            local_root: None,
        }
    }
}

/// Byte storage for blobs, addressed by storage key within a single bucket.
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<dyn ObjectStore>,
}

impl BlobStore {
    /// Builds a store from configuration.
    pub fn from_config(config: &ObjectStoreConfig) -> Result<Self, StoreError> {
        let inner: Arc<dyn ObjectStore> = match config.backend {
            StoreBackend::S3 => {
                let mut builder =
                    AmazonS3Builder::from_env().with_bucket_name(&config.bucket);
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                Arc::new(builder.build()?)
            }
            StoreBackend::Minio => {
                let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                    StoreError::Config("endpoint is required for the minio backend".into())
                })?;
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(&config.bucket)
                    .with_endpoint(endpoint)
                    .with_allow_http(!config.use_ssl);
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                Arc::new(builder.build()?)
            }
            StoreBackend::Local => {
                let root = config.local_root.as_deref().ok_or_else(|| {
                    StoreError::Config("local_root is required for the local backend".into())
                })?;
                Arc::new(
                    LocalFileSystem::new_with_prefix(root)
                        .map_err(|err| StoreError::Config(err.to_string()))?,
                )
            }
            StoreBackend::Memory => Arc::new(InMemory::new()),
        };

        Ok(Self { inner })
    }

    /// An in-process store that forgets everything on drop. Used in tests.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(InMemory::new()),
        }
    }

    /// Wraps an existing `object_store` implementation.
    pub fn with_object_store(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    /// Writes the full object under the given storage key, replacing any
    /// previous bytes at that key.
    pub async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let location = ObjectPath::from(key);
        let size = data.len();
        self.inner.put(&location, PutPayload::from(data)).await?;
        debug!(key, size, "object stored");
        Ok(())
    }

    /// Reads the full object stored under the given key.
    pub async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let location = ObjectPath::from(key);
        let result = self.inner.get(&location).await.map_err(|err| match err {
            object_store::Error::NotFound { .. } => StoreError::NotFound(key.to_string()),
            other => StoreError::Backend(other),
        })?;
        Ok(result.bytes().await?)
    }

    /// Removes the object stored under the given key. Removing a key that is
    /// already gone is not an error, matching S3 delete semantics.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let location = ObjectPath::from(key);
        match self.inner.delete(&location).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(StoreError::Backend(err)),
        }
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore").finish_non_exhaustive()
    }
}
