// ABOUTME: Object storage interface used for landing, archiving and failing batches
// ABOUTME: Backed by object_store with one store per bucket (GCS, local filesystem or memory)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::paths::BlobLocation;
use crate::config::StorageConfig;

/// Object storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    /// Google Cloud Storage
    Gcs,
    /// Local filesystem, one directory per bucket
    Local,
    /// In-process memory (tests and dry runs)
    Memory,
}

impl StorageProvider {
    /// URI scheme used when reporting object locations.
    pub fn scheme(&self) -> &'static str {
        match self {
            StorageProvider::Gcs => "gs",
            StorageProvider::Local => "file",
            StorageProvider::Memory => "memory",
        }
    }
}

/// Bucket-addressed object storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// URI scheme of locations produced by this store.
    fn scheme(&self) -> &str;

    /// Write `bytes` at `location` and return its URI.
    async fn upload(&self, location: &BlobLocation, bytes: Bytes) -> Result<String>;

    async fn download(&self, location: &BlobLocation) -> Result<Bytes>;

    /// Copy `src` to `dst` (buckets may differ) and return the destination URI.
    async fn copy(&self, src: &BlobLocation, dst: &BlobLocation) -> Result<String>;

    /// Delete `location`. Returns false when there was nothing to delete.
    async fn delete(&self, location: &BlobLocation) -> Result<bool>;

    async fn exists(&self, location: &BlobLocation) -> Result<bool>;

    fn uri(&self, location: &BlobLocation) -> String {
        location.uri(self.scheme())
    }
}

/// `object_store`-backed blob store, opening one store per bucket on demand.
pub struct ObjectStoreBlobs {
    provider: StorageProvider,
    local_root: Option<PathBuf>,
    service_account_path: Option<PathBuf>,
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl ObjectStoreBlobs {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            provider: config.provider,
            local_root: config.local_root.clone(),
            service_account_path: config.service_account_path.clone(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// In-memory store with no configuration.
    pub fn in_memory() -> Self {
        Self {
            provider: StorageProvider::Memory,
            local_root: None,
            service_account_path: None,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Local filesystem store rooted at `root`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            provider: StorageProvider::Local,
            local_root: Some(root.into()),
            service_account_path: None,
            stores: Mutex::new(HashMap::new()),
        }
    }

    fn store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| anyhow::anyhow!("Object store registry lock poisoned"))?;
        if let Some(store) = stores.get(bucket) {
            return Ok(store.clone());
        }
        let store = self.open(bucket)?;
        stores.insert(bucket.to_string(), store.clone());
        Ok(store)
    }

    fn open(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        match self.provider {
            StorageProvider::Gcs => {
                use object_store::gcp::GoogleCloudStorageBuilder;

                let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
                if let Some(path) = &self.service_account_path {
                    builder = builder.with_service_account_path(path.to_string_lossy());
                }
                let store = builder
                    .build()
                    .with_context(|| format!("Failed to open GCS bucket '{}'", bucket))?;
                Ok(Arc::new(store))
            }
            StorageProvider::Local => {
                use object_store::local::LocalFileSystem;

                let Some(root) = &self.local_root else {
                    bail!("Local storage provider requires a root directory");
                };
                let dir = root.join(bucket);
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create bucket directory {:?}", dir))?;
                let store = LocalFileSystem::new_with_prefix(&dir)
                    .with_context(|| format!("Failed to open local bucket {:?}", dir))?;
                Ok(Arc::new(store))
            }
            StorageProvider::Memory => Ok(Arc::new(object_store::memory::InMemory::new())),
        }
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobs {
    fn scheme(&self) -> &str {
        self.provider.scheme()
    }

    async fn upload(&self, location: &BlobLocation, bytes: Bytes) -> Result<String> {
        let store = self.store(&location.bucket)?;
        let size = bytes.len();
        store
            .put(&ObjectPath::from(location.path.as_str()), PutPayload::from(bytes))
            .await
            .with_context(|| format!("Failed to upload {}", self.uri(location)))?;
        tracing::debug!("Uploaded {} bytes to {}", size, self.uri(location));
        Ok(self.uri(location))
    }

    async fn download(&self, location: &BlobLocation) -> Result<Bytes> {
        let store = self.store(&location.bucket)?;
        let result = store
            .get(&ObjectPath::from(location.path.as_str()))
            .await
            .with_context(|| format!("Failed to download {}", self.uri(location)))?;
        let bytes = result
            .bytes()
            .await
            .with_context(|| format!("Failed to read {}", self.uri(location)))?;
        Ok(bytes)
    }

    async fn copy(&self, src: &BlobLocation, dst: &BlobLocation) -> Result<String> {
        let src_path = ObjectPath::from(src.path.as_str());
        let dst_path = ObjectPath::from(dst.path.as_str());
        let context = || format!("Failed to copy {} to {}", self.uri(src), self.uri(dst));

        if src.bucket == dst.bucket {
            let store = self.store(&src.bucket)?;
            store.copy(&src_path, &dst_path).await.with_context(context)?;
        } else {
            let from = self.store(&src.bucket)?;
            let to = self.store(&dst.bucket)?;
            let bytes = from
                .get(&src_path)
                .await
                .with_context(context)?
                .bytes()
                .await
                .with_context(context)?;
            to.put(&dst_path, PutPayload::from(bytes))
                .await
                .with_context(context)?;
        }
        Ok(self.uri(dst))
    }

    async fn delete(&self, location: &BlobLocation) -> Result<bool> {
        if !self.exists(location).await? {
            return Ok(false);
        }
        let store = self.store(&location.bucket)?;
        store
            .delete(&ObjectPath::from(location.path.as_str()))
            .await
            .with_context(|| format!("Failed to delete {}", self.uri(location)))?;
        Ok(true)
    }

    async fn exists(&self, location: &BlobLocation) -> Result<bool> {
        let store = self.store(&location.bucket)?;
        match store.head(&ObjectPath::from(location.path.as_str())).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to stat {}", self.uri(location)))
            }
        }
    }
}
