//! Opaque put/get of named byte blobs in one bucket.
//!
//! Scripts and weight files travel through here and never through the bus
//! or the metadata store; only their [`BlobKey`]s do.

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::config::BlobSettings;
use crate::error::{DispatchError, Result};
use crate::types::BlobKey;

/// Hex SHA-256 of a blob body.
pub fn checksum(body: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &BlobKey, body: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>>;

    /// Upload the contents of a local file.
    async fn put_file(&self, key: &BlobKey, path: &Path) -> Result<()> {
        let body = tokio::fs::read(path).await?;
        self.put(key, body).await
    }
}

/// [`BlobStore`] over any `object_store` backend.
pub struct ObjectBlobStore {
    store: Arc<dyn ObjectStore>,
    /// Bucket namespace for backends that have no native bucket.
    prefix: Option<String>,
}

impl ObjectBlobStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Option<String>) -> Self {
        Self { store, prefix }
    }

    pub fn in_memory(bucket: &str) -> Self {
        Self::new(Arc::new(InMemory::new()), Some(bucket.to_string()))
    }

    pub fn local(root: &Path, bucket: &str) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let fs = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::new(Arc::new(fs), Some(bucket.to_string())))
    }

    pub fn from_settings(settings: &BlobSettings) -> Result<Self> {
        let endpoint = settings.endpoint.trim();
        if endpoint == "memory" {
            return Ok(Self::in_memory(&settings.bucket));
        }
        if let Some(root) = endpoint.strip_prefix("file://") {
            return Self::local(Path::new(root), &settings.bucket);
        }

        let endpoint = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("https://{}", endpoint)
        };

        let mut builder = AmazonS3Builder::new()
            .with_endpoint(&endpoint)
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region)
            .with_allow_http(endpoint.starts_with("http://"));
        if let Some(key) = &settings.access_key {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &settings.secret_key {
            builder = builder.with_secret_access_key(secret);
        }

        Ok(Self::new(Arc::new(builder.build()?), None))
    }

    fn object_path(&self, key: &BlobKey) -> ObjectPath {
        match &self.prefix {
            Some(prefix) => ObjectPath::from(format!("{}/{}", prefix, key)),
            None => ObjectPath::from(key.as_str()),
        }
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn put(&self, key: &BlobKey, body: Vec<u8>) -> Result<()> {
        let path = self.object_path(key);
        debug!(key = %key, bytes = body.len(), "Uploading blob");
        self.store.put(&path, PutPayload::from(body)).await?;
        Ok(())
    }

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>> {
        let path = self.object_path(key);
        match self.store.get(&path).await {
            Ok(res) => Ok(res.bytes().await?.to_vec()),
            Err(object_store::Error::NotFound { .. }) => {
                Err(DispatchError::not_found("blob", key.as_str()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
