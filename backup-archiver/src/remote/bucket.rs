//! [`RemoteStore`] backed by the `object_store` crate.

use super::{RemoteError, RemoteObject, RemoteStore};
use crate::config::BackendConfig;
use bytes::Bytes;
use futures_util::TryStreamExt;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutPayload};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// A bucket (or local directory) holding the uploaded backups.
#[derive(Debug, Clone)]
pub struct BucketStore {
    inner: Arc<dyn ObjectStore>,
}

impl BucketStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    /// Volatile store, used for dry runs and tests.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// Build the backend described by the configuration. Cloud credentials
    /// are taken from the environment.
    pub fn from_config(config: &BackendConfig) -> Result<Self, RemoteError> {
        let inner: Arc<dyn ObjectStore> = match config {
            BackendConfig::Local { path } => {
                std::fs::create_dir_all(path)?;
                Arc::new(LocalFileSystem::new_with_prefix(path)?)
            }
            BackendConfig::S3 {
                bucket,
                region,
                endpoint,
            } => Arc::new(s3_builder(bucket, region.as_deref(), endpoint.as_deref()).build()?),
            BackendConfig::Gcs { bucket } => Arc::new(
                GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket)
                    .build()?,
            ),
            BackendConfig::Memory => Arc::new(InMemory::new()),
        };
        Ok(Self::new(inner))
    }
}

/// S3 only honours `PutMode::Create`, which the lease relies on, with
/// conditional puts switched on.
fn s3_builder(bucket: &str, region: Option<&str>, endpoint: Option<&str>) -> AmazonS3Builder {
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_conditional_put(S3ConditionalPut::ETagMatch);
    if let Some(region) = region {
        builder = builder.with_region(region);
    }
    if let Some(endpoint) = endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    builder
}

fn map_error(key: &str, err: object_store::Error) -> RemoteError {
    match err {
        object_store::Error::NotFound { .. } => RemoteError::NotFound(key.to_string()),
        object_store::Error::AlreadyExists { .. } => RemoteError::AlreadyExists(key.to_string()),
        other => RemoteError::Backend(other),
    }
}

impl RemoteStore for BucketStore {
    async fn list(&self) -> Result<Vec<RemoteObject>, RemoteError> {
        let metas: Vec<_> = self.inner.list(None).try_collect().await?;
        Ok(metas
            .into_iter()
            .map(|meta| RemoteObject {
                key: meta.location.to_string(),
                size: meta.size as u64,
            })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Bytes, RemoteError> {
        let location = ObjectPath::from(key);
        let result = self.inner.get(&location).await.map_err(|e| map_error(key, e))?;
        result.bytes().await.map_err(|e| map_error(key, e))
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64, RemoteError> {
        let location = ObjectPath::from(key);
        let result = self.inner.get(&location).await.map_err(|e| map_error(key, e))?;
        let mut stream = result.into_stream();

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.try_next().await.map_err(|e| map_error(key, e))? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), RemoteError> {
        let location = ObjectPath::from(key);
        self.inner
            .put(&location, PutPayload::from(data))
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<(), RemoteError> {
        let location = ObjectPath::from(key);
        self.inner
            .put_opts(&location, PutPayload::from(data), PutMode::Create.into())
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        let location = ObjectPath::from(key);
        match self.inner.delete(&location).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_error(key, e)),
        }
    }
}
