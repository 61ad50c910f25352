//! Remote object store access.
//!
//! The archiver only needs list/get/put/delete over flat `backup/file` keys.
//! [`RemoteStore`] is the seam; [`bucket::BucketStore`] implements it on top of
//! the `object_store` crate.

pub mod bucket;
pub mod cleanup;

use backon::{ConstantBuilder, Retryable as _};
use bytes::Bytes;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub use bucket::BucketStore;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Object store error: {0}")]
    Backend(#[from] object_store::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Whether retrying the same request can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Backend(_) | RemoteError::Io(_))
    }
}

/// One object as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
}

/// List/get/put/delete primitives of the object store holding the backups.
pub trait RemoteStore: Send + Sync {
    /// Every object in the bucket.
    fn list(&self) -> impl Future<Output = Result<Vec<RemoteObject>, RemoteError>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Bytes, RemoteError>> + Send;

    /// Stream an object into `dest`, returning the number of bytes written.
    fn download(
        &self,
        key: &str,
        dest: &Path,
    ) -> impl Future<Output = Result<u64, RemoteError>> + Send;

    fn put(&self, key: &str, data: Bytes) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Create `key` only if it does not exist yet; fails with
    /// [`RemoteError::AlreadyExists`] otherwise.
    fn put_if_absent(
        &self,
        key: &str,
        data: Bytes,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Delete `key`. Deleting a missing object is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// Retry budget for remote reads.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times(self.attempts.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(1),
        }
    }
}

/// Fetch a whole object, retrying transient failures. The last error is
/// returned once the attempts are exhausted.
pub async fn get_with_retry<S: RemoteStore>(
    store: &S,
    key: &str,
    policy: RetryPolicy,
) -> Result<Bytes, RemoteError> {
    (|| store.get(key))
        .retry(policy.backoff())
        .when(RemoteError::is_transient)
        .notify(|err: &RemoteError, dur: Duration| {
            warn!("Fetching {} failed: {}, retrying in {:?}", key, err, dur);
        })
        .await
}

/// Download an object into `dest`, retrying transient failures.
pub async fn download_with_retry<S: RemoteStore>(
    store: &S,
    key: &str,
    dest: &Path,
    policy: RetryPolicy,
) -> Result<u64, RemoteError> {
    (|| store.download(key, dest))
        .retry(policy.backoff())
        .when(RemoteError::is_transient)
        .notify(|err: &RemoteError, dur: Duration| {
            warn!("Downloading {} failed: {}, retrying in {:?}", key, err, dur);
        })
        .await
}

#[cfg(test)]
pub(crate) mod testing {
    //! Store wrappers that misbehave in controlled ways.

    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fails the first `failures` downloads/gets with a transient error.
    pub struct FlakyStore<S> {
        pub inner: S,
        pub failures: AtomicUsize,
    }

    impl<S> FlakyStore<S> {
        pub fn new(inner: S, failures: usize) -> Self {
            Self {
                inner,
                failures: AtomicUsize::new(failures),
            }
        }

        fn trip(&self) -> Result<(), RemoteError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(RemoteError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )));
            }
            Ok(())
        }
    }

    impl<S: RemoteStore> RemoteStore for FlakyStore<S> {
        async fn list(&self) -> Result<Vec<RemoteObject>, RemoteError> {
            self.inner.list().await
        }

        async fn get(&self, key: &str) -> Result<Bytes, RemoteError> {
            self.trip()?;
            self.inner.get(key).await
        }

        async fn download(&self, key: &str, dest: &Path) -> Result<u64, RemoteError> {
            self.trip()?;
            self.inner.download(key, dest).await
        }

        async fn put(&self, key: &str, data: Bytes) -> Result<(), RemoteError> {
            self.inner.put(key, data).await
        }

        async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<(), RemoteError> {
            self.inner.put_if_absent(key, data).await
        }

        async fn delete(&self, key: &str) -> Result<(), RemoteError> {
            self.inner.delete(key).await
        }
    }

    /// Acknowledges the first delete of every key without removing it, like a
    /// store whose listings lag behind deletions.
    pub struct LaggyStore<S> {
        pub inner: S,
        pub seen: Mutex<HashSet<String>>,
        pub delete_calls: AtomicUsize,
    }

    impl<S> LaggyStore<S> {
        pub fn new(inner: S) -> Self {
            Self {
                inner,
                seen: Mutex::new(HashSet::new()),
                delete_calls: AtomicUsize::new(0),
            }
        }
    }

    impl<S: RemoteStore> RemoteStore for LaggyStore<S> {
        async fn list(&self) -> Result<Vec<RemoteObject>, RemoteError> {
            self.inner.list().await
        }

        async fn get(&self, key: &str) -> Result<Bytes, RemoteError> {
            self.inner.get(key).await
        }

        async fn download(&self, key: &str, dest: &Path) -> Result<u64, RemoteError> {
            self.inner.download(key, dest).await
        }

        async fn put(&self, key: &str, data: Bytes) -> Result<(), RemoteError> {
            self.inner.put(key, data).await
        }

        async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<(), RemoteError> {
            self.inner.put_if_absent(key, data).await
        }

        async fn delete(&self, key: &str) -> Result<(), RemoteError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            let first_time = self
                .seen
                .lock()
                .map(|mut seen| seen.insert(key.to_string()))
                .unwrap_or(false);
            if first_time {
                return Ok(());
            }
            self.inner.delete(key).await
        }
    }
}
