use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::models::StoredObject;
use crate::services::sas::{GrantError, SasSigner};
use crate::services::timeout::UpstreamTimeout;

/// Upload body as handed to the store. Errors come from the client side.
pub type ByteStream<'a> = BoxStream<'a, Result<Bytes, StoreError>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Upstream timeout: {0}")]
    Timeout(String),

    /// The upload body could not be read from the client.
    #[error("{0}")]
    Body(String),

    #[error("Object store error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl UpstreamTimeout for StoreError {
    fn upstream_timeout(upstream: &'static str, limit: Duration) -> Self {
        StoreError::Timeout(format!("{} did not respond within {:?}", upstream, limit))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => AppError::NotFound(anyhow::anyhow!("File not found")),
            StoreError::Timeout(what) => AppError::GatewayTimeout(what),
            StoreError::Body(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            StoreError::Backend(e) => AppError::InternalError(e),
        }
    }
}

/// One page of a container listing.
#[derive(Debug, Default)]
pub struct ListSegment {
    pub items: Vec<StoredObject>,
    /// Opaque continuation cursor; `None` on the last page.
    pub next_marker: Option<String>,
}

/// Backing blob container.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_segment(&self, marker: Option<&str>) -> Result<ListSegment, StoreError>;

    /// Streams `body` into `name`, replacing any existing object. Nothing
    /// becomes visible unless the whole body was written. Returns the byte
    /// count stored.
    async fn put_stream<'a>(
        &self,
        name: &str,
        content_type: Option<&str>,
        body: ByteStream<'a>,
    ) -> Result<u64, StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// In-process container used by tests and local runs without storage.
#[derive(Clone)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<String, MemoryObject>>>,
    write_attempts: Arc<AtomicUsize>,
    page_size: usize,
    latency: Option<Duration>,
}

#[derive(Clone)]
struct MemoryObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            write_attempts: Arc::new(AtomicUsize::new(0)),
            page_size: 5000,
            latency: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Delays every call, for exercising upstream timeouts.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of `put_stream` calls that reached the store.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Stores an object directly, bypassing name checks.
    pub fn insert(&self, name: &str, data: impl Into<Bytes>) -> Result<(), StoreError> {
        self.lock()?.insert(
            name.to_string(),
            MemoryObject {
                data: data.into(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.lock()?.get(name).map(|o| o.data.clone()))
    }

    pub fn names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    /// Serves a signed read URL the way the real service would.
    pub fn fetch_signed(
        &self,
        signer: &SasSigner,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Bytes>, GrantError> {
        let url = Url::parse(url).map_err(|e| GrantError::Malformed(e.to_string()))?;
        let name = signer.verify(&url, 'r', now)?;
        self.get(&name).map_err(|e| GrantError::Signing(e.into()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, MemoryObject>>, StoreError> {
        self.objects
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("Memory store mutex poisoned: {}", e)))
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_segment(&self, marker: Option<&str>) -> Result<ListSegment, StoreError> {
        self.simulate_latency().await;

        let objects = self.lock()?;
        let lower = match marker {
            Some(marker) => Bound::Excluded(marker.to_string()),
            None => Bound::Unbounded,
        };
        let mut remaining = objects.range((lower, Bound::Unbounded));

        let items: Vec<StoredObject> = remaining
            .by_ref()
            .take(self.page_size)
            .map(|(name, object)| StoredObject {
                name: name.clone(),
                size: object.data.len() as u64,
                last_modified: object.last_modified,
            })
            .collect();

        let next_marker = match remaining.next() {
            Some(_) => items.last().map(|item| item.name.clone()),
            None => None,
        };

        Ok(ListSegment { items, next_marker })
    }

    async fn put_stream<'a>(
        &self,
        name: &str,
        _content_type: Option<&str>,
        mut body: ByteStream<'a>,
    ) -> Result<u64, StoreError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }

        let size = buffer.len() as u64;
        self.insert(name, buffer.freeze())?;
        Ok(size)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.simulate_latency().await;

        match self.lock()?.remove(name) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn body(chunks: Vec<Result<Bytes, StoreError>>) -> ByteStream<'static> {
        stream::iter(chunks).boxed()
    }

    #[tokio::test]
    async fn test_memory_listing_pages_by_marker() {
        let store = MemoryObjectStore::new().with_page_size(2);
        for name in ["a", "b", "c", "d", "e"] {
            store.insert(name, "x").unwrap();
        }

        let first = store.list_segment(None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_marker.as_deref(), Some("b"));

        let second = store.list_segment(Some("b")).await.unwrap();
        assert_eq!(second.items[0].name, "c");

        let last = store.list_segment(Some("d")).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(last.next_marker.is_none());
    }

    #[tokio::test]
    async fn test_failed_body_is_not_stored() {
        let store = MemoryObjectStore::new();
        let result = store
            .put_stream(
                "partial.bin",
                None,
                body(vec![
                    Ok(Bytes::from_static(b"first")),
                    Err(StoreError::Body("client went away".to_string())),
                ]),
            )
            .await;

        assert!(matches!(result, Err(StoreError::Body(_))));
        assert!(store.get("partial.bin").unwrap().is_none());
        assert_eq!(store.write_attempts(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_object() {
        let store = MemoryObjectStore::new();
        assert!(matches!(
            store.delete("ghost.txt").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
