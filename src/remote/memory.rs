use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::object_store::{META_BLOCK_VERSION, ObjectMetadata, ObjectStore, key_not_found};
use crate::backend::slice_payload;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub payload: Bytes,
    pub metadata: ObjectMetadata,
}

impl StoredObject {
    /// Block version recorded in the upload metadata.
    pub fn version(&self) -> Option<u32> {
        self.metadata
            .iter()
            .find(|(name, _)| *name == META_BLOCK_VERSION)
            .and_then(|(_, value)| value.parse().ok())
    }
}

/// Completed upload, in completion order.
#[derive(Debug, Clone)]
pub struct Upload {
    pub key: String,
    pub payload: Bytes,
    pub version: Option<u32>,
}

/// In-process bucket.
///
/// Records every completed upload and the highest number of uploads that
/// were ever in flight for one key at the same time. Uploads can be slowed
/// down or made to fail.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, StoredObject>,
    uploads: Mutex<Vec<Upload>>,
    in_flight: DashMap<String, usize>,
    max_in_flight: AtomicUsize,
    put_latency: Mutex<Duration>,
    fail_puts: AtomicBool,
}

struct InFlight<'a> {
    store: &'a MemoryObjectStore,
    key: &'a str,
}

impl<'a> InFlight<'a> {
    fn enter(store: &'a MemoryObjectStore, key: &'a str) -> Self {
        let mut count = store.in_flight.entry(key.to_owned()).or_insert(0);
        *count += 1;
        store.max_in_flight.fetch_max(*count, Ordering::SeqCst);
        InFlight { store, key }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.store.in_flight.get_mut(self.key) {
            *count -= 1;
        }
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_put_latency(&self, latency: Duration) {
        *self.put_latency.lock() = latency;
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Store an object directly, bypassing upload accounting.
    pub fn insert(&self, key: impl Into<String>, payload: Bytes) {
        self.objects.insert(
            key.into(),
            StoredObject {
                payload,
                metadata: Vec::new(),
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.get(key).map(|o| o.clone())
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().clone()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().len()
    }

    /// Most uploads ever observed running concurrently for a single key.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self, key: &str) -> usize {
        self.in_flight.get(key).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn describe(&self) -> String {
        "memory://".to_owned()
    }

    async fn put(&self, key: &str, payload: Bytes, metadata: &ObjectMetadata) -> Result<()> {
        let _in_flight = InFlight::enter(self, key);

        let latency = *self.put_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(Error::Remote(format!("injected upload failure for {key}")));
        }

        let object = StoredObject {
            payload: payload.clone(),
            metadata: metadata.clone(),
        };
        let version = object.version();
        self.objects.insert(key.to_owned(), object);
        self.uploads.lock().push(Upload {
            key: key.to_owned(),
            payload,
            version,
        });
        Ok(())
    }

    async fn get(&self, key: &str, offset: u64, length: u64) -> Result<Bytes> {
        let object = self.objects.get(key).ok_or_else(|| key_not_found(key))?;
        slice_payload(&object.payload, offset, length)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| key_not_found(key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockId, Version};
    use crate::remote::object_store::block_metadata;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryObjectStore::new();
        let id = BlockId::parse("abcd0001").unwrap();
        store
            .put("k", Bytes::from_static(b"hello"), &block_metadata(&id, Version::new(3)))
            .await
            .unwrap();

        assert_eq!(&store.get("k", 1, 3).await.unwrap()[..], b"ell");
        assert_eq!(store.object("k").unwrap().version(), Some(3));
        assert_eq!(store.uploads()[0].version, Some(3));
        assert_eq!(store.list("").await.unwrap(), vec!["k".to_owned()]);

        store.delete("k").await.unwrap();
        assert!(store.get("k", 0, 0).await.unwrap_err().is_not_found());
        assert!(store.delete("k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn injected_failure() {
        let store = MemoryObjectStore::new();
        store.set_fail_puts(true);
        assert!(store.put("k", Bytes::new(), &Vec::new()).await.is_err());
        assert_eq!(store.upload_count(), 0);
        assert_eq!(store.in_flight("k"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_concurrent_uploads_per_key() {
        let store = std::sync::Arc::new(MemoryObjectStore::new());
        store.set_put_latency(Duration::from_millis(100));

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.put("k", Bytes::new(), &Vec::new()).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.put("k", Bytes::new(), &Vec::new()).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(store.max_in_flight(), 2);
        assert_eq!(store.in_flight("k"), 0);
    }
}
