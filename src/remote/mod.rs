//! Block store on top of a remote object-storage bucket.
//!
//! Writes go through the [`WriteCoalescer`]; reads fall back from the bucket
//! to pending writes (on this node, then on the node named by the read's
//! location) and finally retry the bucket once.
mod coalesce;
mod key_lock;
#[cfg(test)]
mod memory;
mod object_store;
mod peer;
mod reaper;
mod s3;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use itertools::Itertools;
use tracing::{debug, instrument, trace};

pub use coalesce::{CoalesceStats, PendingWrite, WriteCoalescer, WriteStatus};
pub use key_lock::KeyLocks;
#[cfg(test)]
pub(crate) use memory::MemoryObjectStore;
pub use object_store::{
    META_BLOCK_ID, META_BLOCK_VERSION, ObjectMetadata, ObjectStore, block_id_from_key, block_key,
    block_metadata, blocks_prefix, key_not_found,
};
pub use peer::{HttpPeerReader, NODE_API_HEADER, PeerReader, peer_block_url};
pub use s3::{S3ObjectStore, S3Settings};

use crate::backend::{BlockStore, PROBE_PAYLOAD, probe_block_id, slice_payload};
use crate::config::CoalesceConfig;
use crate::error::{Error, Result};
use crate::model::{BlockId, Version};

/// Run `fut`, failing with [`Error::Timeout`] once `after` has elapsed.
pub(crate) async fn bounded<T>(
    op: &str,
    after: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| Error::Timeout {
            op: op.to_owned(),
            after,
        })?
}

#[derive(Debug)]
struct Peer {
    reader: Arc<dyn PeerReader>,
    local_node: Option<String>,
}

#[derive(Debug)]
pub struct RemoteBackend {
    id: String,
    prefix: String,
    store: Arc<dyn ObjectStore>,
    coalescer: WriteCoalescer,
    peer: Option<Peer>,
    op_timeout: Duration,
}

impl RemoteBackend {
    /// Must be called inside a tokio runtime.
    pub fn new(
        id: impl Into<String>,
        prefix: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        config: CoalesceConfig,
    ) -> RemoteBackend {
        let prefix = prefix.into();
        let op_timeout = config.op_timeout;
        RemoteBackend {
            id: id.into(),
            coalescer: WriteCoalescer::new(store.clone(), prefix.clone(), config),
            prefix,
            store,
            peer: None,
            op_timeout,
        }
    }

    /// Consult `reader` for blocks pending on other nodes. Reads whose
    /// location is `local_node` never leave this node.
    pub fn with_peer(mut self, reader: Arc<dyn PeerReader>, local_node: Option<String>) -> Self {
        self.peer = Some(Peer { reader, local_node });
        self
    }

    pub fn coalescer(&self) -> &WriteCoalescer {
        &self.coalescer
    }

    fn key(&self, block_id: &BlockId) -> String {
        block_key(&self.prefix, block_id)
    }

    /// Serve a range of a write still pending on this node. This is what the
    /// node endpoint behind [`HttpPeerReader`] answers with.
    pub fn read_pending(&self, block_id: &BlockId, offset: u64, length: u64) -> Result<Bytes> {
        let payload = self
            .coalescer
            .pending_payload(block_id)
            .ok_or_else(|| Error::BlockNotFound(block_id.clone()))?;
        slice_payload(&payload, offset, length)
    }

    async fn read_remote(&self, block_id: &BlockId, offset: u64, length: u64) -> Result<Bytes> {
        let key = self.key(block_id);
        bounded("block read", self.op_timeout, self.store.get(&key, offset, length))
            .await
            .map_err(|err| match err {
                err if err.is_not_found() => Error::BlockNotFound(block_id.clone()),
                err => err,
            })
    }

    /// This node's pending writes, then the peer named by `location`.
    async fn read_nearby(
        &self,
        location: &str,
        block_id: &BlockId,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let local_miss = match self.read_pending(block_id, offset, length) {
            Err(err) if err.is_not_found() => err,
            other => return other,
        };
        let Some(peer) = &self.peer else {
            return Err(local_miss);
        };
        if location.is_empty() || peer.local_node.as_deref() == Some(location) {
            return Err(local_miss);
        }
        trace!(%block_id, node = location, "asking peer for pending block");
        peer.reader
            .read_block(location, block_id, offset, length)
            .await
    }
}

#[async_trait]
impl BlockStore for RemoteBackend {
    fn store_type(&self) -> &'static str {
        "s3"
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn write_block(
        &self,
        block_id: &BlockId,
        payload: Bytes,
        version: Version,
    ) -> Result<()> {
        self.coalescer.submit(block_id, payload, version)
    }

    #[instrument(skip_all, fields(block_id = %block_id))]
    async fn read_block(
        &self,
        location: &str,
        block_id: &BlockId,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let missing = match self.read_remote(block_id, offset, length).await {
            Err(err) if err.is_not_found() => err,
            other => return other,
        };
        debug!("block not in remote storage, trying pending writes");

        let nearby = self.read_nearby(location, block_id, offset, length).await;
        let nearby_err = match nearby {
            Ok(data) => return Ok(data),
            Err(err) => err,
        };
        debug!(err = %nearby_err, "pending read missed, retrying remote storage");

        match self.read_remote(block_id, offset, length).await {
            Ok(data) => Ok(data),
            Err(err) if !err.is_not_found() => Err(err),
            Err(_) if !nearby_err.is_not_found() => Err(nearby_err),
            Err(_) => Err(missing),
        }
    }

    async fn delete_block(&self, block_id: &BlockId) -> Result<()> {
        let discarded = self.coalescer.discard(block_id);
        let _guard = self.coalescer.lock_block(block_id).await;
        let key = self.key(block_id);
        match bounded("block delete", self.op_timeout, self.store.delete(&key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() && discarded => Ok(()),
            Err(err) if err.is_not_found() => Err(Error::BlockNotFound(block_id.clone())),
            Err(err) => Err(err),
        }
    }

    async fn block_exists(&self, block_id: &BlockId) -> Result<bool> {
        if self.coalescer.status(block_id).is_some() {
            return Ok(true);
        }
        let key = self.key(block_id);
        bounded("block exists", self.op_timeout, self.store.exists(&key)).await
    }

    async fn list_blocks(&self) -> Result<Vec<BlockId>> {
        let keys = bounded(
            "block list",
            self.op_timeout,
            self.store.list(&blocks_prefix(&self.prefix)),
        )
        .await?;
        let ids = keys
            .iter()
            .filter_map(|key| block_id_from_key(&self.prefix, key))
            .chain(self.coalescer.pending_ids())
            .sorted()
            .dedup()
            .collect();
        Ok(ids)
    }

    fn location(&self, block_id: &BlockId) -> String {
        format!("{}/{}", self.store.describe(), self.key(block_id))
    }

    #[instrument(skip_all, fields(store = %self.store.describe()))]
    async fn verify_access(&self) -> Result<()> {
        bounded("connectivity check", self.op_timeout, self.store.ping()).await?;

        let probe = probe_block_id()?;
        self.write_block(&probe, Bytes::from_static(PROBE_PAYLOAD), Version::FINAL)
            .await?;
        self.coalescer.settle(&probe).await;

        let outcome = async {
            let data = self.read_remote(&probe, 0, 0).await?;
            if data != PROBE_PAYLOAD {
                return Err(Error::Remote("probe block read back different data".into()));
            }
            if !self.list_blocks().await?.contains(&probe) {
                return Err(Error::Remote("probe block missing from listing".into()));
            }
            Ok::<(), Error>(())
        }
        .await;

        let cleanup = self.delete_block(&probe).await;
        outcome?;
        cleanup?;
        if self.block_exists(&probe).await? {
            return Err(Error::Remote("probe block still present after delete".into()));
        }
        debug!("remote access probe passed");
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.coalescer.flush().await;
        Ok(())
    }

    async fn shutdown(&self) {
        self.coalescer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    fn id() -> BlockId {
        BlockId::parse("abcd0001").unwrap()
    }

    fn backend() -> (Arc<MemoryObjectStore>, RemoteBackend) {
        let memory = Arc::new(MemoryObjectStore::new());
        let backend = RemoteBackend::new("remote-1", "tenant", memory.clone(), CoalesceConfig::default());
        (memory, backend)
    }

    #[derive(Debug, Default)]
    struct FakePeer {
        blocks: Mutex<Vec<(String, BlockId, Bytes)>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerReader for FakePeer {
        async fn read_block(
            &self,
            node: &str,
            block_id: &BlockId,
            offset: u64,
            length: u64,
        ) -> Result<Bytes> {
            self.calls.lock().push(node.to_owned());
            let blocks = self.blocks.lock();
            let (_, _, data) = blocks
                .iter()
                .find(|(n, id, _)| n == node && id == block_id)
                .ok_or_else(|| Error::BlockNotFound(block_id.clone()))?;
            slice_payload(data, offset, length)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn committed_block_is_read_from_remote() {
        let (memory, backend) = backend();
        backend
            .write_block(&id(), Bytes::from_static(b"0123456789"), Version::FINAL)
            .await
            .unwrap();
        backend.flush().await.unwrap();

        assert!(memory.object("tenant/blocks/ab/cd/abcd0001").is_some());
        let data = backend.read_block("", &id(), 2, 3).await.unwrap();
        assert_eq!(&data[..], b"234");
        assert!(matches!(
            backend.read_block("", &id(), 10, 0).await,
            Err(Error::OutOfRange { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_block_is_served_locally() {
        let (memory, backend) = backend();
        backend
            .write_block(&id(), Bytes::from_static(b"not yet uploaded"), Version::new(1))
            .await
            .unwrap();

        let data = backend.read_block("", &id(), 8, 0).await.unwrap();
        assert_eq!(&data[..], b"uploaded");
        assert_eq!(memory.upload_count(), 0);
        assert!(backend.block_exists(&id()).await.unwrap());
        assert_eq!(backend.list_blocks().await.unwrap(), vec![id()]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_everywhere_is_block_not_found() {
        let (_memory, backend) = backend();
        let err = backend.read_block("", &id(), 0, 0).await.unwrap_err();
        assert!(matches!(err, Error::BlockNotFound(ref b) if *b == id()));
        assert!(matches!(
            backend.delete_block(&id()).await,
            Err(Error::BlockNotFound(_))
        ));
        assert!(!backend.block_exists(&id()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_the_peer_named_by_location() {
        let peer = Arc::new(FakePeer::default());
        peer.blocks
            .lock()
            .push(("http://node-b".into(), id(), Bytes::from_static(b"from peer")));
        let (_memory, backend) = backend();
        let backend = backend.with_peer(peer.clone(), Some("http://node-a".into()));

        let data = backend.read_block("http://node-b", &id(), 5, 0).await.unwrap();
        assert_eq!(&data[..], b"peer");

        // own location never leaves the node
        assert!(
            backend
                .read_block("http://node-a", &id(), 0, 0)
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert_eq!(*peer.calls.lock(), vec!["http://node-b".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_failure_is_surfaced_when_remote_still_misses() {
        #[derive(Debug)]
        struct BrokenPeer;

        #[async_trait]
        impl PeerReader for BrokenPeer {
            async fn read_block(&self, node: &str, _: &BlockId, _: u64, _: u64) -> Result<Bytes> {
                Err(Error::Remote(format!("{node} unreachable")))
            }
        }

        let (_memory, backend) = backend();
        let backend = backend.with_peer(Arc::new(BrokenPeer), None);
        let err = backend.read_block("http://node-c", &id(), 0, 0).await.unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
    }

    #[derive(Debug)]
    struct LateCommitStore {
        inner: MemoryObjectStore,
        misses: Mutex<u32>,
    }

    #[async_trait]
    impl ObjectStore for LateCommitStore {
        fn describe(&self) -> String {
            self.inner.describe()
        }
        async fn put(&self, key: &str, payload: Bytes, metadata: &ObjectMetadata) -> Result<()> {
            self.inner.put(key, payload, metadata).await
        }
        async fn get(&self, key: &str, offset: u64, length: u64) -> Result<Bytes> {
            {
                let mut misses = self.misses.lock();
                if *misses > 0 {
                    *misses -= 1;
                    return Err(key_not_found(key));
                }
            }
            self.inner.get(key, offset, length).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_remote_after_pending_miss() {
        // The block lands in the bucket between the first read and the
        // pending lookup.
        let store = Arc::new(LateCommitStore {
            inner: MemoryObjectStore::new(),
            misses: Mutex::new(1),
        });
        store.inner.insert(block_key("", &id()), Bytes::from_static(b"landed"));
        let backend = RemoteBackend::new("r", "", store.clone(), CoalesceConfig::default());

        let data = backend.read_block("", &id(), 0, 0).await.unwrap();
        assert_eq!(&data[..], b"landed");
    }

    #[tokio::test(start_paused = true)]
    async fn read_pending_uses_block_range_rules() {
        let (_memory, backend) = backend();
        backend
            .write_block(&id(), Bytes::from_static(b"abcdef"), Version::new(1))
            .await
            .unwrap();
        assert_eq!(&backend.read_pending(&id(), 4, 10).unwrap()[..], b"ef");
        assert!(backend.read_pending(&id(), 6, 0).is_err());
        assert!(
            backend
                .read_pending(&BlockId::parse("ffff0000").unwrap(), 0, 0)
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delete_cancels_pending_write() {
        let (memory, backend) = backend();
        backend
            .write_block(&id(), Bytes::from_static(b"x"), Version::new(1))
            .await
            .unwrap();
        backend.delete_block(&id()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(memory.upload_count(), 0);
        assert!(!backend.block_exists(&id()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_waits_for_running_upload() {
        let (memory, backend) = backend();
        memory.set_put_latency(Duration::from_secs(3));
        backend
            .write_block(&id(), Bytes::from_static(b"final"), Version::FINAL)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            backend.coalescer().status(&id()),
            Some((Version::FINAL, WriteStatus::Writing))
        );

        backend.delete_block(&id()).await.unwrap();
        backend.flush().await.unwrap();
        assert_eq!(memory.upload_count(), 1);
        assert!(!backend.block_exists(&id()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn location_and_listing() {
        let (memory, backend) = backend();
        memory.insert("tenant/blocks/ab/cd/abcd0001", Bytes::new());
        memory.insert("tenant/blocks/zz/zz/not-a-block/extra", Bytes::new());
        memory.insert("other/blocks/ef/01/ef012345", Bytes::new());

        assert_eq!(backend.list_blocks().await.unwrap(), vec![id()]);
        assert_eq!(
            backend.location(&id()),
            "memory:///tenant/blocks/ab/cd/abcd0001"
        );
        assert_eq!(backend.store_type(), "s3");
    }

    #[tokio::test(start_paused = true)]
    async fn access_probe_round_trips() {
        let (memory, backend) = backend();
        backend.verify_access().await.unwrap();
        assert_eq!(memory.upload_count(), 1);
        assert!(memory.list("").await.unwrap().is_empty());

        memory.set_fail_puts(true);
        assert!(backend.verify_access().await.is_err());
    }
}
