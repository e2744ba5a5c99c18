//! Storage backend contract shared by the disk and remote block stores.
mod disk;
mod factory;

use std::fmt::Debug;
use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::model::{BlockId, Version};

pub use disk::DiskBackend;
pub use factory::open_backend;

/// Uniform interface every block storage backend implements.
#[async_trait]
pub trait BlockStore: Debug + Send + Sync {
    /// Backend kind: `"disk"` or `"s3"`.
    fn store_type(&self) -> &'static str;

    /// Storage backend identifier recorded on every block it holds.
    fn id(&self) -> &str;

    /// Persist, or schedule persistence of, `payload` as the content of
    /// `block_id` at sequence `version`.
    async fn write_block(&self, block_id: &BlockId, payload: Bytes, version: Version)
    -> Result<()>;

    /// Read `length` bytes from `offset`; `length == 0` reads to the end.
    ///
    /// `location` names the node that produced the block, for backends that
    /// can fall back to a peer.
    async fn read_block(
        &self,
        location: &str,
        block_id: &BlockId,
        offset: u64,
        length: u64,
    ) -> Result<Bytes>;

    async fn delete_block(&self, block_id: &BlockId) -> Result<()>;

    async fn block_exists(&self, block_id: &BlockId) -> Result<bool>;

    async fn list_blocks(&self) -> Result<Vec<BlockId>>;

    /// Human-readable locator (path or URI) for diagnostics.
    fn location(&self, block_id: &BlockId) -> String;

    /// Write, read back, list and delete a probe block.
    async fn verify_access(&self) -> Result<()>;

    /// Wait until every accepted write has settled.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Cancel outstanding work and stop background tasks.
    async fn shutdown(&self) {}
}

/// Resolve a read request against a block of `size` bytes.
///
/// `offset` must fall inside the block (an empty block may only be read
/// whole); a range overrunning the end is clamped.
pub(crate) fn clamp_range(size: u64, offset: u64, length: u64) -> Result<Range<u64>> {
    if offset == 0 && size == 0 {
        return Ok(0..0);
    }
    if offset >= size {
        return Err(Error::OutOfRange { offset, size });
    }
    let end = if length == 0 {
        size
    } else {
        offset.saturating_add(length).min(size)
    };
    Ok(offset..end)
}

/// Slice an in-memory payload with [`clamp_range`] semantics.
pub(crate) fn slice_payload(payload: &Bytes, offset: u64, length: u64) -> Result<Bytes> {
    let range = clamp_range(payload.len() as u64, offset, length)?;
    Ok(payload.slice(range.start as usize..range.end as usize))
}

pub(crate) fn probe_block_id() -> Result<BlockId> {
    BlockId::parse(format!("probe-{}", BlockId::generate()))
}

pub(crate) const PROBE_PAYLOAD: &[u8] = b"dedupstore storage access probe";
