use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, TimestampSecondsWithFrac, serde_as};

use super::{BlockId, Chunk, ChunkHash};
use crate::error::Result;

/// One chunk entry inside a block, in write order.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChunk {
    #[serde_as(as = "DisplayFromStr")]
    pub hash: ChunkHash,
    pub size: u32,
}

/// The unit of physical storage: one or more chunks written together.
///
/// The chunk list order is significant: it is the order chunks appear in the
/// stored payload. A block belongs to exactly one storage backend.
#[serde_as]
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    /// Digest over the whole stored payload, set when the block is sealed.
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub etag: Option<ChunkHash>,
    /// Sum of the chunk sizes.
    pub total_size: u64,
    /// Size of the payload as stored (after any encoding).
    pub real_size: u64,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub encrypted: bool,
    pub chunks: Vec<BlockChunk>,
    pub storage_id: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde_as(as = "TimestampSecondsWithFrac<String>")]
    pub created_at: SystemTime,
    #[serde_as(as = "TimestampSecondsWithFrac<String>")]
    pub updated_at: SystemTime,
    /// Set while the block has chunks not yet flushed with a terminal write.
    #[serde(skip)]
    pub dirty: bool,
}

impl Block {
    pub fn new(storage_id: impl Into<String>) -> Block {
        Block::with_id(BlockId::generate(), storage_id)
    }

    pub fn with_id(id: BlockId, storage_id: impl Into<String>) -> Block {
        let now = SystemTime::now();
        Block {
            id,
            etag: None,
            total_size: 0,
            real_size: 0,
            compressed: false,
            encrypted: false,
            chunks: Vec::new(),
            storage_id: storage_id.into(),
            location: None,
            created_at: now,
            updated_at: now,
            dirty: false,
        }
    }

    pub fn add_chunk(&mut self, chunk: &Chunk) {
        self.chunks.push(BlockChunk {
            hash: chunk.hash,
            size: chunk.size,
        });
        self.total_size += u64::from(chunk.size);
        self.updated_at = SystemTime::now();
        self.dirty = true;
    }

    pub fn chunk(&self, index: usize) -> Option<&BlockChunk> {
        self.chunks.get(index)
    }

    pub fn chunk_by_hash(&self, hash: &ChunkHash) -> Option<&BlockChunk> {
        self.chunks.iter().find(|c| &c.hash == hash)
    }

    pub fn contains(&self, hash: &ChunkHash) -> bool {
        self.chunk_by_hash(hash).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Record the stored payload's digest and size after the terminal write.
    pub fn seal(&mut self, etag: ChunkHash, real_size: u64) {
        self.etag = Some(etag);
        self.real_size = real_size;
        self.updated_at = SystemTime::now();
        self.dirty = false;
    }

    /// Key of this block's record in the metadata store.
    pub fn meta_key(&self) -> String {
        format!("block:{}", self.id)
    }

    pub fn to_meta_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
