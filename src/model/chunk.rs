use std::time::SystemTime;

use blake3::Hash;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, TimestampSeconds, serde_as};

use super::BlockId;

/// Content hash identifying a chunk.
pub type ChunkHash = Hash;

/// The unit of deduplication.
///
/// Two chunks with the same hash hold identical content. `ref_count` is
/// carried for the metadata layer; nothing in the block store adjusts it.
#[serde_as]
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    #[serde_as(as = "DisplayFromStr")]
    pub hash: ChunkHash,
    pub size: u32,
    #[serde(default)]
    pub ref_count: u32,
    #[serde(default)]
    pub block_id: Option<BlockId>,
    #[serde_as(as = "Option<TimestampSeconds<i64>>")]
    #[serde(default)]
    pub last_accessed: Option<SystemTime>,
    /// Raw payload; empty when the chunk was loaded from metadata.
    #[serde(skip)]
    pub data: Bytes,
}

impl Chunk {
    /// Build a chunk from its payload. Returns `None` for an empty payload or
    /// one too large to be addressed inside a block.
    pub fn new(data: Bytes) -> Option<Chunk> {
        if data.is_empty() {
            return None;
        }
        let size = u32::try_from(data.len()).ok()?;
        Some(Chunk {
            hash: blake3::hash(&data),
            size,
            ref_count: 0,
            block_id: None,
            last_accessed: None,
            data,
        })
    }

    pub fn set_block_id(&mut self, block_id: BlockId) {
        self.block_id = Some(block_id);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_accessed = Some(SystemTime::now());
    }

    /// Whether `data` hashes to this chunk's hash.
    pub fn matches(&self, data: &[u8]) -> bool {
        blake3::hash(data) == self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = Chunk::new(Bytes::from_static(b"hello world")).unwrap();
        let b = Chunk::new(Bytes::from_static(b"hello world")).unwrap();
        let c = Chunk::new(Bytes::from_static(b"hello there")).unwrap();
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
        assert_eq!(a.size, 11);
        assert!(a.matches(b"hello world"));
    }

    #[test]
    fn empty_payload_is_not_a_chunk() {
        assert!(Chunk::new(Bytes::new()).is_none());
    }

    #[test]
    fn payload_is_not_serialized() {
        let mut chunk = Chunk::new(Bytes::from_static(b"secret bytes")).unwrap();
        chunk.set_block_id(BlockId::parse("abcd0001").unwrap());

        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["hash"], chunk.hash.to_hex().as_str());
        assert_eq!(json["block_id"], "abcd0001");
        assert!(json.get("data").is_none());

        let back: Chunk = serde_json::from_value(json).unwrap();
        assert_eq!(back.hash, chunk.hash);
        assert!(back.data.is_empty());
    }
}
