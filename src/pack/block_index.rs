use bytes::Bytes;

use super::block_writer::{HASH_SIZE, HEADER_SIZE, INDEX_ENTRY_SIZE, IndexEntry};
use crate::error::{Error, Result};
use crate::model::ChunkHash;

/// Where a chunk's data lives inside a block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLocation {
    pub offset: u64,
    pub size: u32,
}

/// Decoded trailer of a block payload.
#[derive(Debug, Clone)]
pub struct BlockIndex {
    entries: Vec<IndexEntry>,
    locations: Vec<ChunkLocation>,
    body_len: usize,
}

fn read_u32_le(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + size_of::<u32>())?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

impl BlockIndex {
    pub fn parse(payload: &[u8]) -> Result<BlockIndex> {
        let corrupt = |msg: &str| Error::Corrupt(msg.to_owned());

        let trailer_at = payload
            .len()
            .checked_sub(size_of::<u32>())
            .ok_or_else(|| corrupt("payload shorter than index trailer"))?;
        let index_size = read_u32_le(payload, trailer_at)
            .ok_or_else(|| corrupt("missing index size"))? as usize;
        if index_size % INDEX_ENTRY_SIZE != 0 {
            return Err(corrupt("index size is not a multiple of the entry size"));
        }
        let body_len = trailer_at
            .checked_sub(index_size)
            .ok_or_else(|| corrupt("index larger than payload"))?;

        let mut entries = Vec::with_capacity(index_size / INDEX_ENTRY_SIZE);
        let mut locations = Vec::with_capacity(entries.capacity());
        for raw in payload[body_len..trailer_at].chunks_exact(INDEX_ENTRY_SIZE) {
            let mut hash = [0u8; HASH_SIZE];
            hash.copy_from_slice(&raw[..HASH_SIZE]);
            let offset = read_u32_le(raw, HASH_SIZE).ok_or_else(|| corrupt("short index entry"))?;

            let header_at = offset as usize;
            let header = payload
                .get(header_at..header_at + HEADER_SIZE)
                .filter(|_| header_at + HEADER_SIZE <= body_len)
                .ok_or_else(|| corrupt("index entry points outside the body"))?;
            if header[..HASH_SIZE] != hash {
                return Err(corrupt("index entry does not match chunk header"));
            }
            let size = read_u32_le(header, HASH_SIZE).ok_or_else(|| corrupt("short chunk header"))?;
            let data_at = header_at + HEADER_SIZE;
            if data_at + size as usize > body_len {
                return Err(corrupt("chunk data overruns the body"));
            }

            entries.push(IndexEntry { hash, offset });
            locations.push(ChunkLocation {
                offset: data_at as u64,
                size,
            });
        }

        if !entries.is_sorted_by(|a, b| a.hash <= b.hash) {
            return Err(corrupt("index is not sorted"));
        }

        Ok(BlockIndex {
            entries,
            locations,
            body_len,
        })
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Length of the chunk area preceding the index.
    pub fn body_len(&self) -> usize {
        self.body_len
    }

    pub fn locate(&self, hash: &ChunkHash) -> Option<ChunkLocation> {
        let needle: &[u8; HASH_SIZE] = hash.as_bytes();
        self.entries
            .binary_search_by(|e| e.hash.cmp(needle))
            .ok()
            .map(|i| self.locations[i])
    }

    /// Extract a chunk's bytes from `payload`, verifying them against `hash`.
    pub fn read_chunk(&self, payload: &Bytes, hash: &ChunkHash) -> Result<Option<Bytes>> {
        let Some(loc) = self.locate(hash) else {
            return Ok(None);
        };
        let start = loc.offset as usize;
        let data = payload.slice(start..start + loc.size as usize);
        if blake3::hash(&data) != *hash {
            return Err(Error::Corrupt(format!("chunk {hash} failed verification")));
        }
        Ok(Some(data))
    }
}
