use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const HASH_SIZE: usize = blake3::OUT_LEN;
pub(crate) const HEADER_SIZE: usize = HASH_SIZE + size_of::<u32>();
pub(crate) const INDEX_ENTRY_SIZE: usize = HASH_SIZE + size_of::<u32>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexEntry {
    pub hash: [u8; HASH_SIZE],
    /// Offset of the chunk header inside the payload.
    pub offset: u32,
}

/// Accumulates chunks into a block payload.
///
/// Payload format: for each chunk a header (hash, little-endian u32 size)
/// followed by the chunk bytes; then the index of `(hash, offset)` pairs
/// sorted by hash; then the little-endian u32 size of that index.
///
/// [`BlockWriter::encode`] does not consume the writer, so a block that keeps
/// growing can be emitted once per version.
#[derive(Debug, Default)]
pub struct BlockWriter {
    body: BytesMut,
    index: Vec<IndexEntry>,
}

impl BlockWriter {
    pub fn new() -> BlockWriter {
        BlockWriter::default()
    }

    pub fn append(&mut self, hash: [u8; HASH_SIZE], data: &[u8]) -> Result<()> {
        let data_size = u32::try_from(data.len())
            .map_err(|_| Error::Corrupt(format!("chunk of {} bytes is too large", data.len())))?;
        let offset = u32::try_from(self.body.len())
            .map_err(|_| Error::Corrupt("block body exceeds 4GiB".into()))?;

        // header
        self.body.put_slice(&hash);
        self.body.put_u32_le(data_size);
        // data
        self.body.put_slice(data);

        self.index.push(IndexEntry { hash, offset });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Size of the payload [`BlockWriter::encode`] would produce.
    pub fn size(&self) -> usize {
        self.body.len() + self.index_size() + size_of::<u32>()
    }

    /// How much adding the item would contribute to payload size.
    pub const fn item_size(data_size: usize) -> usize {
        HEADER_SIZE + data_size + INDEX_ENTRY_SIZE
    }

    fn index_size(&self) -> usize {
        self.index.len() * INDEX_ENTRY_SIZE
    }

    /// Serialize the current content, with its index, into a payload.
    pub fn encode(&self) -> Bytes {
        let mut index = self.index.clone();
        index.sort_unstable_by(|a, b| a.hash.cmp(&b.hash));

        let mut out = BytesMut::with_capacity(self.size());
        out.put_slice(&self.body);
        for idx in &index {
            out.put_slice(&idx.hash);
            out.put_u32_le(idx.offset);
        }
        // index size fits: body offsets are u32 and entries are fixed size
        out.put_u32_le(self.index_size() as u32);
        out.freeze()
    }
}
