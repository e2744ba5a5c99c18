use std::sync::Arc;

use tracing::{debug, instrument};

use crate::backend::BlockStore;
use crate::error::{Error, Result};
use crate::model::{Block, Chunk, Version};
use crate::pack::BlockWriter;

/// Default upper bound on a block payload.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 8 * 1024 * 1024;

struct OpenBlock {
    block: Block,
    writer: BlockWriter,
    next_version: Version,
}

/// Packs chunks into blocks and writes every growth step of the open block
/// to the store with an increasing version; sealing writes the final one.
///
/// Chunk reference counts are left to the caller.
pub struct BlockPacker {
    store: Arc<dyn BlockStore>,
    max_block_size: usize,
    location: Option<String>,
    open: Option<OpenBlock>,
    sealed: Vec<Block>,
}

impl BlockPacker {
    pub fn new(store: Arc<dyn BlockStore>, max_block_size: usize) -> BlockPacker {
        BlockPacker {
            store,
            max_block_size,
            location: None,
            open: None,
            sealed: Vec::new(),
        }
    }

    /// Node address recorded on sealed blocks, used by peers to find blocks
    /// that are still pending here.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn sealed(&self) -> &[Block] {
        &self.sealed
    }

    /// Add `chunk` to the open block and write the grown payload.
    ///
    /// A chunk already in the open block is not stored twice; it just
    /// points at that block.
    #[instrument(skip_all, fields(hash = %chunk.hash))]
    pub async fn push(&mut self, chunk: &mut Chunk) -> Result<()> {
        if chunk.data.len() != chunk.size as usize {
            return Err(Error::Corrupt(format!(
                "chunk {} has {} bytes of data but size {}",
                chunk.hash,
                chunk.data.len(),
                chunk.size
            )));
        }

        if let Some(open) = &self.open {
            if open.block.contains(&chunk.hash) {
                chunk.set_block_id(open.block.id.clone());
                return Ok(());
            }
            let grown = open.writer.size() + BlockWriter::item_size(chunk.data.len());
            if !open.writer.is_empty() && grown > self.max_block_size {
                self.seal().await?;
            }
        }

        let store_id = self.store.id().to_owned();
        let open = self.open.get_or_insert_with(|| OpenBlock {
            block: Block::new(store_id),
            writer: BlockWriter::new(),
            next_version: Version::INITIAL,
        });
        open.writer.append(chunk.hash.into(), &chunk.data)?;
        open.block.add_chunk(chunk);
        chunk.set_block_id(open.block.id.clone());

        let version = open.next_version;
        open.next_version = version.next();
        self.store
            .write_block(&open.block.id, open.writer.encode(), version)
            .await
    }

    /// Write the open block with the final version and move it to the
    /// sealed list.
    pub async fn seal(&mut self) -> Result<Option<&Block>> {
        let Some(open) = &self.open else {
            return Ok(None);
        };
        let payload = open.writer.encode();
        self.store
            .write_block(&open.block.id, payload.clone(), Version::FINAL)
            .await?;

        // the block stays open until its final write has been accepted
        let Some(OpenBlock { mut block, .. }) = self.open.take() else {
            return Ok(None);
        };
        block.seal(blake3::hash(&payload), payload.len() as u64);
        block.location = self.location.clone();
        debug!(
            block_id = %block.id,
            chunks = block.chunks.len(),
            size = payload.len(),
            "sealed block"
        );
        self.sealed.push(block);
        Ok(self.sealed.last())
    }

    /// Seal the open block and return every sealed block record.
    pub async fn finish(mut self) -> Result<Vec<Block>> {
        self.seal().await?;
        Ok(self.sealed)
    }
}
