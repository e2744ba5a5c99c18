//! Content-addressable data model: chunks, blocks and objects.
mod block;
mod block_id;
mod chunk;
mod object;
mod version;

pub use block::{Block, BlockChunk};
pub use block_id::BlockId;
pub use chunk::{Chunk, ChunkHash};
pub use object::{InlineChunk, Object, Owner};
pub use version::Version;
