//! Block payload codec: chunks packed back to back, followed by a hash index.
mod block_index;
mod block_writer;

pub use block_index::{BlockIndex, ChunkLocation};
pub use block_writer::{BlockWriter, HASH_SIZE, IndexEntry};
