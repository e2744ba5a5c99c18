//! Block storage engine of a deduplicating object store.
//!
//! Objects are split into content-addressed [`Chunk`]s, chunks are packed
//! into [`Block`]s and blocks are written through a [`BlockStore`]: the local
//! [`DiskBackend`] or the write-coalescing [`remote::RemoteBackend`].
pub mod backend;
pub mod config;
pub mod error;
pub mod model;
pub mod pack;
pub mod packer;
pub mod remote;

pub use backend::{BlockStore, DiskBackend, open_backend};
pub use config::{BackendConfig, CoalesceConfig, PeerConfig, StoreConfig};
pub use error::{Error, Result};
pub use model::{Block, BlockChunk, BlockId, Chunk, ChunkHash, Object, Version};
pub use packer::BlockPacker;
