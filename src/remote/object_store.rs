use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::model::{BlockId, Version};

pub const META_BLOCK_ID: &str = "x-amz-meta-block-id";
pub const META_BLOCK_VERSION: &str = "x-amz-meta-block-version";

/// User metadata attached to an uploaded object, as `(header, value)` pairs.
pub type ObjectMetadata = Vec<(&'static str, String)>;

/// Minimal key/value surface of a remote object-storage bucket.
///
/// Missing keys are reported by `get` and `delete` as [`key_not_found`],
/// which the block backend turns into [`crate::Error::BlockNotFound`].
#[async_trait]
pub trait ObjectStore: Debug + Send + Sync {
    /// Short name of the endpoint for logs and `Location`, e.g. `s3://bucket`.
    fn describe(&self) -> String;

    async fn put(&self, key: &str, payload: Bytes, metadata: &ObjectMetadata) -> Result<()>;

    /// Fetch `length` bytes of the object from `offset`, with the range rules
    /// of [`crate::backend::BlockStore::read_block`]: `length == 0` reads to
    /// the end, an overrun is clamped and an offset past the end is
    /// [`crate::Error::OutOfRange`].
    async fn get(&self, key: &str, offset: u64, length: u64) -> Result<Bytes>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// All keys starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Cheap connectivity check against the bucket.
    async fn ping(&self) -> Result<()>;
}

/// Directory under which all blocks live.
pub fn blocks_prefix(prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        "blocks/".to_owned()
    } else {
        format!("{prefix}/blocks/")
    }
}

/// `<prefix>/blocks/<id[0..2]>/<id[2..4]>/<id>`
pub fn block_key(prefix: &str, block_id: &BlockId) -> String {
    let (dir1, dir2) = block_id.shard();
    format!("{}{dir1}/{dir2}/{block_id}", blocks_prefix(prefix))
}

/// Inverse of [`block_key`]; `None` for keys outside the block layout.
pub fn block_id_from_key(prefix: &str, key: &str) -> Option<BlockId> {
    let rest = key.strip_prefix(&blocks_prefix(prefix))?;
    let mut parts = rest.split('/');
    let (dir1, dir2, name) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let block_id = BlockId::parse(name).ok()?;
    (block_id.shard() == (dir1, dir2)).then_some(block_id)
}

pub fn key_not_found(key: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no such key: {key}"),
    ))
}

pub fn block_metadata(block_id: &BlockId, version: Version) -> ObjectMetadata {
    vec![
        (META_BLOCK_ID, block_id.to_string()),
        (META_BLOCK_VERSION, version.get().to_string()),
    ]
}
