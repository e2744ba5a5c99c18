use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque, globally unique identifier of a block.
///
/// IDs are restricted to ASCII alphanumerics, `-` and `_` and are at least
/// four characters long, so the first four characters can be used as two
/// directory levels of fan-out.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockId(String);

impl BlockId {
    pub const MIN_LEN: usize = 4;

    pub fn parse(id: impl Into<String>) -> Result<BlockId> {
        let id = id.into();
        let valid = id.len() >= Self::MIN_LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(BlockId(id))
        } else {
            Err(Error::InvalidBlockId(id))
        }
    }

    /// A fresh random ID: 32 lowercase hex characters.
    pub fn generate() -> BlockId {
        BlockId(const_hex::encode(rand::random::<[u8; 16]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two 2-character directory levels this block is sharded under.
    pub fn shard(&self) -> (&str, &str) {
        (&self.0[0..2], &self.0[2..4])
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BlockId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for BlockId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BlockId::parse(s)
    }
}

impl TryFrom<String> for BlockId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        BlockId::parse(value)
    }
}

impl From<BlockId> for String {
    fn from(value: BlockId) -> Self {
        value.0
    }
}
