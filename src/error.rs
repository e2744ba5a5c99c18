use std::time::Duration;

use crate::model::{BlockId, Version};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("block not found: {0}")]
    BlockNotFound(BlockId),
    #[error("stale write for block {block_id} discarded: version {submitted} is older than pending {pending}")]
    StaleVersion {
        block_id: BlockId,
        pending: Version,
        submitted: Version,
    },
    #[error("read offset {offset} out of range for block of {size} bytes")]
    OutOfRange { offset: u64, size: u64 },
    #[error("invalid block id: {0:?}")]
    InvalidBlockId(String),
    #[error("corrupt block payload: {0}")]
    Corrupt(String),
    #[error("{op} timed out after {after:?}")]
    Timeout { op: String, after: Duration },
    #[error("remote storage error: {0}")]
    Remote(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("block store is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error means the block does not exist at the queried tier.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::BlockNotFound(_) => true,
            Error::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Whether this is the low-severity "older version discarded" outcome.
    pub fn is_stale(&self) -> bool {
        matches!(self, Error::StaleVersion { .. })
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(err) => err,
            Error::BlockNotFound(id) => {
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("block not found: {id}"))
            }
            err => std::io::Error::other(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinct_from_other_io() {
        let id = BlockId::parse("abcd0001").unwrap();
        assert!(Error::BlockNotFound(id).is_not_found());

        let denied = Error::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!denied.is_not_found());

        let missing = Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(missing.is_not_found());
    }

    #[test]
    fn stale_is_not_not_found() {
        let err = Error::StaleVersion {
            block_id: BlockId::parse("abcd0001").unwrap(),
            pending: Version::new(2),
            submitted: Version::new(1),
        };
        assert!(err.is_stale());
        assert!(!err.is_not_found());
    }

    #[test]
    fn converts_into_io_error_keeping_not_found_kind() {
        let id = BlockId::parse("abcd0001").unwrap();
        let io: std::io::Error = Error::BlockNotFound(id).into();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }
}
