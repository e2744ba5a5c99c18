use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, TimestampSecondsWithFrac, hex::Hex, serde_as};

use super::ChunkHash;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
pub const STANDARD_STORAGE_CLASS: &str = "STANDARD";

/// Chunk data stored directly in the object record for very small objects.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineChunk {
    #[serde(default)]
    pub compressed: bool,
    #[serde_as(as = "Hex")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

/// A bucket/key addressed S3 entity composed of an ordered list of chunks.
///
/// Objects are produced and consumed by the metadata layer; the block store
/// only cares that they are the reason chunks and blocks exist.
#[serde_as]
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub version_id: Option<String>,
    pub etag: String,
    pub size: u64,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    #[serde(default)]
    pub chunks: Vec<ChunkHash>,
    #[serde(default)]
    pub inline: Option<InlineChunk>,
    pub content_type: String,
    pub storage_class: String,
    #[serde(default)]
    pub user_metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub lock_mode: Option<String>,
    #[serde_as(as = "Option<TimestampSecondsWithFrac<String>>")]
    #[serde(default)]
    pub lock_retain_until: Option<SystemTime>,
    #[serde(default)]
    pub legal_hold: bool,
    #[serde(default)]
    pub owner: Owner,
    #[serde_as(as = "TimestampSecondsWithFrac<String>")]
    pub created_at: SystemTime,
    #[serde_as(as = "TimestampSecondsWithFrac<String>")]
    pub last_modified: SystemTime,
}

impl Object {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Object {
        let now = SystemTime::now();
        Object {
            bucket: bucket.into(),
            key: key.into(),
            version_id: None,
            etag: String::new(),
            size: 0,
            chunks: Vec::new(),
            inline: None,
            content_type: DEFAULT_CONTENT_TYPE.to_owned(),
            storage_class: STANDARD_STORAGE_CLASS.to_owned(),
            user_metadata: BTreeMap::new(),
            tags: BTreeMap::new(),
            lock_mode: None,
            lock_retain_until: None,
            legal_hold: false,
            owner: Owner::default(),
            created_at: now,
            last_modified: now,
        }
    }

    pub fn is_inline(&self) -> bool {
        self.inline.is_some()
    }

    pub fn resource_arn(&self) -> String {
        format!("arn:aws:s3:::{}/{}", self.bucket, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_object_defaults() {
        let obj = Object::new("photos", "2024/cat.jpg");
        assert_eq!(obj.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(obj.storage_class, STANDARD_STORAGE_CLASS);
        assert!(!obj.is_inline());
        assert_eq!(obj.resource_arn(), "arn:aws:s3:::photos/2024/cat.jpg");
    }

    #[test]
    fn chunk_list_serializes_as_hex() {
        let mut obj = Object::new("b", "k");
        obj.chunks = vec![blake3::hash(b"one"), blake3::hash(b"two")];
        obj.inline = Some(InlineChunk {
            compressed: false,
            data: b"tiny".to_vec(),
        });

        let json = serde_json::to_value(&obj).unwrap();
        assert_eq!(json["chunks"][0], blake3::hash(b"one").to_hex().as_str());
        assert!(json.get("lock_mode").is_none());

        let back: Object = serde_json::from_value(json).unwrap();
        assert_eq!(back.chunks, obj.chunks);
        assert_eq!(back.inline, obj.inline);
    }
}
