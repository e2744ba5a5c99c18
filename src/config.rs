//! Store configuration, loaded from a JSON file.
//!
//! ```json
//! {
//!   "type": "s3",
//!   "id": "primary",
//!   "endpoint": "http://127.0.0.1:9000",
//!   "region": "us-east-1",
//!   "bucket": "dedup",
//!   "access_key": "minio",
//!   "secret_key": "minio123",
//!   "coalesce": { "delay": 5000 }
//! }
//! ```
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(flatten)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub coalesce: CoalesceConfig,
    #[serde(default)]
    pub peer: Option<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Disk {
        id: String,
        path: Utf8PathBuf,
    },
    S3 {
        id: String,
        endpoint: String,
        #[serde(default = "default_region")]
        region: String,
        bucket: String,
        #[serde(default)]
        prefix: String,
        access_key: String,
        secret_key: String,
        #[serde(default = "default_path_style")]
        path_style: bool,
    },
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

fn default_path_style() -> bool {
    true
}

/// Tuning of the remote write-coalescing engine. Durations are milliseconds
/// on the wire.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalesceConfig {
    /// How long a non-final write waits for a newer version before committing.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reap_interval: Duration,
    /// Age after which a descriptor that is not uploading counts as a zombie.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub zombie_age: Duration,
    /// Bound on every upload, read, delete and list call.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub op_timeout: Duration,
    /// Bound on the access probe run when the backend is opened.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    pub lock_shards: usize,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        CoalesceConfig {
            delay: Duration::from_secs(5),
            reap_interval: Duration::from_secs(1),
            zombie_age: Duration::from_secs(30),
            op_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            lock_shards: 1024,
        }
    }
}

/// Where to fetch blocks that are still pending on another node.
#[serde_as]
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Address of this node. Reads whose location names it skip the peer hop.
    #[serde(default)]
    pub local_node: Option<String>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_peer_timeout")]
    pub timeout: Duration,
}

fn default_peer_timeout() -> Duration {
    Duration::from_secs(30)
}

impl StoreConfig {
    pub fn disk(id: impl Into<String>, path: impl Into<Utf8PathBuf>) -> StoreConfig {
        StoreConfig {
            backend: BackendConfig::Disk {
                id: id.into(),
                path: path.into(),
            },
            coalesce: CoalesceConfig::default(),
            peer: None,
        }
    }

    pub fn load(path: &Utf8Path) -> Result<StoreConfig> {
        let raw = std::fs::read(path)?;
        let config: StoreConfig = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let require = |value: &str, what: &str| {
            if value.trim().is_empty() {
                Err(Error::Config(format!("{what} must not be empty")))
            } else {
                Ok(())
            }
        };

        match &self.backend {
            BackendConfig::Disk { id, path } => {
                require(id, "storage id")?;
                require(path.as_str(), "disk path")?;
            }
            BackendConfig::S3 {
                id,
                endpoint,
                bucket,
                access_key,
                secret_key,
                ..
            } => {
                require(id, "storage id")?;
                require(bucket, "bucket")?;
                require(access_key, "access key")?;
                require(secret_key, "secret key")?;
                reqwest::Url::parse(endpoint).map_err(|e| {
                    Error::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}"))
                })?;
            }
        }

        let c = &self.coalesce;
        if c.lock_shards == 0 {
            return Err(Error::Config("lock_shards must be at least 1".into()));
        }
        if c.reap_interval.is_zero() || c.op_timeout.is_zero() || c.connect_timeout.is_zero() {
            return Err(Error::Config(
                "reap interval and timeouts must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
