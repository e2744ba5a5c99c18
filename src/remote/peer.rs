use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::BlockId;

/// Header marking internal node-to-node requests.
pub const NODE_API_HEADER: &str = "x-dedupstore-node-api";

/// Reads block bytes that are still pending on another node.
#[async_trait]
pub trait PeerReader: Debug + Send + Sync {
    async fn read_block(
        &self,
        node: &str,
        block_id: &BlockId,
        offset: u64,
        length: u64,
    ) -> Result<Bytes>;
}

/// Path of the node endpoint serving pending block bytes.
pub fn peer_block_url(node: &str, block_id: &BlockId) -> String {
    format!("{}/node/block/{block_id}", node.trim_end_matches('/'))
}

#[derive(Debug, Clone)]
pub struct HttpPeerReader {
    client: Client,
}

impl HttpPeerReader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build peer HTTP client: {e}")))?;
        Ok(HttpPeerReader { client })
    }
}

#[async_trait]
impl PeerReader for HttpPeerReader {
    async fn read_block(
        &self,
        node: &str,
        block_id: &BlockId,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let url = peer_block_url(node, block_id);
        let response = self
            .client
            .get(&url)
            .query(&[("offset", offset), ("size", length)])
            .header(NODE_API_HEADER, "read-block")
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::BlockNotFound(block_id.clone())),
            status if !status.is_success() => Err(Error::Remote(format!(
                "peer {node} answered {status} for block {block_id}"
            ))),
            _ => {
                let body = response.bytes().await?;
                if body.is_empty() {
                    return Err(Error::Remote(format!(
                        "peer {node} returned no data for block {block_id}"
                    )));
                }
                debug!(%block_id, node, len = body.len(), "read block from peer");
                Ok(body)
            }
        }
    }
}
