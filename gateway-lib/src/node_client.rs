//! Peer HTTP surface.
//!
//! [`NodeApi`] is the seam between the sync engine and the network; the
//! production implementation speaks plain HTTP through [`reqwest`] and
//! routes every request through the [`PeerPool`], warming the peer on
//! success and cooling it on failure. Tests script the trait directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer};
use tracing::debug;
use url::Url;

use crate::error::FetchError;
use crate::peer_pool::PeerPool;

/// `GET /info` payload: the network tip and peer-local queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInfo {
    #[serde(default)]
    pub network: String,
    pub height: u64,
    /// Hash of the current tip block.
    pub current: String,
    #[serde(default)]
    pub blocks: u64,
    #[serde(default)]
    pub peers: u64,
    #[serde(default)]
    pub queue_length: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainBlock {
    pub indep_hash: String,
    pub height: u64,
    pub previous_block: String,
    pub timestamp: u64,
    #[serde(default)]
    pub txs: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainTag {
    pub name: String,
    pub value: String,
}

/// `GET /tx/{id}` payload. Amount fields arrive as decimal strings on the
/// wire.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainTransaction {
    pub id: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub target: String,
    #[serde(default, deserialize_with = "u64_from_string_or_number")]
    pub quantity: u64,
    #[serde(default, deserialize_with = "u64_from_string_or_number")]
    pub reward: u64,
    #[serde(default)]
    pub signature: String,
    #[serde(default, deserialize_with = "u64_from_string_or_number")]
    pub data_size: u64,
    #[serde(default)]
    pub format: u64,
    #[serde(default)]
    pub tags: Vec<ChainTag>,
}

/// `GET /tx/{id}/offset`: absolute end offset and byte length of the
/// transaction payload in the weave.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TxOffsetInfo {
    #[serde(deserialize_with = "u64_from_string_or_number")]
    pub size: u64,
    #[serde(deserialize_with = "u64_from_string_or_number")]
    pub offset: u64,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    chunk: String,
}

fn u64_from_string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Read surface of one peer node.
#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn info(&self) -> Result<NetworkInfo, FetchError>;
    async fn block_by_height(&self, height: u64) -> Result<ChainBlock, FetchError>;
    async fn block_by_hash(&self, hash: &str) -> Result<ChainBlock, FetchError>;
    async fn current_block(&self) -> Result<ChainBlock, FetchError>;
    async fn transaction(&self, id: &str) -> Result<ChainTransaction, FetchError>;
    async fn tx_offset(&self, id: &str) -> Result<TxOffsetInfo, FetchError>;
    /// One chunk of payload data starting at the absolute `offset`.
    async fn chunk(&self, offset: u64) -> Result<Vec<u8>, FetchError>;
}

/// First value of the tag named `name`, if the transaction carries it.
pub fn tag_value<'a>(tags: &'a [ChainTag], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|tag| tag.name == name)
        .map(|tag| tag.value.as_str())
}

/// Retrieves a transaction payload by walking the chunk endpoint until the
/// byte range reported by the offset lookup is covered.
pub async fn fetch_transaction_data(
    node: &dyn NodeApi,
    id: &str,
) -> Result<(TxOffsetInfo, Vec<u8>), FetchError> {
    let offset_info = node.tx_offset(id).await?;
    let start = offset_info.offset.saturating_sub(offset_info.size) + 1;
    let mut data = Vec::with_capacity(offset_info.size as usize);
    while (data.len() as u64) < offset_info.size {
        let chunk = node.chunk(start + data.len() as u64).await?;
        if chunk.is_empty() {
            return Err(FetchError::Transient(format!(
                "empty chunk for tx {id} at offset {}",
                start + data.len() as u64
            )));
        }
        data.extend(chunk);
    }
    data.truncate(offset_info.size as usize);
    Ok((offset_info, data))
}

pub struct HttpNodeClient {
    http: reqwest::Client,
    peers: Arc<PeerPool>,
}

impl HttpNodeClient {
    pub fn new(peers: Arc<PeerPool>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, peers })
    }

    /// One GET against a freshly selected peer, adjusting its weight by the
    /// outcome. `escalate` marks failures that should count toward the
    /// unhealthy-peer signal.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        escalate: bool,
    ) -> Result<T, FetchError> {
        let peer = self.peers.select()?;
        let url = peer
            .join(path)
            .map_err(|e| FetchError::Transient(format!("bad request url {path}: {e}")))?;
        debug!(%url, "fetching from peer");
        let outcome = async {
            let response = self
                .http
                .get(url.clone())
                .send()
                .await
                .map_err(|e| FetchError::Transient(e.to_string()))?;
            let response = response
                .error_for_status()
                .map_err(|e| FetchError::Transient(e.to_string()))?;
            response
                .json::<T>()
                .await
                .map_err(|e| FetchError::Transient(e.to_string()))
        }
        .await;
        match &outcome {
            Ok(_) => self.peers.report_success(&peer),
            Err(_) => self.peers.report_failure(&peer, escalate),
        }
        outcome
    }
}

#[async_trait]
impl NodeApi for HttpNodeClient {
    async fn info(&self) -> Result<NetworkInfo, FetchError> {
        self.get_json("info", true).await
    }

    async fn block_by_height(&self, height: u64) -> Result<ChainBlock, FetchError> {
        self.get_json(&format!("block/height/{height}"), false).await
    }

    async fn block_by_hash(&self, hash: &str) -> Result<ChainBlock, FetchError> {
        self.get_json(&format!("block/hash/{hash}"), false).await
    }

    async fn current_block(&self) -> Result<ChainBlock, FetchError> {
        self.get_json("block/current", false).await
    }

    async fn transaction(&self, id: &str) -> Result<ChainTransaction, FetchError> {
        self.get_json(&format!("tx/{id}"), false).await
    }

    async fn tx_offset(&self, id: &str) -> Result<TxOffsetInfo, FetchError> {
        self.get_json(&format!("tx/{id}/offset"), false).await
    }

    async fn chunk(&self, offset: u64) -> Result<Vec<u8>, FetchError> {
        let response: ChunkResponse = self.get_json(&format!("chunk/{offset}"), false).await?;
        URL_SAFE_NO_PAD
            .decode(response.chunk.as_bytes())
            .map_err(|e| FetchError::Transient(format!("undecodable chunk at {offset}: {e}")))
    }
}
