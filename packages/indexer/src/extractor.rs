//! Block Extractor
//!
//! Fetches raw blocks and per-block delivery results from a Tendermint node's
//! HTTP RPC endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::RpcConfig;
use crate::types::RawBlock;

/// Errors fetching or parsing a block. Fatal to the pipeline run.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Block request failed: {0}")]
    Http(String),

    #[error("Block request returned status {0}")]
    Status(u16),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Failed to parse block: {0}")]
    Parse(String),
}

/// Errors fetching block results. Contained to the trades of one block.
#[derive(Error, Debug)]
pub enum AuxiliaryFetchError {
    #[error("Block results request failed: {0}")]
    Http(String),

    #[error("Block results request returned status {0}")]
    Status(u16),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Failed to parse block results: {0}")]
    Parse(String),
}

/// Key/value tag attached to a delivered transaction
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Tag {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Delivery result of one transaction in a block
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeliverTx {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub log: String,
    #[serde(default, deserialize_with = "de_null_tags")]
    pub tags: Vec<Tag>,
}

impl DeliverTx {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// Values of every tag with the given key, in emission order
    pub fn tag_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct ResultsBody {
    #[serde(default, alias = "DeliverTx", deserialize_with = "de_null_deliver")]
    deliver_tx: Vec<DeliverTx>,
}

/// Delivery results for every transaction of a block
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BlockResults {
    #[serde(default)]
    results: ResultsBody,
}

impl BlockResults {
    pub fn new(deliver_tx: Vec<DeliverTx>) -> Self {
        Self {
            results: ResultsBody { deliver_tx },
        }
    }

    /// Result for the transaction at `index` in block order
    pub fn deliver_tx(&self, index: usize) -> Option<&DeliverTx> {
        self.results.deliver_tx.get(index)
    }
}

fn de_null_tags<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Vec<Tag>, D::Error> {
    Ok(Option::<Vec<Tag>>::deserialize(d)?.unwrap_or_default())
}

fn de_null_deliver<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Vec<DeliverTx>, D::Error> {
    Ok(Option::<Vec<DeliverTx>>::deserialize(d)?.unwrap_or_default())
}

/// JSON-RPC envelope returned by the node
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<String>,
}

impl RpcErrorBody {
    fn describe(self) -> (i64, String) {
        match self.data {
            Some(data) if !data.is_empty() => (self.code, format!("{} ({})", self.message, data)),
            _ => (self.code, self.message),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BlockEnvelope {
    block: RawBlock,
}

/// Parse a `/block` response body
pub fn parse_block_response(body: &str) -> Result<RawBlock, ExtractError> {
    let response: RpcResponse<BlockEnvelope> =
        serde_json::from_str(body).map_err(|e| ExtractError::Parse(e.to_string()))?;
    if let Some(err) = response.error {
        let (code, message) = err.describe();
        return Err(ExtractError::Rpc { code, message });
    }
    response
        .result
        .map(|r| r.block)
        .ok_or_else(|| ExtractError::Parse("response has no result".to_string()))
}

/// Parse a `/block_results` response body
pub fn parse_block_results_response(body: &str) -> Result<BlockResults, AuxiliaryFetchError> {
    let response: RpcResponse<BlockResults> =
        serde_json::from_str(body).map_err(|e| AuxiliaryFetchError::Parse(e.to_string()))?;
    if let Some(err) = response.error {
        let (code, message) = err.describe();
        return Err(AuxiliaryFetchError::Rpc { code, message });
    }
    response
        .result
        .ok_or_else(|| AuxiliaryFetchError::Parse("response has no result".to_string()))
}

/// Source of raw blocks and their delivery results
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch the block at `height`, or the latest block when `None`
    async fn extract(&self, height: Option<u64>) -> Result<RawBlock, ExtractError>;

    /// Fetch delivery results for the block at `height`
    async fn block_results(&self, height: u64) -> Result<BlockResults, AuxiliaryFetchError>;
}

/// HTTP client for the node RPC
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: Client,
    base_url: String,
}

impl RpcClient {
    pub fn new(config: &RpcConfig) -> Result<Self, ExtractError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ExtractError::Http(e.to_string()))?;
        Ok(Self::with_client(http, &config.url))
    }

    pub fn with_client(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build the `/block` URL, omitting `height` for the latest block
    pub fn block_url(&self, height: Option<u64>) -> String {
        match height {
            Some(h) => format!("{}/block?height={}", self.base_url, h),
            None => format!("{}/block", self.base_url),
        }
    }

    pub fn block_results_url(&self, height: u64) -> String {
        format!("{}/block_results?height={}", self.base_url, height)
    }

    async fn get_text(&self, url: &str) -> Result<(u16, String), reqwest::Error> {
        let response = self.http.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok((status, body))
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Turn a `/block` reply into a block or an error
///
/// An RPC error in the body wins over the HTTP status.
pub(crate) fn classify_block_response(status: u16, body: &str) -> Result<RawBlock, ExtractError> {
    match parse_block_response(body) {
        Err(e @ ExtractError::Rpc { .. }) => Err(e),
        _ if !is_success(status) => Err(ExtractError::Status(status)),
        parsed => parsed,
    }
}

/// Turn a `/block_results` reply into results or an error
pub(crate) fn classify_block_results_response(
    status: u16,
    body: &str,
) -> Result<BlockResults, AuxiliaryFetchError> {
    match parse_block_results_response(body) {
        Err(e @ AuxiliaryFetchError::Rpc { .. }) => Err(e),
        _ if !is_success(status) => Err(AuxiliaryFetchError::Status(status)),
        parsed => parsed,
    }
}

#[async_trait]
impl BlockSource for RpcClient {
    async fn extract(&self, height: Option<u64>) -> Result<RawBlock, ExtractError> {
        let url = self.block_url(height);
        debug!("Fetching block from {}", url);

        let (status, body) = self
            .get_text(&url)
            .await
            .map_err(|e| ExtractError::Http(e.to_string()))?;
        classify_block_response(status, &body)
    }

    async fn block_results(&self, height: u64) -> Result<BlockResults, AuxiliaryFetchError> {
        let url = self.block_results_url(height);
        debug!("Fetching block results from {}", url);

        let (status, body) = self
            .get_text(&url)
            .await
            .map_err(|e| AuxiliaryFetchError::Http(e.to_string()))?;
        classify_block_results_response(status, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_BODY: &str = r#"{
        "jsonrpc": "2.0",
        "id": "",
        "result": {
            "block_meta": {},
            "block": {
                "header": {"height": "100", "time": "2019-06-01T12:00:00Z", "num_txs": "2"},
                "data": {"txs": ["dHgw", "dHgx"]}
            }
        }
    }"#;

    // ==================== URL tests ====================

    #[test]
    fn test_block_url_latest_omits_height() {
        let client = RpcClient::with_client(Client::new(), "http://node:26657/");
        assert_eq!(client.block_url(None), "http://node:26657/block");
    }

    #[test]
    fn test_block_url_with_height() {
        let client = RpcClient::with_client(Client::new(), "http://node:26657");
        assert_eq!(client.block_url(Some(42)), "http://node:26657/block?height=42");
    }

    #[test]
    fn test_block_results_url() {
        let client = RpcClient::with_client(Client::new(), "http://node:26657");
        assert_eq!(
            client.block_results_url(42),
            "http://node:26657/block_results?height=42"
        );
    }

    // ==================== Block parsing tests ====================

    #[test]
    fn test_parse_block_response() {
        let block = parse_block_response(BLOCK_BODY).unwrap();
        assert_eq!(block.height(), 100);
        assert_eq!(block.txs().len(), 2);
    }

    #[test]
    fn test_parse_block_response_rpc_error() {
        let body = r#"{"jsonrpc": "2.0", "id": "", "error": {"code": -32603, "message": "Internal error", "data": "height 9999 must be less than or equal to the current blockchain height 120"}}"#;
        let err = parse_block_response(body).unwrap_err();
        match err {
            ExtractError::Rpc { code, message } => {
                assert_eq!(code, -32603);
                assert!(message.contains("height 9999"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_parse_block_response_garbage() {
        assert!(matches!(
            parse_block_response("<html>bad gateway</html>"),
            Err(ExtractError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_block_response_missing_result() {
        assert!(matches!(
            parse_block_response(r#"{"jsonrpc": "2.0", "id": ""}"#),
            Err(ExtractError::Parse(_))
        ));
    }

    // ==================== Block results parsing tests ====================

    #[test]
    fn test_parse_block_results() {
        let body = r#"{"result": {"height": "100", "results": {"deliver_tx": [
            {"code": 0, "log": "", "tags": null},
            {"code": 0, "log": "", "tags": [{"key": "received_amount", "value": "5"}]}
        ]}}}"#;
        let results = parse_block_results_response(body).unwrap();
        assert!(results.deliver_tx(1).is_some());
        assert_eq!(
            results.deliver_tx(1).unwrap().tag_values("received_amount").next(),
            Some("5")
        );
        assert!(results.deliver_tx(0).unwrap().tags.is_empty());
        assert!(results.deliver_tx(2).is_none());
    }

    #[test]
    fn test_parse_block_results_capitalized_key() {
        let body = r#"{"result": {"height": "100", "results": {"DeliverTx": [{"code": 3, "log": "insufficient funds"}]}}}"#;
        let results = parse_block_results_response(body).unwrap();
        let deliver = results.deliver_tx(0).unwrap();
        assert!(!deliver.is_ok());
        assert_eq!(deliver.log, "insufficient funds");
    }

    #[test]
    fn test_parse_block_results_null_deliver_tx() {
        let body = r#"{"result": {"height": "100", "results": {"deliver_tx": null}}}"#;
        let results = parse_block_results_response(body).unwrap();
        assert!(results.deliver_tx(0).is_none());
    }

    #[test]
    fn test_parse_block_results_rpc_error() {
        let body = r#"{"error": {"code": -32603, "message": "Internal error"}}"#;
        assert!(matches!(
            parse_block_results_response(body),
            Err(AuxiliaryFetchError::Rpc { code: -32603, .. })
        ));
    }

    // ==================== Status classification tests ====================

    const RPC_ERROR_BODY: &str = r#"{"error": {"code": -32603, "message": "Internal error"}}"#;

    #[test]
    fn test_classify_block_success() {
        let block = classify_block_response(200, BLOCK_BODY).unwrap();
        assert_eq!(block.height(), 100);
    }

    #[test]
    fn test_classify_block_bad_status_with_valid_body() {
        assert!(matches!(
            classify_block_response(502, BLOCK_BODY),
            Err(ExtractError::Status(502))
        ));
    }

    #[test]
    fn test_classify_block_rpc_error_beats_status() {
        assert!(matches!(
            classify_block_response(500, RPC_ERROR_BODY),
            Err(ExtractError::Rpc { code: -32603, .. })
        ));
    }

    #[test]
    fn test_classify_block_bad_status_with_garbage() {
        assert!(matches!(
            classify_block_response(503, "<html>unavailable</html>"),
            Err(ExtractError::Status(503))
        ));
    }

    #[test]
    fn test_classify_block_success_with_garbage_is_parse_error() {
        assert!(matches!(
            classify_block_response(200, "not json"),
            Err(ExtractError::Parse(_))
        ));
    }

    #[test]
    fn test_classify_block_results_statuses() {
        let body = r#"{"result": {"height": "1", "results": {"deliver_tx": []}}}"#;
        assert!(classify_block_results_response(200, body).is_ok());
        assert!(matches!(
            classify_block_results_response(404, body),
            Err(AuxiliaryFetchError::Status(404))
        ));
        assert!(matches!(
            classify_block_results_response(500, RPC_ERROR_BODY),
            Err(AuxiliaryFetchError::Rpc { .. })
        ));
        assert!(matches!(
            classify_block_results_response(502, ""),
            Err(AuxiliaryFetchError::Status(502))
        ));
    }

    // ==================== Error display tests ====================

    #[test]
    fn test_extract_error_display() {
        assert!(ExtractError::Status(502).to_string().contains("502"));
        assert!(AuxiliaryFetchError::Http("reset".into()).to_string().contains("reset"));
    }
}
