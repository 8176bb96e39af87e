//! Search Store Loader
//!
//! Shapes a transformed block into bulk-index operations and writes them to
//! the search store in a single `_bulk` request. Three document kinds are
//! produced: block statistics keyed by height, empty address markers keyed by
//! address, and recent-tx records carrying a sequential `index`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::LoaderConfig;
use crate::types::{RecentTx, TransformedBlock};

/// Errors that can occur during loading
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Bulk request failed: {0}")]
    Http(String),

    #[error("Bulk request returned status {0}")]
    Status(u16),

    #[error("Search store rejected {failed} of {total} documents")]
    Rejected { failed: usize, total: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Block statistics document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDocument {
    pub height: u64,
    pub time: DateTime<Utc>,
    pub size: u64,
    pub num_txs: u64,
    pub num_clp_txs: u64,
    pub amount_transacted: u128,
    pub amount_transacted_clp: u128,
}

impl From<&TransformedBlock> for BlockDocument {
    fn from(block: &TransformedBlock) -> Self {
        Self {
            height: block.height,
            time: block.time,
            size: block.size,
            num_txs: block.num_txs,
            num_clp_txs: block.num_clp_txs,
            amount_transacted: block.amount_transacted,
            amount_transacted_clp: block.amount_transacted_clp,
        }
    }
}

/// Recent-tx document with its assigned sequence index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentTxDocument {
    #[serde(flatten)]
    pub tx: RecentTx,
    pub index: u64,
}

/// One index instruction of a bulk request
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOp {
    pub index: String,
    /// Document id, `None` lets the store assign one
    pub id: Option<String>,
    pub document: Value,
}

impl BulkOp {
    fn action(&self) -> Value {
        match &self.id {
            Some(id) => json!({"index": {"_index": self.index, "_id": id}}),
            None => json!({"index": {"_index": self.index}}),
        }
    }
}

/// Render operations as a newline-delimited `_bulk` body
pub fn to_ndjson(ops: &[BulkOp]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for op in ops {
        body.push_str(&serde_json::to_string(&op.action())?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&op.document)?);
        body.push('\n');
    }
    Ok(body)
}

/// Destination of bulk-index operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BulkSink: Send + Sync {
    async fn bulk(&self, ops: Vec<BulkOp>) -> Result<(), LoadError>;
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

impl BulkResponse {
    fn failed_items(&self) -> usize {
        self.items
            .iter()
            .filter(|item| {
                item.as_object()
                    .and_then(|o| o.values().next())
                    .map(|result| result.get("error").is_some())
                    .unwrap_or(false)
            })
            .count()
    }
}

/// Elasticsearch `_bulk` client
#[derive(Debug, Clone)]
pub struct ElasticsearchSink {
    http: Client,
    base_url: String,
}

impl ElasticsearchSink {
    pub fn new(config: &LoaderConfig) -> Result<Self, LoadError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| LoadError::Http(e.to_string()))?;
        Ok(Self::with_client(http, &config.url))
    }

    pub fn with_client(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn bulk_url(&self) -> String {
        format!("{}/_bulk", self.base_url)
    }
}

#[async_trait]
impl BulkSink for ElasticsearchSink {
    async fn bulk(&self, ops: Vec<BulkOp>) -> Result<(), LoadError> {
        let body = to_ndjson(&ops)?;
        let response = self
            .http
            .post(self.bulk_url())
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| LoadError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| LoadError::Http(e.to_string()))?;
        classify_bulk_response(status, &text, ops.len())
    }
}

/// Turn a `_bulk` reply for `total` operations into success or an error
fn classify_bulk_response(status: u16, body: &str, total: usize) -> Result<(), LoadError> {
    if !(200..300).contains(&status) {
        return Err(LoadError::Status(status));
    }

    let parsed: BulkResponse = serde_json::from_str(body)?;
    if parsed.errors {
        let failed = parsed.failed_items();
        warn!("Bulk request reported {} failed items", failed);
        return Err(LoadError::Rejected { failed, total });
    }
    Ok(())
}

/// Counts of documents written by one load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub addresses: usize,
    pub txs: usize,
    /// Index of the first recent-tx document, if any were written
    pub first_index: Option<u64>,
}

/// Writes transformed blocks to the search store
pub struct Loader {
    sink: Arc<dyn BulkSink>,
    config: LoaderConfig,
    next_index: AtomicU64,
}

impl Loader {
    pub fn new(sink: Arc<dyn BulkSink>, config: LoaderConfig) -> Self {
        Self::with_start_index(sink, config, 0)
    }

    /// Create a loader whose first recent-tx document gets `start_index`
    pub fn with_start_index(
        sink: Arc<dyn BulkSink>,
        config: LoaderConfig,
        start_index: u64,
    ) -> Self {
        Self {
            sink,
            config,
            next_index: AtomicU64::new(start_index),
        }
    }

    /// Index the next recent-tx document will receive
    pub fn next_index(&self) -> u64 {
        self.next_index.load(Ordering::SeqCst)
    }

    /// Build every index operation for a block
    ///
    /// Recent-tx indices are reserved as one contiguous range and assigned in
    /// slot order, then in order within each slot.
    pub fn build_operations(
        &self,
        block: &TransformedBlock,
    ) -> Result<(Vec<BulkOp>, LoadSummary), LoadError> {
        let tx_count = block.recent_tx_count();
        let mut ops = Vec::with_capacity(1 + block.addresses.len() + tx_count);

        ops.push(BulkOp {
            index: self.config.blocks_index.clone(),
            id: Some(block.height.to_string()),
            document: serde_json::to_value(BlockDocument::from(block))?,
        });

        let mut addresses: Vec<&String> = block.addresses.iter().collect();
        addresses.sort();
        for address in &addresses {
            ops.push(BulkOp {
                index: self.config.addresses_index.clone(),
                id: Some(address.to_string()),
                document: json!({}),
            });
        }

        let first_index = self.next_index.fetch_add(tx_count as u64, Ordering::SeqCst);
        let records = block.recent_txs.iter().flatten();
        for (offset, tx) in records.enumerate() {
            let document = RecentTxDocument {
                tx: tx.clone(),
                index: first_index + offset as u64,
            };
            ops.push(BulkOp {
                index: self.config.txs_index.clone(),
                id: None,
                document: serde_json::to_value(document)?,
            });
        }

        let summary = LoadSummary {
            addresses: addresses.len(),
            txs: tx_count,
            first_index: (tx_count > 0).then_some(first_index),
        };
        Ok((ops, summary))
    }

    /// Write a block and its documents in one bulk request
    pub async fn load(&self, block: &TransformedBlock) -> Result<LoadSummary, LoadError> {
        let (ops, summary) = self.build_operations(block)?;
        self.sink.bulk(ops).await?;
        info!(
            "Loaded height {}: {} addresses, {} recent txs",
            block.height, summary.addresses, summary.txs
        );
        Ok(summary)
    }
}
