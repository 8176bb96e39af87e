//! Blockscope Indexer Library
//!
//! This crate provides components for extracting blocks from a Tendermint node,
//! decoding and classifying their transactions, and loading block statistics
//! into a search store.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod decoder;
pub mod extractor;
pub mod limiter;
pub mod loader;
pub mod message;
pub mod pipeline;
pub mod transformer;
pub mod types;

// Re-export commonly used types
pub use cache::{HeightCache, MemoryHeightCache, RedisHeightCache};
pub use decoder::{parse_decoded, CliDecoder, DecodedTx, TxDecoder};
pub use extractor::{BlockResults, BlockSource, RpcClient};
pub use limiter::Limiter;
pub use loader::{to_ndjson, BulkOp, BulkSink, ElasticsearchSink, Loader};
pub use message::{message_kind, Message, MessageKind};
pub use pipeline::{Pipeline, PipelineError};
pub use transformer::Transformer;
pub use types::{Coin, RawBlock, RecentTx, TransformedBlock, TxType};
