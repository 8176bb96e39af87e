//! Block Transformer
//!
//! Runs one decode unit per transaction under the concurrency limiter and
//! assembles the block statistics. Output order always follows block order
//! because every unit writes into a slot reserved before dispatch.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tracing::{debug, error};

use crate::classifier::{AggregationCache, BlockState, Classifier};
use crate::config::{ConfigError, TransformConfig};
use crate::decoder::{DecodeError, TxDecoder};
use crate::extractor::BlockSource;
use crate::limiter::{Limiter, LimiterError};
use crate::types::{RawBlock, TransformedBlock};

/// Errors that abort the transform of a block
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("Failed to decode tx {index}: {source}")]
    Decode {
        index: usize,
        #[source]
        source: DecodeError,
    },

    #[error("Decode unit for tx {index} did not complete: {source}")]
    Task {
        index: usize,
        #[source]
        source: LimiterError,
    },

    #[error("Invalid transform configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Turns raw blocks into block statistics
pub struct Transformer {
    classifier: Arc<Classifier>,
    config: TransformConfig,
}

impl Transformer {
    pub fn new(
        decoder: Arc<dyn TxDecoder>,
        source: Arc<dyn BlockSource>,
        config: TransformConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            classifier: Arc::new(Classifier::new(decoder, source)),
            config,
        })
    }

    /// Decode and aggregate every transaction of `raw`
    ///
    /// All units run to completion even after one fails; the first fatal
    /// error to complete is returned once they have.
    pub async fn transform(
        &self,
        raw: &RawBlock,
        height: u64,
    ) -> Result<TransformedBlock, TransformError> {
        let mut block = TransformedBlock::from_raw(raw, height);
        let state = Arc::new(BlockState::new(height, raw.header.time, raw.txs().len()));
        let cache = Arc::new(AggregationCache::new(height));
        let limiter = Limiter::new(self.config.max_concurrent)?;

        let mut units: FuturesUnordered<_> = raw
            .txs()
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, raw_tx)| {
                let classifier = self.classifier.clone();
                let state = state.clone();
                let cache = cache.clone();
                let handle = limiter.submit(move || async move {
                    classifier
                        .decode_and_classify(&raw_tx, index, &state, &cache)
                        .await
                });
                async move { (index, handle.await) }
            })
            .collect();

        let mut first_error = None;
        while let Some((index, outcome)) = units.next().await {
            let err = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(source)) => TransformError::Decode { index, source },
                Err(source) => TransformError::Task { index, source },
            };
            error!("Height {}: {}", height, err);
            first_error.get_or_insert(err);
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        block.num_clp_txs = state.num_clp_txs();
        block.amount_transacted_clp = state.amount_transacted_clp();
        block.addresses = state.take_addresses();
        block.recent_txs = state.take_slots();
        block.denom_totals = cache.totals();
        // other denoms stay unconverted in denom_totals
        block.amount_transacted = cache.amount(&self.config.native_denom);

        debug!(
            "Transformed height {}: {} txs, {} clp txs, {} addresses",
            height,
            block.num_txs,
            block.num_clp_txs,
            block.addresses.len()
        );
        Ok(block)
    }
}
