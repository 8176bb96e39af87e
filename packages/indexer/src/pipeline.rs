//! Block Pipeline
//!
//! One extract, transform and load pass for a single block, skipped when the
//! block is the one last recorded in the height cache.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::cache::{CacheError, HeightCache};
use crate::extractor::{BlockSource, ExtractError};
use crate::loader::{LoadError, Loader};
use crate::transformer::{TransformError, Transformer};

/// Errors that abort a pipeline pass
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Extract failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("Transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("Load failed: {0}")]
    Load(#[from] LoadError),

    #[error("Height cache failed: {0}")]
    Cache(#[from] CacheError),
}

pub struct Pipeline {
    source: Arc<dyn BlockSource>,
    transformer: Transformer,
    loader: Loader,
    cache: Arc<dyn HeightCache>,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn BlockSource>,
        transformer: Transformer,
        loader: Loader,
        cache: Arc<dyn HeightCache>,
    ) -> Self {
        Self {
            source,
            transformer,
            loader,
            cache,
        }
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    /// Process the block at `target`, or the latest block when `None`
    ///
    /// Returns the processed height. Recording it in the height cache is left
    /// to the caller.
    pub async fn process_block(&self, target: Option<u64>) -> Result<u64, PipelineError> {
        let raw = self.source.extract(target).await?;
        let height = raw.height();
        info!("Extracted height {} with {} txs", height, raw.txs().len());

        if self.cache.last_height().await? == Some(height) {
            info!("Height {} already processed, skipping", height);
            return Ok(height);
        }

        let block = self.transformer.transform(&raw, height).await?;
        self.loader.load(&block).await?;
        Ok(height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryHeightCache, MockHeightCache};
    use crate::config::{LoaderConfig, TransformConfig};
    use crate::decoder::{DecodeError, MockTxDecoder};
    use crate::extractor::MockBlockSource;
    use crate::loader::MockBulkSink;
    use crate::types::{RawBlock, RawData, RawHeader};

    fn raw_block(height: u64, txs: &[&str]) -> RawBlock {
        RawBlock {
            header: RawHeader {
                height,
                time: "2019-06-01T12:00:00Z".parse().unwrap(),
                num_txs: Some(txs.len() as u64),
            },
            data: RawData {
                txs: txs.iter().map(|t| t.to_string()).collect(),
            },
        }
    }

    fn source_returning(block: RawBlock) -> Arc<MockBlockSource> {
        let mut source = MockBlockSource::new();
        source
            .expect_extract()
            .returning(move |_| Ok(block.clone()));
        Arc::new(source)
    }

    fn pipeline(
        source: Arc<MockBlockSource>,
        decoder: MockTxDecoder,
        sink: MockBulkSink,
        cache: Arc<dyn HeightCache>,
    ) -> Pipeline {
        let transformer = Transformer::new(
            Arc::new(decoder),
            source.clone(),
            TransformConfig::default(),
        )
        .unwrap();
        let loader = Loader::new(Arc::new(sink), LoaderConfig::default());
        Pipeline::new(source, transformer, loader, cache)
    }

    // ==================== Dedup tests ====================

    #[tokio::test]
    async fn test_skips_last_processed_height() {
        let mut decoder = MockTxDecoder::new();
        decoder.expect_decode().never();
        let mut sink = MockBulkSink::new();
        sink.expect_bulk().never();

        let pipeline = pipeline(
            source_returning(raw_block(100, &["tx"])),
            decoder,
            sink,
            Arc::new(MemoryHeightCache::with_height(100)),
        );

        assert_eq!(pipeline.process_block(None).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_new_height_is_loaded_but_not_recorded() {
        let mut sink = MockBulkSink::new();
        sink.expect_bulk().times(1).returning(|_| Ok(()));
        let cache = Arc::new(MemoryHeightCache::with_height(99));

        let pipeline = pipeline(
            source_returning(raw_block(100, &[])),
            MockTxDecoder::new(),
            sink,
            cache.clone(),
        );

        assert_eq!(pipeline.process_block(Some(100)).await.unwrap(), 100);
        assert_eq!(cache.last_height().await.unwrap(), Some(99));
    }

    // ==================== Failure tests ====================

    #[tokio::test]
    async fn test_extract_failure() {
        let mut source = MockBlockSource::new();
        source
            .expect_extract()
            .returning(|_| Err(ExtractError::Status(502)));

        let pipeline = pipeline(
            Arc::new(source),
            MockTxDecoder::new(),
            MockBulkSink::new(),
            Arc::new(MemoryHeightCache::new()),
        );

        assert!(matches!(
            pipeline.process_block(None).await,
            Err(PipelineError::Extract(ExtractError::Status(502)))
        ));
    }

    #[tokio::test]
    async fn test_cache_failure() {
        let mut cache = MockHeightCache::new();
        cache
            .expect_last_height()
            .returning(|| Err(CacheError::InvalidHeight("x".into())));

        let pipeline = pipeline(
            source_returning(raw_block(100, &[])),
            MockTxDecoder::new(),
            MockBulkSink::new(),
            Arc::new(cache),
        );

        assert!(matches!(
            pipeline.process_block(None).await,
            Err(PipelineError::Cache(_))
        ));
    }

    #[tokio::test]
    async fn test_decode_failure_skips_load() {
        let mut decoder = MockTxDecoder::new();
        decoder
            .expect_decode()
            .returning(|_| Err(DecodeError::Json("eof".into())));
        let mut sink = MockBulkSink::new();
        sink.expect_bulk().never();

        let pipeline = pipeline(
            source_returning(raw_block(100, &["tx"])),
            decoder,
            sink,
            Arc::new(MemoryHeightCache::new()),
        );

        assert!(matches!(
            pipeline.process_block(None).await,
            Err(PipelineError::Transform(TransformError::Decode { index: 0, .. }))
        ));
    }

    #[tokio::test]
    async fn test_load_failure() {
        let mut sink = MockBulkSink::new();
        sink.expect_bulk()
            .returning(|_| Err(LoadError::Rejected { failed: 1, total: 1 }));

        let pipeline = pipeline(
            source_returning(raw_block(100, &[])),
            MockTxDecoder::new(),
            sink,
            Arc::new(MemoryHeightCache::new()),
        );

        assert!(matches!(
            pipeline.process_block(None).await,
            Err(PipelineError::Load(LoadError::Rejected { failed: 1, .. }))
        ));
    }
}
