use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use blockscope_indexer::cache::{HeightCache, RedisHeightCache};
use blockscope_indexer::config::{
    CacheConfig, DecoderConfig, LoaderConfig, RpcConfig, TransformConfig, DEFAULT_ADDRESSES_INDEX,
    DEFAULT_BLOCKS_INDEX, DEFAULT_DECODER_PROGRAM, DEFAULT_HEIGHT_KEY, DEFAULT_LOAD_TIMEOUT_MS,
    DEFAULT_MAX_CONCURRENT, DEFAULT_NATIVE_DENOM, DEFAULT_REDIS_URL, DEFAULT_RPC_TIMEOUT_MS,
    DEFAULT_RPC_URL, DEFAULT_SEARCH_URL, DEFAULT_TXS_INDEX,
};
use blockscope_indexer::decoder::CliDecoder;
use blockscope_indexer::extractor::RpcClient;
use blockscope_indexer::loader::{ElasticsearchSink, Loader};
use blockscope_indexer::pipeline::Pipeline;
use blockscope_indexer::transformer::Transformer;

#[derive(Parser, Debug)]
#[command(version, about = "Index one block into the search store", long_about = None)]
struct Cli {
    /// Height to process, the latest block when omitted
    #[arg(long)]
    height: Option<u64>,

    /// Node RPC base URL
    #[arg(long, env = "BLOCKSCOPE_RPC_URL", default_value = DEFAULT_RPC_URL)]
    rpc_url: String,

    #[arg(long, env = "BLOCKSCOPE_RPC_TIMEOUT_MS", default_value_t = DEFAULT_RPC_TIMEOUT_MS)]
    rpc_timeout_ms: u64,

    /// Transaction decoder executable
    #[arg(long, env = "BLOCKSCOPE_DECODER", default_value = DEFAULT_DECODER_PROGRAM)]
    decoder: String,

    /// Arguments placed before the raw transaction (can be specified multiple times)
    #[arg(long = "decoder-arg", allow_hyphen_values = true)]
    decoder_args: Option<Vec<String>>,

    /// Maximum concurrently decoding transactions
    #[arg(long, env = "BLOCKSCOPE_MAX_CONCURRENT", default_value_t = DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,

    #[arg(long, env = "BLOCKSCOPE_NATIVE_DENOM", default_value = DEFAULT_NATIVE_DENOM)]
    native_denom: String,

    /// Search store base URL
    #[arg(long, env = "BLOCKSCOPE_SEARCH_URL", default_value = DEFAULT_SEARCH_URL)]
    search_url: String,

    #[arg(long, default_value = DEFAULT_BLOCKS_INDEX)]
    blocks_index: String,

    #[arg(long, default_value = DEFAULT_ADDRESSES_INDEX)]
    addresses_index: String,

    #[arg(long, default_value = DEFAULT_TXS_INDEX)]
    txs_index: String,

    #[arg(long, default_value_t = DEFAULT_LOAD_TIMEOUT_MS)]
    load_timeout_ms: u64,

    /// First recent-tx index assigned by this run
    #[arg(long, default_value_t = 0)]
    start_index: u64,

    #[arg(long, env = "BLOCKSCOPE_REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    redis_url: String,

    /// Redis key holding the last processed height
    #[arg(long, default_value = DEFAULT_HEIGHT_KEY)]
    height_key: String,
}

impl Cli {
    fn decoder_config(&self) -> DecoderConfig {
        let mut config = DecoderConfig {
            program: self.decoder.clone(),
            ..Default::default()
        };
        if let Some(args) = &self.decoder_args {
            config.args = args.clone();
        }
        config
    }

    fn transform_config(&self) -> TransformConfig {
        TransformConfig {
            max_concurrent: self.max_concurrent,
            native_denom: self.native_denom.clone(),
        }
    }

    fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            url: self.search_url.clone(),
            blocks_index: self.blocks_index.clone(),
            addresses_index: self.addresses_index.clone(),
            txs_index: self.txs_index.clone(),
            timeout_ms: self.load_timeout_ms,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let source = Arc::new(
        RpcClient::new(&RpcConfig {
            url: cli.rpc_url.clone(),
            timeout_ms: cli.rpc_timeout_ms,
        })
        .context("failed to build RPC client")?,
    );

    let decoder_config = cli.decoder_config();
    decoder_config.validate()?;
    let decoder = Arc::new(CliDecoder::new(decoder_config));
    let transformer = Transformer::new(decoder, source.clone(), cli.transform_config())?;

    let loader_config = cli.loader_config();
    let sink = Arc::new(
        ElasticsearchSink::new(&loader_config).context("failed to build search client")?,
    );
    let loader = Loader::with_start_index(sink, loader_config, cli.start_index);

    let cache: Arc<dyn HeightCache> = Arc::new(
        RedisHeightCache::connect(&CacheConfig {
            redis_url: cli.redis_url.clone(),
            key: cli.height_key.clone(),
        })
        .await
        .context("failed to connect to Redis")?,
    );

    let pipeline = Pipeline::new(source, transformer, loader, cache.clone());
    let height = pipeline.process_block(cli.height).await?;
    cache.set_last_height(height).await?;

    info!("Processed height {}", height);
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
