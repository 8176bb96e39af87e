//! Pipeline Configuration
//!
//! Typed configuration for each pipeline component. Every struct has a
//! `Default` built from the constants below so callers only override what
//! differs in their deployment.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Default Tendermint RPC endpoint
pub const DEFAULT_RPC_URL: &str = "http://localhost:26657";

/// Default RPC request timeout in milliseconds
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;

/// Default decoder program
pub const DEFAULT_DECODER_PROGRAM: &str = "thorcli";

/// Default arguments passed to the decoder before the raw transaction
pub const DEFAULT_DECODER_ARGS: &[&str] = &["decode-tx"];

/// Default cap on concurrently decoding transactions
pub const DEFAULT_MAX_CONCURRENT: usize = 100;

/// Native denomination rolled into the block total
pub const DEFAULT_NATIVE_DENOM: &str = "RUNE";

/// Default Elasticsearch endpoint
pub const DEFAULT_SEARCH_URL: &str = "http://localhost:9200";

/// Default bulk request timeout in milliseconds
pub const DEFAULT_LOAD_TIMEOUT_MS: u64 = 30_000;

pub const DEFAULT_BLOCKS_INDEX: &str = "blocks";
pub const DEFAULT_ADDRESSES_INDEX: &str = "addresses";
pub const DEFAULT_TXS_INDEX: &str = "txs";

/// Default Redis connection string for the height cache
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1/";

/// Default Redis key holding the last processed height
pub const DEFAULT_HEIGHT_KEY: &str = "blockscope:last_height";

/// Errors raised while validating configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_concurrent must be positive")]
    ZeroConcurrency,

    #[error("Empty value for {0}")]
    Empty(&'static str),
}

/// Node RPC configuration
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Base URL of the node RPC
    pub url: String,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RPC_URL.to_string(),
            timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
        }
    }
}

impl RpcConfig {
    /// Create a config pointing at the given RPC URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// External decoder configuration
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Decoder executable, `~/` is expanded to the home directory
    pub program: String,
    /// Arguments placed before the raw transaction
    pub args: Vec<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_DECODER_PROGRAM.to_string(),
            args: DEFAULT_DECODER_ARGS.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl DecoderConfig {
    /// Create a config for a decoder program with no leading arguments
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Program path with a leading `~/` expanded
    pub fn program_path(&self) -> PathBuf {
        expand_path(&self.program)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.program.is_empty() {
            return Err(ConfigError::Empty("decoder program"));
        }
        Ok(())
    }
}

/// Block transform configuration
#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// Maximum concurrently in-flight decode units
    pub max_concurrent: usize,
    /// Denomination folded into `amount_transacted`
    pub native_denom: String,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            native_denom: DEFAULT_NATIVE_DENOM.to_string(),
        }
    }
}

impl TransformConfig {
    pub fn with_max_concurrent(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.native_denom.is_empty() {
            return Err(ConfigError::Empty("native denom"));
        }
        Ok(())
    }
}

/// Search store configuration
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Base URL of the search store
    pub url: String,
    pub blocks_index: String,
    pub addresses_index: String,
    pub txs_index: String,
    /// Bulk request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SEARCH_URL.to_string(),
            blocks_index: DEFAULT_BLOCKS_INDEX.to_string(),
            addresses_index: DEFAULT_ADDRESSES_INDEX.to_string(),
            txs_index: DEFAULT_TXS_INDEX.to_string(),
            timeout_ms: DEFAULT_LOAD_TIMEOUT_MS,
        }
    }
}

impl LoaderConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Height cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    /// Key holding the last processed height
    pub key: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            key: DEFAULT_HEIGHT_KEY.to_string(),
        }
    }
}

/// Resolve a decoder program path written relative to the home directory
///
/// Only a leading `~/` is expanded. Without a home directory the path is
/// returned as given and the spawn reports the missing program.
pub fn expand_path(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => Path::new(path).to_path_buf(),
    }
}
