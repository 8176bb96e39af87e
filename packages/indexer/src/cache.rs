//! Height Cache
//!
//! Remembers the last height the pipeline finished so a repeated request for
//! the same block is skipped. Backed by a Redis key in production.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;

use crate::config::CacheConfig;

/// Errors that can occur while reading or writing the cached height
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cached height is not a number: {0}")]
    InvalidHeight(String),
}

/// Store of the last processed height
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HeightCache: Send + Sync {
    async fn last_height(&self) -> Result<Option<u64>, CacheError>;
    async fn set_last_height(&self, height: u64) -> Result<(), CacheError>;
}

/// Height cache kept in a single Redis key
pub struct RedisHeightCache {
    connection: MultiplexedConnection,
    key: String,
}

impl RedisHeightCache {
    pub fn new(connection: MultiplexedConnection, key: impl Into<String>) -> Self {
        Self {
            connection,
            key: key.into(),
        }
    }

    /// Open a connection described by `config`
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(connection, config.key.clone()))
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl HeightCache for RedisHeightCache {
    async fn last_height(&self) -> Result<Option<u64>, CacheError> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(&self.key).await?;
        value.map(|v| parse_height(&v)).transpose()
    }

    async fn set_last_height(&self, height: u64) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        let _: () = connection.set(&self.key, height).await?;
        Ok(())
    }
}

fn parse_height(value: &str) -> Result<u64, CacheError> {
    value
        .trim()
        .parse()
        .map_err(|_| CacheError::InvalidHeight(value.to_string()))
}

/// In-process height cache
#[derive(Debug, Default)]
pub struct MemoryHeightCache {
    height: Mutex<Option<u64>>,
}

impl MemoryHeightCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_height(height: u64) -> Self {
        Self {
            height: Mutex::new(Some(height)),
        }
    }
}

#[async_trait]
impl HeightCache for MemoryHeightCache {
    async fn last_height(&self) -> Result<Option<u64>, CacheError> {
        Ok(*self.height.lock())
    }

    async fn set_last_height(&self, height: u64) -> Result<(), CacheError> {
        *self.height.lock() = Some(height);
        Ok(())
    }
}
