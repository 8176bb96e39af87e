//! Transaction Decoder
//!
//! Decodes raw block transactions by invoking an external decoder process and
//! parsing the amino-JSON `StdTx` it prints. Both the wrapped form
//! (`{"type": "auth/StdTx", "value": {...}}`) and the bare form are accepted.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::config::DecoderConfig;
use crate::message::{Message, RawMessage};

/// Errors that can occur during transaction decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Failed to start decoder: {0}")]
    Spawn(String),

    #[error("Decoder failed (exit code {code:?}): {stderr}")]
    Process { code: Option<i32>, stderr: String },

    #[error("Decoder output is not a transaction: {0}")]
    Json(String),

    #[error("Invalid {type_name} message: {reason}")]
    InvalidMessage { type_name: String, reason: String },

    #[error("Empty transaction")]
    EmptyInput,
}

/// A decoded transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTx {
    /// Messages in transaction order
    pub messages: Vec<Message>,
    pub memo: String,
}

#[derive(Debug, Deserialize)]
struct StdTx {
    msg: Vec<RawMessage>,
    #[serde(default)]
    memo: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TxEnvelope {
    Wrapped { value: StdTx },
    Bare(StdTx),
}

/// Parse decoder output into a typed transaction
pub fn parse_decoded(output: &str) -> Result<DecodedTx, DecodeError> {
    let envelope: TxEnvelope =
        serde_json::from_str(output.trim()).map_err(|e| DecodeError::Json(e.to_string()))?;
    let tx = match envelope {
        TxEnvelope::Wrapped { value } => value,
        TxEnvelope::Bare(tx) => tx,
    };

    let messages = tx
        .msg
        .into_iter()
        .map(|raw| {
            let type_name = raw.type_name.clone();
            raw.into_message()
                .map_err(|e| DecodeError::InvalidMessage {
                    type_name,
                    reason: e.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DecodedTx {
        messages,
        memo: tx.memo.unwrap_or_default(),
    })
}

/// Turns one raw transaction string into a decoded transaction
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TxDecoder: Send + Sync {
    async fn decode(&self, raw_tx: &str) -> Result<DecodedTx, DecodeError>;
}

/// Decoder backed by an external command line tool
///
/// The raw transaction is passed as the last argument. A non-zero exit or
/// any diagnostic text on stderr is treated as a failure.
#[derive(Debug, Clone)]
pub struct CliDecoder {
    config: DecoderConfig,
}

impl CliDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }
}

impl Default for CliDecoder {
    fn default() -> Self {
        Self::new(DecoderConfig::default())
    }
}

#[async_trait]
impl TxDecoder for CliDecoder {
    async fn decode(&self, raw_tx: &str) -> Result<DecodedTx, DecodeError> {
        if raw_tx.is_empty() {
            return Err(DecodeError::EmptyInput);
        }

        let output = Command::new(self.config.program_path())
            .args(&self.config.args)
            .arg(raw_tx)
            .output()
            .await
            .map_err(|e| DecodeError::Spawn(e.to_string()))?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() || !stderr.is_empty() {
            return Err(DecodeError::Process {
                code: output.status.code(),
                stderr,
            });
        }

        parse_decoded(&String::from_utf8_lossy(&output.stdout))
    }
}
