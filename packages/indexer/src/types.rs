//! Block Data Model
//!
//! Raw blocks as returned by the node RPC and the transformed blocks produced
//! by the pipeline.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

/// Block header fields the pipeline relies on
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawHeader {
    #[serde(deserialize_with = "de_u64")]
    pub height: u64,
    pub time: DateTime<Utc>,
    /// Transaction count reported by the header, if present
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub num_txs: Option<u64>,
}

/// Block body: ordered opaque transaction strings
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawData {
    #[serde(default, deserialize_with = "de_null_as_empty")]
    pub txs: Vec<String>,
}

/// A block as extracted from the node
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawBlock {
    pub header: RawHeader,
    #[serde(default)]
    pub data: RawData,
}

impl RawBlock {
    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn txs(&self) -> &[String] {
        &self.data.txs
    }

    /// Header transaction count, falling back to the body length
    pub fn num_txs(&self) -> u64 {
        self.header
            .num_txs
            .unwrap_or(self.data.txs.len() as u64)
    }

    /// Sum of the byte lengths of all raw transaction strings
    pub fn size(&self) -> u64 {
        self.data.txs.iter().map(|tx| tx.len() as u64).sum()
    }
}

/// A denomination and amount pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    #[serde(deserialize_with = "de_u128")]
    pub amount: u128,
}

impl Coin {
    pub fn new(denom: impl Into<String>, amount: u128) -> Self {
        Self {
            denom: denom.into(),
            amount,
        }
    }
}

/// Kind of a recent transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Transfer,
    Trade,
}

/// One recent-transaction record, before the loader assigns its index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentTx {
    pub from: String,
    pub to: String,
    pub from_coins: Vec<Coin>,
    pub to_coins: Vec<Coin>,
    pub height: u64,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub tx_type: TxType,
}

/// Block statistics produced by the transformer
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedBlock {
    pub height: u64,
    pub time: DateTime<Utc>,
    pub size: u64,
    pub num_txs: u64,
    pub num_clp_txs: u64,
    /// Native-denom input total
    pub amount_transacted: u128,
    /// Settled trade total
    pub amount_transacted_clp: u128,
    /// Transfer output addresses
    pub addresses: HashSet<String>,
    /// One slot per raw transaction, in block order
    pub recent_txs: Vec<Vec<RecentTx>>,
    /// Every per-denom input total, native included; non-native entries are
    /// left unconverted
    pub denom_totals: HashMap<String, u128>,
}

impl TransformedBlock {
    /// Empty statistics for a raw block, with one empty slot per transaction
    pub fn from_raw(raw: &RawBlock, height: u64) -> Self {
        Self {
            height,
            time: raw.header.time,
            size: raw.size(),
            num_txs: raw.num_txs(),
            num_clp_txs: 0,
            amount_transacted: 0,
            amount_transacted_clp: 0,
            addresses: HashSet::new(),
            recent_txs: vec![Vec::new(); raw.txs().len()],
            denom_totals: HashMap::new(),
        }
    }

    /// Total number of recent-tx records across all slots
    pub fn recent_tx_count(&self) -> usize {
        self.recent_txs.iter().map(Vec::len).sum()
    }
}

/// Parses an unsigned integer from a JSON string or number
struct UintVisitor;

impl<'de> Visitor<'de> for UintVisitor {
    type Value = u128;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an unsigned integer or a decimal string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u128, E> {
        Ok(v as u128)
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> Result<u128, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<u128, E> {
        u128::try_from(v).map_err(|_| E::custom(format!("negative amount: {}", v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<u128, E> {
        v.trim()
            .parse()
            .map_err(|_| E::custom(format!("invalid integer string: {:?}", v)))
    }
}

pub(crate) fn de_u128<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
    d.deserialize_any(UintVisitor)
}

pub(crate) fn de_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let v = d.deserialize_any(UintVisitor)?;
    u64::try_from(v).map_err(|_| de::Error::custom(format!("value out of range: {}", v)))
}

fn de_opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    struct Wrapped(#[serde(deserialize_with = "de_u64")] u64);

    Ok(Option::<Wrapped>::deserialize(d)?.map(|Wrapped(v)| v))
}

fn de_null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<String>>::deserialize(d)?.unwrap_or_default())
}
