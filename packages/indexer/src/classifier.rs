//! Transaction Classification
//!
//! Decodes each transaction of a block and folds its messages into the
//! per-block aggregation state. Transfers feed the per-denom totals and the
//! address set; trades are settled against the block's delivery results,
//! which are fetched at most once per block.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::decoder::{DecodeError, TxDecoder};
use crate::extractor::{AuxiliaryFetchError, BlockResults, BlockSource};
use crate::message::{Message, Trade, Transfer};
use crate::types::{Coin, RecentTx, TxType};

/// Delivery tag carrying the amount a trade settled for
pub const RECEIVED_AMOUNT_TAG: &str = "received_amount";

/// Errors deriving the settlement of one trade. Only that record is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordDerivationError {
    #[error("No delivery result for tx {0}")]
    MissingResult(usize),

    #[error("Tx {index} failed with code {code}")]
    FailedResult { index: usize, code: u32 },

    #[error("Tx {index} has no received amount for trade {ordinal}")]
    MissingAmount { index: usize, ordinal: usize },

    #[error("Tx {index} has invalid received amount {value:?}")]
    InvalidAmount { index: usize, value: String },
}

/// Outcome of the block results fetch, shared by every trade in the block
pub type SharedBlockResults = Result<Arc<BlockResults>, Arc<AuxiliaryFetchError>>;

/// Per-block accumulator for per-denom amounts and the memoized block results
#[derive(Debug)]
pub struct AggregationCache {
    height: u64,
    amounts: Mutex<HashMap<String, u128>>,
    block_results: OnceCell<SharedBlockResults>,
}

impl AggregationCache {
    pub fn new(height: u64) -> Self {
        Self {
            height,
            amounts: Mutex::new(HashMap::new()),
            block_results: OnceCell::new(),
        }
    }

    pub fn add_amount(&self, denom: &str, amount: u128) {
        let mut amounts = self.amounts.lock();
        let total = amounts.entry(denom.to_string()).or_insert(0);
        *total = total.saturating_add(amount);
    }

    /// Accumulated amount for one denom
    pub fn amount(&self, denom: &str) -> u128 {
        self.amounts.lock().get(denom).copied().unwrap_or(0)
    }

    /// Snapshot of every per-denom total
    pub fn totals(&self) -> HashMap<String, u128> {
        self.amounts.lock().clone()
    }

    /// Block results for this block, fetched on first use
    ///
    /// Concurrent callers wait on the same fetch; the outcome, success or
    /// failure, is kept for every later caller.
    pub async fn block_results(&self, source: &dyn BlockSource) -> SharedBlockResults {
        self.block_results
            .get_or_init(|| async {
                source
                    .block_results(self.height)
                    .await
                    .map(Arc::new)
                    .map_err(Arc::new)
            })
            .await
            .clone()
    }

    pub fn block_results_fetched(&self) -> bool {
        self.block_results.initialized()
    }
}

/// Block statistics written concurrently by decode units
///
/// Slots are allocated up front so each unit writes only to the position of
/// its own transaction.
#[derive(Debug)]
pub struct BlockState {
    height: u64,
    time: DateTime<Utc>,
    num_clp_txs: AtomicU64,
    amount_transacted_clp: Mutex<u128>,
    addresses: Mutex<HashSet<String>>,
    slots: Vec<Mutex<Vec<RecentTx>>>,
}

impl BlockState {
    pub fn new(height: u64, time: DateTime<Utc>, slot_count: usize) -> Self {
        Self {
            height,
            time,
            num_clp_txs: AtomicU64::new(0),
            amount_transacted_clp: Mutex::new(0),
            addresses: Mutex::new(HashSet::new()),
            slots: (0..slot_count).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn num_clp_txs(&self) -> u64 {
        self.num_clp_txs.load(Ordering::SeqCst)
    }

    pub fn amount_transacted_clp(&self) -> u128 {
        *self.amount_transacted_clp.lock()
    }

    fn add_clp_amount(&self, amount: u128) {
        let mut total = self.amount_transacted_clp.lock();
        *total = total.saturating_add(amount);
    }

    fn insert_address(&self, address: &str) {
        self.addresses.lock().insert(address.to_string());
    }

    fn fill_slot(&self, index: usize, mut records: Vec<RecentTx>) {
        if let Some(slot) = self.slots.get(index) {
            slot.lock().append(&mut records);
        }
    }

    /// Move the collected address set out of the state
    pub fn take_addresses(&self) -> HashSet<String> {
        std::mem::take(&mut *self.addresses.lock())
    }

    /// Move the collected slots out of the state, in transaction order
    pub fn take_slots(&self) -> Vec<Vec<RecentTx>> {
        self.slots
            .iter()
            .map(|slot| std::mem::take(&mut *slot.lock()))
            .collect()
    }
}

/// Find the amount a trade settled for in the block results
///
/// `ordinal` is the trade's position among the trade messages of its
/// transaction; the n-th trade reads the n-th `received_amount` tag.
pub fn derive_settlement(
    results: &BlockResults,
    index: usize,
    ordinal: usize,
) -> Result<u128, RecordDerivationError> {
    let deliver = results
        .deliver_tx(index)
        .ok_or(RecordDerivationError::MissingResult(index))?;
    if !deliver.is_ok() {
        return Err(RecordDerivationError::FailedResult {
            index,
            code: deliver.code,
        });
    }
    let value = deliver
        .tag_values(RECEIVED_AMOUNT_TAG)
        .nth(ordinal)
        .ok_or(RecordDerivationError::MissingAmount { index, ordinal })?;
    value
        .trim()
        .parse()
        .map_err(|_| RecordDerivationError::InvalidAmount {
            index,
            value: value.to_string(),
        })
}

/// Decodes transactions and folds them into block state
pub struct Classifier {
    decoder: Arc<dyn TxDecoder>,
    source: Arc<dyn BlockSource>,
}

impl Classifier {
    pub fn new(decoder: Arc<dyn TxDecoder>, source: Arc<dyn BlockSource>) -> Self {
        Self { decoder, source }
    }

    /// Decode one transaction and record its messages in slot `index`
    ///
    /// Only a decode failure is returned; problems settling a trade are
    /// logged and skip that trade's record.
    pub async fn decode_and_classify(
        &self,
        raw_tx: &str,
        index: usize,
        state: &BlockState,
        cache: &AggregationCache,
    ) -> Result<(), DecodeError> {
        let tx = self.decoder.decode(raw_tx).await?;
        if !tx.memo.is_empty() {
            debug!("Tx {} at height {} has memo {:?}", index, state.height, tx.memo);
        }
        let mut records = Vec::new();
        let mut trade_ordinal = 0;

        for message in tx.messages {
            match message {
                Message::Transfer(transfer) => {
                    if let Some(record) = self.classify_transfer(&transfer, state, cache) {
                        records.push(record);
                    }
                }
                Message::Trade(trade) => {
                    let ordinal = trade_ordinal;
                    trade_ordinal += 1;
                    if let Some(record) = self
                        .classify_trade(trade, index, ordinal, state, cache)
                        .await
                    {
                        records.push(record);
                    }
                }
                Message::Other(type_name) => {
                    debug!("Ignoring {} message in tx {}", type_name, index);
                }
            }
        }

        state.fill_slot(index, records);
        Ok(())
    }

    fn classify_transfer(
        &self,
        transfer: &Transfer,
        state: &BlockState,
        cache: &AggregationCache,
    ) -> Option<RecentTx> {
        for input in &transfer.inputs {
            for coin in &input.coins {
                cache.add_amount(&coin.denom, coin.amount);
            }
        }
        for output in &transfer.outputs {
            state.insert_address(&output.address);
        }

        // multi-leg and multi-coin transfers are aggregated but not recorded
        let (input, output) = transfer.single_leg()?;
        Some(RecentTx {
            from: input.address.clone(),
            to: output.address.clone(),
            from_coins: input.coins.clone(),
            to_coins: output.coins.clone(),
            height: state.height,
            time: state.time,
            tx_type: TxType::Transfer,
        })
    }

    async fn classify_trade(
        &self,
        trade: Trade,
        index: usize,
        ordinal: usize,
        state: &BlockState,
        cache: &AggregationCache,
    ) -> Option<RecentTx> {
        state.num_clp_txs.fetch_add(1, Ordering::SeqCst);

        let results = match cache.block_results(self.source.as_ref()).await {
            Ok(results) => results,
            Err(e) => {
                warn!(
                    "Skipping settlement of trade in tx {} at height {}: {}",
                    index, state.height, e
                );
                return None;
            }
        };

        let received = match derive_settlement(&results, index, ordinal) {
            Ok(received) => received,
            Err(e) => {
                debug!("No trade record for height {}: {}", state.height, e);
                return None;
            }
        };

        state.add_clp_amount(received);
        Some(RecentTx {
            from: trade.sender.clone(),
            to: trade.sender,
            from_coins: vec![Coin::new(trade.from_ticker, trade.from_amount)],
            to_coins: vec![Coin::new(trade.to_ticker, received)],
            height: state.height,
            time: state.time,
            tx_type: TxType::Trade,
        })
    }
}
