//! Ledger computation and persistence contracts for one (wallet, token) pair.
//!
//! - `pipeline` runs normalize → convert → match → dust close for a pair
//! - `writer` commits a run as a full replacement or an incremental append

use crate::domain::{ClosedLot, Decimal, TokenId, TradeOrderingKey, WalletId};
use crate::engine::TradeRealizedMetrics;
use crate::error::LedgerError;
use async_trait::async_trait;

pub mod pipeline;
pub mod writer;

pub use pipeline::{LedgerPipeline, PairComputation};
pub use writer::{LedgerWriter, WriteMode, WriteSummary};

/// Persisted progress marker for a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerWatermark {
    /// Ordering key of the last trade folded into the stored lots.
    pub last_trade: Option<TradeOrderingKey>,
    /// Number of trade events folded in up to `last_trade`.
    pub trade_count: i64,
    pub open_balance: Decimal,
    /// Bumped on every committed write; 0 when the pair has never been written.
    pub version: i64,
}

impl LedgerWatermark {
    pub fn empty() -> Self {
        Self {
            last_trade: None,
            trade_count: 0,
            open_balance: Decimal::zero(),
            version: 0,
        }
    }
}

impl Default for LedgerWatermark {
    fn default() -> Self {
        Self::empty()
    }
}

/// Watermark to store with a write, guarded by the version it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCommit {
    pub expected_version: i64,
    pub last_trade: Option<TradeOrderingKey>,
    pub trade_count: i64,
    pub open_balance: Decimal,
}

/// Durable store of closed lots.
///
/// Writes are atomic per call: on error nothing is written and the previous set
/// stays authoritative. A stale `expected_version` yields
/// `LedgerError::PersistenceConflict`.
#[async_trait]
pub trait LotStore: Send + Sync {
    async fn watermark(
        &self,
        wallet: &WalletId,
        token: &TokenId,
    ) -> Result<LedgerWatermark, LedgerError>;

    /// Swap the pair's entire closed-lot set.
    async fn replace_closed_lots(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        lots: &[ClosedLot],
        commit: &LedgerCommit,
    ) -> Result<(), LedgerError>;

    /// Upsert `new_lots` by lot key. Any previously stored dust lot is superseded.
    ///
    /// Returns the number of rows written.
    async fn append_closed_lots(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        new_lots: &[ClosedLot],
        commit: &LedgerCommit,
    ) -> Result<usize, LedgerError>;

    /// Open balance recorded by the last committed write, if any.
    async fn current_open_balance(
        &self,
        wallet: &WalletId,
        token: &TokenId,
    ) -> Result<Option<Decimal>, LedgerError>;
}

/// Receives per-trade realized metrics.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn update_trade_realized_metrics(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        metrics: &TradeRealizedMetrics,
    ) -> Result<(), LedgerError>;

    /// Write many metrics at once.
    ///
    /// With `replace`, metrics previously stored for the pair are removed first.
    async fn update_trade_realized_metrics_batch(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        metrics: &[TradeRealizedMetrics],
        replace: bool,
    ) -> Result<usize, LedgerError>;
}
