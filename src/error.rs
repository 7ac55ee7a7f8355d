use crate::datasource::DataSourceError;
use crate::domain::{Currency, Decimal, TokenId, WalletId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures that abort a (wallet, token) run. Nothing is written when one is returned.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Trade source error: {0}")]
    TradeSource(#[from] DataSourceError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("Concurrent ledger write detected for wallet {wallet} token {token}; retry after it completes")]
    PersistenceConflict { wallet: WalletId, token: TokenId },
}

impl LedgerError {
    /// Conflicts are resolved by re-running once the other writer finishes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::PersistenceConflict { .. })
    }
}

/// Why the normalizer excluded a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Void,
    TransferOnly,
    MalformedSide,
    NonPositiveAmount,
    UnrecognizedCurrency,
    BelowMinQuote,
    NonPositivePrice,
    RateUnavailable,
    /// Converted quote amount is not representable.
    AmountOverflow,
    /// A trade with the same id was already admitted for this pair.
    DuplicateTradeId,
}

impl SkipReason {
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::Void => "void",
            SkipReason::TransferOnly => "transfer_only",
            SkipReason::MalformedSide => "malformed_side",
            SkipReason::NonPositiveAmount => "non_positive_amount",
            SkipReason::UnrecognizedCurrency => "unrecognized_currency",
            SkipReason::BelowMinQuote => "below_min_quote",
            SkipReason::NonPositivePrice => "non_positive_price",
            SkipReason::RateUnavailable => "rate_unavailable",
            SkipReason::AmountOverflow => "amount_overflow",
            SkipReason::DuplicateTradeId => "duplicate_trade_id",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Per-trade anomaly. Recorded in the run report; never aborts the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TradeAnomaly {
    #[error("trade {trade_id} skipped: {reason}")]
    Skippable { trade_id: String, reason: SkipReason },
    #[error("trade {trade_id}: no {currency} rate from oracle, used fallback {fallback_rate}")]
    RateUnavailable {
        trade_id: String,
        currency: Currency,
        fallback_rate: Decimal,
    },
    #[error("sell {trade_id}: {quantity} tokens exceed known open position (pre-history sell)")]
    UnmatchedSell { trade_id: String, quantity: Decimal },
}

impl TradeAnomaly {
    pub fn trade_id(&self) -> &str {
        match self {
            TradeAnomaly::Skippable { trade_id, .. }
            | TradeAnomaly::RateUnavailable { trade_id, .. }
            | TradeAnomaly::UnmatchedSell { trade_id, .. } => trade_id,
        }
    }
}
