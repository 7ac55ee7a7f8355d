//! ClosedLot: the durable output of a matching run.

use crate::domain::{Decimal, TimeMs, TokenId, WalletId};
use serde::{Deserialize, Serialize};

/// Trade id stored for the missing leg of a synthetic (dust) lot.
pub const SYNTHETIC_TRADE_ID: &str = "synthetic";

/// How a closed lot's exit is classified from its PnL percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Manual,
    Dust,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::Manual => "manual",
            ExitReason::Dust => "dust",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "take_profit" => Some(ExitReason::TakeProfit),
            "stop_loss" => Some(ExitReason::StopLoss),
            "manual" => Some(ExitReason::Manual),
            "dust" => Some(ExitReason::Dust),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cycle-level enrichment stamped onto every lot of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotEnrichment {
    pub dca_entry_count: Option<i64>,
    pub dca_time_span_minutes: Option<i64>,
    pub reentry_time_minutes: Option<i64>,
    pub reentry_price_change_percent: Option<Decimal>,
    pub previous_cycle_pnl: Option<Decimal>,
}

/// A fully resolved entry→exit pairing.
///
/// Invariants: `proceeds - cost_basis == realized_pnl`, `size > 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedLot {
    /// Deterministic identity used for idempotent upserts.
    pub lot_key: String,
    pub wallet: WalletId,
    pub token: TokenId,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub entry_time: TimeMs,
    pub exit_time: TimeMs,
    pub hold_time_minutes: i64,
    pub cost_basis: Decimal,
    pub proceeds: Decimal,
    pub realized_pnl: Decimal,
    pub realized_pnl_percent: Decimal,
    /// None for synthetic lots and pre-history sells.
    pub buy_trade_id: Option<String>,
    /// None for synthetic lots.
    pub sell_trade_id: Option<String>,
    pub sequence_number: i64,
    pub is_dust: bool,
    pub cost_known: bool,
    /// A fallback exchange rate was used on either leg.
    pub low_confidence: bool,
    pub exit_reason: ExitReason,
    #[serde(flatten)]
    pub enrichment: LotEnrichment,
}

impl ClosedLot {
    /// Stable key over (wallet, token, buy leg, sell leg).
    ///
    /// A sell consumes a given lot at most once, so the pair of legs is unique per run.
    /// Synthetic legs hash as `synthetic`.
    pub fn compute_lot_key(
        wallet: &WalletId,
        token: &TokenId,
        buy_trade_id: Option<&str>,
        sell_trade_id: Option<&str>,
    ) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(wallet.as_str());
        hasher.update([0u8]);
        hasher.update(token.as_str());
        hasher.update([0u8]);
        hasher.update(buy_trade_id.unwrap_or(SYNTHETIC_TRADE_ID));
        hasher.update([0u8]);
        hasher.update(sell_trade_id.unwrap_or(SYNTHETIC_TRADE_ID));
        let hash = hasher.finalize();
        format!("lot:{}", hex::encode(&hash[..16]))
    }

    /// Hold time in whole seconds, never negative.
    pub fn hold_time_seconds(&self) -> i64 {
        self.entry_time.seconds_until(self.exit_time)
    }
}
