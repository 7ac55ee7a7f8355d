//! Raw trade records as delivered by a trade source, and the validated `TradeEvent`.

use crate::domain::{Currency, Decimal, Side, TimeMs, TokenId, WalletId};
use serde::{Deserialize, Serialize};

/// A trade record as stored or fetched, before any validation.
///
/// `side` and `quote_currency` are free-form strings here; they are parsed into
/// closed types by the normalizer and never travel further in this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTrade {
    /// Stable unique identifier for this trade (signature or derived hash).
    pub trade_id: String,
    pub wallet: WalletId,
    pub token: TokenId,
    /// "buy", "sell", "transfer", ...
    pub side: String,
    pub token_amount: Decimal,
    pub quote_amount: Decimal,
    pub quote_currency: String,
    pub time_ms: TimeMs,
    /// Token-for-token swap with no settlement leg.
    #[serde(default)]
    pub is_void: bool,
}

impl RawTrade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trade_id: impl Into<String>,
        wallet: WalletId,
        token: TokenId,
        side: impl Into<String>,
        token_amount: Decimal,
        quote_amount: Decimal,
        quote_currency: impl Into<String>,
        time_ms: TimeMs,
    ) -> Self {
        RawTrade {
            trade_id: trade_id.into(),
            wallet,
            token,
            side: side.into(),
            token_amount,
            quote_amount,
            quote_currency: quote_currency.into(),
            time_ms,
            is_void: false,
        }
    }

    pub fn voided(mut self) -> Self {
        self.is_void = true;
        self
    }

    /// Derive a stable trade id for records that arrive without one.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_trade_id(
        wallet: &WalletId,
        token: &TokenId,
        side: &str,
        token_amount: &Decimal,
        quote_amount: &Decimal,
        quote_currency: &str,
        time_ms: TimeMs,
    ) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(wallet.as_str());
        hasher.update(token.as_str());
        hasher.update(side.to_ascii_lowercase());
        hasher.update(token_amount.to_canonical_string());
        hasher.update(quote_amount.to_canonical_string());
        hasher.update(quote_currency.to_ascii_uppercase());
        hasher.update(time_ms.as_ms().to_le_bytes());
        let hash = hasher.finalize();
        format!("hash:{}", hex::encode(&hash[..16]))
    }
}

/// One validated economic trade, quoted in the canonical currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub source_trade_id: String,
    pub token: TokenId,
    pub side: Side,
    /// Always > 0.
    pub token_amount: Decimal,
    /// Always > 0, canonical unit.
    pub quote_amount: Decimal,
    /// Currency the trade originally settled in.
    pub quote_currency: Currency,
    /// quote_amount / token_amount.
    pub price: Decimal,
    pub time_ms: TimeMs,
    /// The canonical amount was derived from a fallback rate.
    pub rate_degraded: bool,
}
