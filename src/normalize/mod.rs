//! Trade normalization: the only place loosely typed trade records are interpreted.
//!
//! Validation is split in two around currency conversion. `prepare` does the structural
//! checks and the deterministic sort; `admit` applies the economic checks once the quote
//! amount is in canonical units.

use crate::domain::{
    Currency, Decimal, RawTrade, Side, TimeMs, TokenId, TradeEvent, TradeOrderingKey,
};
use crate::error::{SkipReason, TradeAnomaly};
use std::collections::HashSet;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct NormalizerPolicy {
    pub canonical_currency: Currency,
    pub settlement_currencies: Vec<Currency>,
    /// Buys worth less than this (canonical units) are airdrops or dust transfers.
    pub min_buy_quote_amount: Decimal,
}

/// A structurally valid trade whose quote amount is still in its original currency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTrade {
    pub trade_id: String,
    pub token: TokenId,
    pub side: Side,
    pub token_amount: Decimal,
    pub quote_amount: Decimal,
    pub quote_currency: Currency,
    pub time_ms: TimeMs,
}

impl PendingTrade {
    pub fn ordering_key(&self) -> TradeOrderingKey {
        TradeOrderingKey::new(self.time_ms, self.side, self.trade_id.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    policy: NormalizerPolicy,
}

impl Normalizer {
    pub fn new(policy: NormalizerPolicy) -> Self {
        Self { policy }
    }

    /// Validate and order raw trades, optionally restricted to one token.
    ///
    /// Output is in `TradeOrderingKey` order: ascending by time, buys before sells on
    /// equal timestamps, then by trade id. A trade id seen again after its first valid
    /// occurrence in that order is skipped as a duplicate.
    pub fn prepare(
        &self,
        raw: &[RawTrade],
        token: Option<&TokenId>,
    ) -> (Vec<PendingTrade>, Vec<TradeAnomaly>) {
        let mut pending = Vec::with_capacity(raw.len());
        let mut anomalies = Vec::new();

        for trade in raw {
            if token.is_some_and(|t| *t != trade.token) {
                continue;
            }
            match self.validate(trade) {
                Ok(p) => pending.push(p),
                Err(reason) => {
                    debug!(trade_id = %trade.trade_id, reason = %reason, "Skipping trade");
                    anomalies.push(TradeAnomaly::Skippable {
                        trade_id: trade.trade_id.clone(),
                        reason,
                    });
                }
            }
        }

        pending.sort_by_cached_key(PendingTrade::ordering_key);

        let mut seen = HashSet::with_capacity(pending.len());
        pending.retain(|trade: &PendingTrade| {
            if seen.insert(trade.trade_id.clone()) {
                return true;
            }
            warn!(trade_id = %trade.trade_id, "Duplicate trade id, keeping the earliest");
            anomalies.push(TradeAnomaly::Skippable {
                trade_id: trade.trade_id.clone(),
                reason: SkipReason::DuplicateTradeId,
            });
            false
        });

        (pending, anomalies)
    }

    fn validate(&self, trade: &RawTrade) -> Result<PendingTrade, SkipReason> {
        if trade.is_void {
            return Err(SkipReason::Void);
        }

        let side = parse_side(&trade.side)?;

        if !trade.token_amount.is_positive() || !trade.quote_amount.is_positive() {
            return Err(SkipReason::NonPositiveAmount);
        }

        let quote_currency = Currency::new(&trade.quote_currency);
        if !self.policy.settlement_currencies.contains(&quote_currency) {
            return Err(SkipReason::UnrecognizedCurrency);
        }

        Ok(PendingTrade {
            trade_id: trade.trade_id.clone(),
            token: trade.token.clone(),
            side,
            token_amount: trade.token_amount,
            quote_amount: trade.quote_amount,
            quote_currency,
            time_ms: trade.time_ms,
        })
    }

    /// Turn a converted trade into a `TradeEvent`, applying the economic checks.
    pub fn admit(
        &self,
        pending: PendingTrade,
        canonical_quote: Decimal,
        rate_degraded: bool,
    ) -> Result<TradeEvent, SkipReason> {
        if pending.side == Side::Buy && canonical_quote < self.policy.min_buy_quote_amount {
            return Err(SkipReason::BelowMinQuote);
        }

        let price = canonical_quote
            .checked_div(pending.token_amount)
            .filter(|p| p.is_positive())
            .ok_or(SkipReason::NonPositivePrice)?;

        Ok(TradeEvent {
            source_trade_id: pending.trade_id,
            token: pending.token,
            side: pending.side,
            token_amount: pending.token_amount,
            quote_amount: canonical_quote,
            quote_currency: pending.quote_currency,
            price,
            time_ms: pending.time_ms,
            rate_degraded,
        })
    }
}

fn parse_side(raw: &str) -> Result<Side, SkipReason> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        "transfer" | "receive" | "send" => Err(SkipReason::TransferOnly),
        _ => Err(SkipReason::MalformedSide),
    }
}
