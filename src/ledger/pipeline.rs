//! Per-pair computation: raw trades in, closed lots out.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{RawTrade, TimeMs, TokenId, TradeOrderingKey, WalletId};
use crate::engine::{LotMatcher, MatchOutcome, MatchPolicy};
use crate::error::TradeAnomaly;
use crate::normalize::Normalizer;
use crate::pricing::{ConverterPolicy, ConverterStats, CurrencyConverter, PriceOracle};

/// Result of folding a pair's full trade history.
#[derive(Debug, Clone)]
pub struct PairComputation {
    pub wallet: WalletId,
    pub token: TokenId,
    pub outcome: MatchOutcome,
    /// Ordering keys of every event admitted into the matcher, ascending.
    pub event_keys: Vec<TradeOrderingKey>,
    /// Normalizer, converter and matcher anomalies, in that order.
    pub anomalies: Vec<TradeAnomaly>,
    pub converter_stats: ConverterStats,
}

impl PairComputation {
    /// Number of admitted events at or before `key`.
    pub fn events_through(&self, key: &TradeOrderingKey) -> usize {
        self.event_keys.partition_point(|k| k <= key)
    }
}

/// Stateless description of how a pair is computed; each `compute` call owns its
/// converter and matcher.
#[derive(Debug, Clone)]
pub struct LedgerPipeline {
    normalizer: Normalizer,
    oracle: Arc<dyn PriceOracle>,
    converter_policy: ConverterPolicy,
    match_policy: MatchPolicy,
}

impl LedgerPipeline {
    pub fn new(
        normalizer: Normalizer,
        oracle: Arc<dyn PriceOracle>,
        converter_policy: ConverterPolicy,
        match_policy: MatchPolicy,
    ) -> Self {
        Self {
            normalizer,
            oracle,
            converter_policy,
            match_policy,
        }
    }

    pub fn from_config(config: &Config, oracle: Arc<dyn PriceOracle>) -> Self {
        Self::new(
            Normalizer::new(config.normalizer_policy()),
            oracle,
            config.converter_policy(),
            config.match_policy(),
        )
    }

    pub fn match_policy(&self) -> &MatchPolicy {
        &self.match_policy
    }

    /// Fold `raw` (any order, any tokens) for one pair.
    ///
    /// `as_of` stamps the exit time of a dust lot, so the same history and `as_of`
    /// always produce the same lots.
    pub async fn compute(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        raw: &[RawTrade],
        as_of: TimeMs,
    ) -> PairComputation {
        let (pending, mut anomalies) = self.normalizer.prepare(raw, Some(token));
        let mut converter =
            CurrencyConverter::new(self.oracle.clone(), self.converter_policy.clone());
        let mut matcher =
            LotMatcher::new(wallet.clone(), token.clone(), self.match_policy.clone());
        let mut event_keys = Vec::with_capacity(pending.len());

        // Rates are resolved inline, in trade order.
        for trade in pending {
            let conversion = match converter
                .convert(&trade.quote_currency, trade.quote_amount, trade.time_ms)
                .await
            {
                Ok(conversion) => conversion,
                Err(reason) => {
                    warn!(
                        wallet = %wallet,
                        token = %token,
                        trade_id = %trade.trade_id,
                        currency = %trade.quote_currency,
                        reason = %reason,
                        "Quote amount not convertible, skipping trade"
                    );
                    anomalies.push(TradeAnomaly::Skippable {
                        trade_id: trade.trade_id,
                        reason,
                    });
                    continue;
                }
            };

            if conversion.degraded {
                anomalies.push(TradeAnomaly::RateUnavailable {
                    trade_id: trade.trade_id.clone(),
                    currency: trade.quote_currency.clone(),
                    fallback_rate: conversion.rate,
                });
            }

            let trade_id = trade.trade_id.clone();
            match self
                .normalizer
                .admit(trade, conversion.amount, conversion.degraded)
            {
                Ok(event) => {
                    event_keys.push(TradeOrderingKey::from_event(&event));
                    matcher.process(&event);
                }
                Err(reason) => {
                    debug!(trade_id = %trade_id, reason = %reason, "Skipping trade");
                    anomalies.push(TradeAnomaly::Skippable { trade_id, reason });
                }
            }
        }

        let current_price = match matcher.dust_candidate() {
            Some(_) => match self.oracle.current_price(token).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(
                        token = %token,
                        error = %e,
                        "Current price lookup failed, dust closes at entry price"
                    );
                    None
                }
            },
            None => None,
        };

        let outcome = matcher.finish(as_of, current_price);
        anomalies.extend(outcome.anomalies.iter().cloned());
        let converter_stats = converter.stats();

        info!(
            wallet = %wallet,
            token = %token,
            trades = outcome.trades_processed,
            closed_lots = outcome.closed_lots.len(),
            open_balance = %outcome.open_balance,
            anomalies = anomalies.len(),
            "Computed closed lots"
        );

        PairComputation {
            wallet: wallet.clone(),
            token: token.clone(),
            outcome,
            event_keys,
            anomalies,
            converter_stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Currency, Decimal};
    use crate::error::SkipReason;
    use crate::normalize::NormalizerPolicy;
    use crate::pricing::MockPriceOracle;
    use std::collections::HashMap;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn pipeline(oracle: MockPriceOracle, fallbacks: &[(&str, &str)]) -> LedgerPipeline {
        let sol = Currency::new("SOL");
        LedgerPipeline::new(
            Normalizer::new(NormalizerPolicy {
                canonical_currency: sol.clone(),
                settlement_currencies: vec![sol.clone(), Currency::new("USDC")],
                min_buy_quote_amount: d("0.001"),
            }),
            Arc::new(oracle),
            ConverterPolicy {
                canonical_currency: sol,
                max_cache_age_minutes: 60,
                fallback_rates: fallbacks
                    .iter()
                    .map(|(c, r)| (Currency::new(c), d(r)))
                    .collect::<HashMap<_, _>>(),
            },
            MatchPolicy::default(),
        )
    }

    fn trade(id: &str, side: &str, amount: &str, quote: &str, ccy: &str, t: i64) -> RawTrade {
        RawTrade::new(
            id,
            WalletId::new("W"),
            TokenId::new("BONK"),
            side,
            d(amount),
            d(quote),
            ccy,
            TimeMs::new(t),
        )
    }

    #[tokio::test]
    async fn test_sorts_and_converts_mixed_currencies() {
        let oracle = MockPriceOracle::new().with_rate("USDC", d("0.01"));
        let p = pipeline(oracle, &[]);
        let raw = vec![
            trade("s1", "sell", "100", "300", "USDC", 2000),
            trade("b1", "buy", "100", "1", "SOL", 1000),
        ];

        let result = p
            .compute(&WalletId::new("W"), &TokenId::new("BONK"), &raw, TimeMs::new(5000))
            .await;

        assert_eq!(result.outcome.closed_lots.len(), 1);
        let lot = &result.outcome.closed_lots[0];
        assert_eq!(lot.cost_basis, d("1"));
        assert_eq!(lot.proceeds, d("3"));
        assert_eq!(lot.realized_pnl, d("2"));
        assert!(!lot.low_confidence);
        assert_eq!(result.event_keys.len(), 2);
        assert!(result.anomalies.is_empty());
    }

    #[tokio::test]
    async fn test_rate_outage_uses_fallback_and_flags_lot() {
        let oracle = MockPriceOracle::new()
            .with_rate("USDC", d("0.01"))
            .failing_after(TimeMs::new(1500));
        let p = pipeline(oracle, &[("USDC", "0.02")]);
        let raw = vec![
            trade("b1", "buy", "100", "1", "SOL", 1000),
            trade("s1", "sell", "100", "300", "USDC", 120_000),
        ];

        let result = p
            .compute(&WalletId::new("W"), &TokenId::new("BONK"), &raw, TimeMs::new(0))
            .await;

        let lot = &result.outcome.closed_lots[0];
        assert!(lot.low_confidence);
        assert_eq!(lot.proceeds, d("6"));
        assert!(matches!(
            result.anomalies[0],
            TradeAnomaly::RateUnavailable { ref trade_id, .. } if trade_id == "s1"
        ));
    }

    #[tokio::test]
    async fn test_missing_rate_skips_trade() {
        let p = pipeline(MockPriceOracle::new(), &[]);
        let raw = vec![trade("b1", "buy", "100", "1", "USDC", 1000)];

        let result = p
            .compute(&WalletId::new("W"), &TokenId::new("BONK"), &raw, TimeMs::new(0))
            .await;

        assert_eq!(result.outcome.trades_processed, 0);
        assert_eq!(
            result.anomalies,
            vec![TradeAnomaly::Skippable {
                trade_id: "b1".to_string(),
                reason: SkipReason::RateUnavailable,
            }]
        );
    }

    #[tokio::test]
    async fn test_large_amounts_complete_without_overflow() {
        let oracle = MockPriceOracle::new().with_rate("USDC", d("1000"));
        let p = pipeline(oracle, &[]);
        let raw = vec![
            trade("b1", "buy", "1000000000000000", "1", "SOL", 1000),
            trade("b2", "buy", "1000000000000000", "1", "SOL", 2000),
            trade("s1", "sell", "2000000000000000", "100000000000000", "SOL", 3000),
            trade("b3", "buy", "1", "1000000000000000000000000000", "USDC", 4000),
        ];

        let result = p
            .compute(&WalletId::new("W"), &TokenId::new("BONK"), &raw, TimeMs::new(0))
            .await;

        let proceeds: Vec<_> = result.outcome.closed_lots.iter().map(|l| l.proceeds).collect();
        assert_eq!(proceeds, vec![d("50000000000000"), d("50000000000000")]);
        assert_eq!(
            result.anomalies,
            vec![TradeAnomaly::Skippable {
                trade_id: "b3".to_string(),
                reason: SkipReason::AmountOverflow,
            }]
        );
    }

    #[tokio::test]
    async fn test_dust_uses_current_price() {
        let oracle = MockPriceOracle::new().with_current_price("BONK", d("0.05"));
        let p = pipeline(oracle, &[]);
        let raw = vec![
            trade("b1", "buy", "100", "1", "SOL", 1000),
            trade("s1", "sell", "99", "2", "SOL", 2000),
        ];

        let result = p
            .compute(&WalletId::new("W"), &TokenId::new("BONK"), &raw, TimeMs::new(9000))
            .await;

        let dust = result.outcome.dust_lot().unwrap();
        assert_eq!(dust.size, d("1"));
        assert_eq!(dust.exit_price, d("0.05"));
        assert_eq!(dust.exit_time, TimeMs::new(9000));
    }

    #[test]
    fn test_events_through() {
        let computation = PairComputation {
            wallet: WalletId::new("W"),
            token: TokenId::new("T"),
            outcome: LotMatcher::new(WalletId::new("W"), TokenId::new("T"), MatchPolicy::default())
                .finish(TimeMs::new(0), None),
            event_keys: vec![
                TradeOrderingKey::new(TimeMs::new(1), crate::domain::Side::Buy, "a"),
                TradeOrderingKey::new(TimeMs::new(2), crate::domain::Side::Sell, "b"),
            ],
            anomalies: Vec::new(),
            converter_stats: ConverterStats::default(),
        };
        let key = TradeOrderingKey::new(TimeMs::new(1), crate::domain::Side::Buy, "a");
        assert_eq!(computation.events_through(&key), 1);
    }
}
