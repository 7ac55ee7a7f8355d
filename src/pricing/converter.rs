//! Rescales quote amounts into the canonical settlement unit.

use super::PriceOracle;
use crate::domain::{Currency, Decimal, TimeMs};
use crate::error::SkipReason;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ConverterPolicy {
    pub canonical_currency: Currency,
    /// Cached buckets older than this, relative to the newest lookup, are evicted.
    pub max_cache_age_minutes: i64,
    /// Static rates used when neither the oracle nor the cache can answer.
    pub fallback_rates: HashMap<Currency, Decimal>,
}

/// Result of converting one quote amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conversion {
    pub amount: Decimal,
    pub rate: Decimal,
    /// The rate did not come from the oracle for this instant.
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConverterStats {
    pub oracle_lookups: usize,
    pub cache_hits: usize,
    pub fallbacks: usize,
}

/// Rolling (currency, minute-bucket) → rate map.
///
/// Lookups within one run are time-ordered, so eviction only ever drops from the front.
#[derive(Debug, Clone)]
pub struct RateCache {
    max_age_buckets: i64,
    entries: HashMap<(Currency, i64), Decimal>,
    order: VecDeque<(Currency, i64)>,
    newest_bucket: i64,
    last_known: HashMap<Currency, Decimal>,
}

impl RateCache {
    pub fn new(max_age_minutes: i64) -> Self {
        Self {
            max_age_buckets: max_age_minutes.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            newest_bucket: i64::MIN,
            last_known: HashMap::new(),
        }
    }

    pub fn get(&self, currency: &Currency, bucket: i64) -> Option<Decimal> {
        self.entries.get(&(currency.clone(), bucket)).copied()
    }

    pub fn insert(&mut self, currency: &Currency, bucket: i64, rate: Decimal) {
        let key = (currency.clone(), bucket);
        if self.entries.insert(key.clone(), rate).is_none() {
            self.order.push_back(key);
        }
        self.last_known.insert(currency.clone(), rate);
        self.newest_bucket = self.newest_bucket.max(bucket);
        self.evict();
    }

    /// Most recent rate seen for `currency`, even if its bucket has been evicted.
    pub fn last_known(&self, currency: &Currency) -> Option<Decimal> {
        self.last_known.get(currency).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self) {
        let cutoff = self.newest_bucket.saturating_sub(self.max_age_buckets);
        while let Some((_, bucket)) = self.order.front() {
            if *bucket >= cutoff {
                break;
            }
            if let Some(key) = self.order.pop_front() {
                self.entries.remove(&key);
            }
        }
    }
}

/// Converts quote amounts for a single run. Owns its cache; never shared across runs.
#[derive(Debug)]
pub struct CurrencyConverter {
    oracle: Arc<dyn PriceOracle>,
    policy: ConverterPolicy,
    cache: RateCache,
    stats: ConverterStats,
}

impl CurrencyConverter {
    pub fn new(oracle: Arc<dyn PriceOracle>, policy: ConverterPolicy) -> Self {
        let cache = RateCache::new(policy.max_cache_age_minutes);
        Self {
            oracle,
            policy,
            cache,
            stats: ConverterStats::default(),
        }
    }

    pub fn stats(&self) -> ConverterStats {
        self.stats
    }

    /// Convert `amount` of `currency` into canonical units at `at`.
    ///
    /// Oracle failures degrade to the last cached rate for the currency, then to the
    /// configured static rate. Fails with `RateUnavailable` when no rate exists at all
    /// and with `AmountOverflow` when the converted amount is not representable.
    pub async fn convert(
        &mut self,
        currency: &Currency,
        amount: Decimal,
        at: TimeMs,
    ) -> Result<Conversion, SkipReason> {
        if *currency == self.policy.canonical_currency {
            return Ok(Conversion {
                amount,
                rate: Decimal::one(),
                degraded: false,
            });
        }

        let bucket = at.minute_bucket();
        if let Some(rate) = self.cache.get(currency, bucket) {
            self.stats.cache_hits += 1;
            return scaled(amount, rate, false);
        }

        self.stats.oracle_lookups += 1;
        match self.oracle.rate_at(currency, at).await {
            Ok(Some(rate)) if rate.is_positive() => {
                self.cache.insert(currency, bucket, rate);
                return scaled(amount, rate, false);
            }
            Ok(_) => {
                warn!(currency = %currency, at_ms = at.as_ms(), "Oracle returned no usable rate");
            }
            Err(e) => {
                warn!(currency = %currency, at_ms = at.as_ms(), error = %e, "Oracle rate lookup failed");
            }
        }

        let fallback = self
            .cache
            .last_known(currency)
            .or_else(|| self.policy.fallback_rates.get(currency).copied())
            .ok_or(SkipReason::RateUnavailable)?;

        self.stats.fallbacks += 1;
        warn!(
            currency = %currency,
            at_ms = at.as_ms(),
            rate = %fallback,
            "Using fallback rate, converted amount has degraded precision"
        );
        scaled(amount, fallback, true)
    }
}

fn scaled(amount: Decimal, rate: Decimal, degraded: bool) -> Result<Conversion, SkipReason> {
    amount
        .checked_mul(rate)
        .map(|amount| Conversion {
            amount,
            rate,
            degraded,
        })
        .ok_or(SkipReason::AmountOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::MockPriceOracle;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn policy(fallbacks: &[(&str, &str)]) -> ConverterPolicy {
        ConverterPolicy {
            canonical_currency: Currency::new("SOL"),
            max_cache_age_minutes: 60,
            fallback_rates: fallbacks
                .iter()
                .map(|(c, r)| (Currency::new(c), d(r)))
                .collect(),
        }
    }

    #[test]
    fn test_rate_cache_evicts_by_age() {
        let usdc = Currency::new("USDC");
        let mut cache = RateCache::new(60);
        cache.insert(&usdc, 0, d("0.01"));
        cache.insert(&usdc, 30, d("0.011"));
        assert_eq!(cache.len(), 2);

        cache.insert(&usdc, 100, d("0.012"));
        assert_eq!(cache.get(&usdc, 0), None);
        assert_eq!(cache.get(&usdc, 30), None);
        assert_eq!(cache.get(&usdc, 100), Some(d("0.012")));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.last_known(&usdc), Some(d("0.012")));
    }

    #[tokio::test]
    async fn test_canonical_is_identity_without_lookup() {
        let oracle = Arc::new(MockPriceOracle::new());
        let mut converter = CurrencyConverter::new(oracle, policy(&[]));
        let conversion = converter
            .convert(&Currency::new("SOL"), d("12.5"), TimeMs::new(0))
            .await
            .unwrap();
        assert_eq!(conversion.amount, d("12.5"));
        assert!(!conversion.degraded);
        assert_eq!(converter.stats().oracle_lookups, 0);
    }

    #[tokio::test]
    async fn test_same_minute_served_from_cache() {
        let oracle = Arc::new(MockPriceOracle::new().with_rate("USDC", d("0.005")));
        let mut converter = CurrencyConverter::new(oracle, policy(&[]));
        let usdc = Currency::new("USDC");

        let first = converter
            .convert(&usdc, d("100"), TimeMs::new(1_000))
            .await
            .unwrap();
        let second = converter
            .convert(&usdc, d("200"), TimeMs::new(59_000))
            .await
            .unwrap();

        assert_eq!(first.amount, d("0.5"));
        assert_eq!(second.amount, d("1"));
        assert_eq!(converter.stats().oracle_lookups, 1);
        assert_eq!(converter.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_oracle_failure_uses_last_cached_rate() {
        let oracle = Arc::new(
            MockPriceOracle::new()
                .with_rate_at("USDC", TimeMs::new(0), d("0.005"))
                .failing_after(TimeMs::new(60_000)),
        );
        let mut converter = CurrencyConverter::new(oracle, policy(&[("USDC", "0.9")]));
        let usdc = Currency::new("USDC");

        converter.convert(&usdc, d("1"), TimeMs::new(0)).await.unwrap();
        let degraded = converter
            .convert(&usdc, d("100"), TimeMs::new(120_000))
            .await
            .unwrap();

        assert!(degraded.degraded);
        assert_eq!(degraded.rate, d("0.005"));
        assert_eq!(converter.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_oracle_miss_uses_static_fallback() {
        let oracle = Arc::new(MockPriceOracle::new());
        let mut converter = CurrencyConverter::new(oracle, policy(&[("USDT", "0.006")]));
        let conversion = converter
            .convert(&Currency::new("USDT"), d("10"), TimeMs::new(0))
            .await
            .unwrap();
        assert!(conversion.degraded);
        assert_eq!(conversion.amount, d("0.06"));
    }

    #[tokio::test]
    async fn test_no_rate_anywhere_is_rate_unavailable() {
        let oracle = Arc::new(MockPriceOracle::new());
        let mut converter = CurrencyConverter::new(oracle, policy(&[]));
        let conversion = converter
            .convert(&Currency::new("USDT"), d("10"), TimeMs::new(0))
            .await;
        assert_eq!(conversion, Err(SkipReason::RateUnavailable));
    }

    #[tokio::test]
    async fn test_unrepresentable_amount_is_skipped_not_panicked() {
        let oracle = Arc::new(MockPriceOracle::new().with_rate("USDC", d("1000")));
        let mut converter = CurrencyConverter::new(oracle, policy(&[("USDT", "1000")]));
        let huge = d("1000000000000000000000000000");

        let live = converter
            .convert(&Currency::new("USDC"), huge, TimeMs::new(0))
            .await;
        assert_eq!(live, Err(SkipReason::AmountOverflow));

        // Second lookup in the same minute hits the cache.
        let cached = converter
            .convert(&Currency::new("USDC"), huge, TimeMs::new(1_000))
            .await;
        assert_eq!(cached, Err(SkipReason::AmountOverflow));

        let fallback = converter
            .convert(&Currency::new("USDT"), huge, TimeMs::new(0))
            .await;
        assert_eq!(fallback, Err(SkipReason::AmountOverflow));
    }
}
