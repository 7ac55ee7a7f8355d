//! Mock price oracle for testing without network calls.

use super::{PriceOracle, PriceOracleError};
use crate::domain::{Currency, Decimal, TimeMs, TokenId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Mock oracle with step-function historical rates.
///
/// A rate registered at time `t` applies to every lookup at or after `t` until the
/// next registered point.
#[derive(Debug, Default)]
pub struct MockPriceOracle {
    rates: HashMap<Currency, BTreeMap<TimeMs, Decimal>>,
    current_prices: HashMap<TokenId, Decimal>,
    fail_from: Option<TimeMs>,
    lookups: AtomicUsize,
}

impl MockPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Constant rate for all time.
    pub fn with_rate(self, currency: &str, rate: Decimal) -> Self {
        self.with_rate_at(currency, TimeMs::new(i64::MIN), rate)
    }

    pub fn with_rate_at(mut self, currency: &str, from: TimeMs, rate: Decimal) -> Self {
        self.rates
            .entry(Currency::new(currency))
            .or_default()
            .insert(from, rate);
        self
    }

    pub fn with_current_price(mut self, token: &str, price: Decimal) -> Self {
        self.current_prices.insert(TokenId::new(token), price);
        self
    }

    /// Every rate lookup at or after `from` fails with a network error.
    pub fn failing_after(mut self, from: TimeMs) -> Self {
        self.fail_from = Some(from);
        self
    }

    /// Number of `rate_at` calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceOracle for MockPriceOracle {
    async fn rate_at(
        &self,
        currency: &Currency,
        at: TimeMs,
    ) -> Result<Option<Decimal>, PriceOracleError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        if self.fail_from.is_some_and(|from| at >= from) {
            return Err(PriceOracleError::Network("mock outage".to_string()));
        }

        Ok(self
            .rates
            .get(currency)
            .and_then(|points| points.range(..=at).next_back())
            .map(|(_, rate)| *rate))
    }

    async fn current_price(&self, token: &TokenId) -> Result<Option<Decimal>, PriceOracleError> {
        Ok(self.current_prices.get(token).copied())
    }
}
