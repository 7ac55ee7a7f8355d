//! Price oracle abstraction and the per-run currency converter.

use crate::domain::{Currency, Decimal, TimeMs, TokenId};
use async_trait::async_trait;
use std::fmt;

pub mod birdeye;
pub mod converter;
pub mod mock;

pub use birdeye::BirdeyePriceOracle;
pub use converter::{Conversion, ConverterPolicy, ConverterStats, CurrencyConverter, RateCache};
pub use mock::MockPriceOracle;

/// Historical and current prices, expressed in the canonical settlement unit.
///
/// Implementations own their own retry and rate limiting.
#[async_trait]
pub trait PriceOracle: Send + Sync + fmt::Debug {
    /// Canonical units per one unit of `currency` at `at`.
    ///
    /// `Ok(None)` means the oracle has no data for that instant.
    async fn rate_at(
        &self,
        currency: &Currency,
        at: TimeMs,
    ) -> Result<Option<Decimal>, PriceOracleError>;

    /// Latest price of one `token` in canonical units, if known.
    async fn current_price(&self, token: &TokenId) -> Result<Option<Decimal>, PriceOracleError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PriceOracleError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Rate limited")]
    RateLimited,
    #[error("No price feed configured for {0}")]
    UnknownAsset(String),
}
