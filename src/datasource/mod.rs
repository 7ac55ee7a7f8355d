//! Trade source abstraction for fetching raw trade records.

use crate::domain::{RawTrade, TokenId, WalletId};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;

pub mod csv;
pub mod mock;

pub use self::csv::CsvTradeSource;
pub use mock::MockTradeSource;

/// Trade source trait for fetching a wallet's raw trade records.
///
/// Records may be returned in any order; the normalizer sorts them.
#[async_trait]
pub trait TradeSource: Send + Sync + fmt::Debug {
    /// Fetch trades for a wallet.
    ///
    /// # Arguments
    /// * `wallet` - Wallet address
    /// * `token` - Restrict to one token mint, or all tokens when `None`
    async fn fetch_trades(
        &self,
        wallet: &WalletId,
        token: Option<&TokenId>,
    ) -> Result<Vec<RawTrade>, DataSourceError>;

    /// Distinct tokens the wallet has traded, in sorted order.
    async fn list_tokens(&self, wallet: &WalletId) -> Result<Vec<TokenId>, DataSourceError> {
        let tokens: BTreeSet<TokenId> = self
            .fetch_trades(wallet, None)
            .await?
            .into_iter()
            .map(|trade| trade.token)
            .collect();
        Ok(tokens.into_iter().collect())
    }
}

/// Error type for trade source operations.
#[derive(Debug, Clone)]
pub enum DataSourceError {
    /// I/O error reading the underlying store or file
    Io(String),
    /// Parsing error (malformed row or record)
    ParseError(String),
    /// Rate limit exceeded (caller should implement backoff)
    RateLimited,
    /// Other error
    Other(String),
}

impl fmt::Display for DataSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSourceError::Io(msg) => write!(f, "I/O error: {}", msg),
            DataSourceError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            DataSourceError::RateLimited => write!(f, "Rate limited"),
            DataSourceError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for DataSourceError {}

impl From<sqlx::Error> for DataSourceError {
    fn from(e: sqlx::Error) -> Self {
        DataSourceError::Io(e.to_string())
    }
}
