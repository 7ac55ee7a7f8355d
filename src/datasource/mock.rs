//! Mock trade source for testing without a database or files.

use super::{DataSourceError, TradeSource};
use crate::domain::{RawTrade, TokenId, WalletId};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Mock trade source that returns predefined trades.
///
/// Clones share the same trade list, so a test can push trades after handing
/// the source to a service.
#[derive(Debug, Clone, Default)]
pub struct MockTradeSource {
    trades: Arc<Mutex<Vec<RawTrade>>>,
    error: Option<DataSourceError>,
}

impl MockTradeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trade(self, trade: RawTrade) -> Self {
        self.push(trade);
        self
    }

    /// Every fetch fails with `error`.
    pub fn failing(mut self, error: DataSourceError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn push(&self, trade: RawTrade) {
        if let Ok(mut trades) = self.trades.lock() {
            trades.push(trade);
        }
    }
}

#[async_trait]
impl TradeSource for MockTradeSource {
    async fn fetch_trades(
        &self,
        wallet: &WalletId,
        token: Option<&TokenId>,
    ) -> Result<Vec<RawTrade>, DataSourceError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }

        let trades = self
            .trades
            .lock()
            .map_err(|e| DataSourceError::Other(e.to_string()))?;

        Ok(trades
            .iter()
            .filter(|t| &t.wallet == wallet && token.map_or(true, |token| &t.token == token))
            .cloned()
            .collect())
    }
}
