//! CSV file trade source.
//!
//! Expected header:
//! `trade_id,wallet,token,side,token_amount,quote_amount,quote_currency,time_ms,is_void`
//! where `trade_id` and `is_void` may be empty. A missing trade id is derived
//! from the record's content so repeated imports stay idempotent; the n-th repeat
//! of an identical id-less row gets a `#n` suffix so it stays a distinct trade.

use super::{DataSourceError, TradeSource};
use crate::domain::{Decimal, RawTrade, TimeMs, TokenId, WalletId};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct CsvTradeSource {
    path: PathBuf,
}

impl CsvTradeSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_all(&self) -> Result<Vec<RawTrade>, DataSourceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| DataSourceError::Io(format!("{}: {}", self.path.display(), e)))?;
        Self::parse_csv(&bytes)
    }

    /// Distinct wallets present in the file, sorted.
    pub async fn list_wallets(&self) -> Result<Vec<WalletId>, DataSourceError> {
        let wallets: BTreeSet<WalletId> = self
            .read_all()
            .await?
            .into_iter()
            .map(|trade| trade.wallet)
            .collect();
        Ok(wallets.into_iter().collect())
    }

    pub fn parse_csv(csv_bytes: &[u8]) -> Result<Vec<RawTrade>, DataSourceError> {
        #[derive(Debug, serde::Deserialize)]
        struct Row {
            trade_id: Option<String>,
            wallet: String,
            token: String,
            side: String,
            token_amount: String,
            quote_amount: String,
            quote_currency: String,
            time_ms: i64,
            is_void: Option<bool>,
        }

        let mut reader = ::csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(::csv::Trim::All)
            .from_reader(csv_bytes);

        let mut trades = Vec::new();
        let mut derived_seen: HashMap<String, usize> = HashMap::new();
        for record in reader.deserialize::<Row>() {
            let row = record.map_err(|e| DataSourceError::ParseError(e.to_string()))?;
            let token_amount = Decimal::from_str_canonical(&row.token_amount).map_err(|e| {
                DataSourceError::ParseError(format!("invalid token_amount: {}", e))
            })?;
            let quote_amount = Decimal::from_str_canonical(&row.quote_amount).map_err(|e| {
                DataSourceError::ParseError(format!("invalid quote_amount: {}", e))
            })?;
            let wallet = WalletId::new(row.wallet);
            let token = TokenId::new(row.token);
            let time_ms = TimeMs::new(row.time_ms);

            let trade_id = match row.trade_id.filter(|id| !id.is_empty()) {
                Some(id) => id,
                None => {
                    let derived = RawTrade::compute_trade_id(
                        &wallet,
                        &token,
                        &row.side,
                        &token_amount,
                        &quote_amount,
                        &row.quote_currency,
                        time_ms,
                    );
                    let repeats = derived_seen.entry(derived.clone()).or_insert(0);
                    let id = match *repeats {
                        0 => derived,
                        n => format!("{}#{}", derived, n),
                    };
                    *repeats += 1;
                    id
                }
            };

            let mut trade = RawTrade::new(
                trade_id,
                wallet,
                token,
                row.side,
                token_amount,
                quote_amount,
                row.quote_currency,
                time_ms,
            );
            trade.is_void = row.is_void.unwrap_or(false);
            trades.push(trade);
        }

        Ok(trades)
    }
}

#[async_trait]
impl TradeSource for CsvTradeSource {
    async fn fetch_trades(
        &self,
        wallet: &WalletId,
        token: Option<&TokenId>,
    ) -> Result<Vec<RawTrade>, DataSourceError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|t| &t.wallet == wallet && token.map_or(true, |token| &t.token == token))
            .collect())
    }
}
