//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by domain:
//! - `trades.rs` - Raw trade ingestion and queries
//! - `lots.rs` - Closed lot writes/reads and trade metrics

mod lots;
mod trades;

use crate::datasource::{DataSourceError, TradeSource};
use crate::domain::{
    ClosedLot, Decimal, RawTrade, TimeMs, TokenId, TradeOrderingKey, WalletId,
};
use crate::engine::TradeRealizedMetrics;
use crate::error::LedgerError;
use crate::ledger::{LedgerCommit, LedgerWatermark, LotStore, MetricsSink};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteConnection};
use sqlx::Row;
use std::str::FromStr;
use tracing::warn;

pub(crate) fn parse_decimal_or_default(column: &str, key: &str, value: &str) -> Decimal {
    Decimal::from_str(value).unwrap_or_else(|e| {
        warn!(key = %key, column, value = %value, error = %e, "Failed to parse decimal, using default");
        Decimal::default()
    })
}

/// Repository for database operations.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Ledger state operations
    // =========================================================================

    /// Get the ledger watermark for a wallet and token.
    ///
    /// A pair that was never written returns `LedgerWatermark::empty()`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_ledger_state(
        &self,
        wallet: &WalletId,
        token: &TokenId,
    ) -> Result<LedgerWatermark, sqlx::Error> {
        let row = sqlx::query(
            "SELECT last_trade_key, trade_count, open_balance, version FROM ledger_state WHERE wallet = ? AND token = ?",
        )
        .bind(wallet.as_str())
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(LedgerWatermark::empty());
        };

        let last_trade_key: Option<String> = row.get("last_trade_key");
        let last_trade = last_trade_key.as_deref().and_then(|key| {
            let decoded = TradeOrderingKey::decode(key);
            if decoded.is_none() {
                warn!(wallet = %wallet, token = %token, key, "Malformed watermark key, ignoring");
            }
            decoded
        });
        let open_balance: String = row.get("open_balance");

        Ok(LedgerWatermark {
            last_trade,
            trade_count: row.get("trade_count"),
            open_balance: parse_decimal_or_default("open_balance", token.as_str(), &open_balance),
            version: row.get("version"),
        })
    }

    /// Advance the ledger state if its version still equals `commit.expected_version`.
    ///
    /// Returns false when another writer got there first.
    pub(crate) async fn advance_ledger_state(
        conn: &mut SqliteConnection,
        wallet: &WalletId,
        token: &TokenId,
        commit: &LedgerCommit,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_state (wallet, token, last_trade_key, trade_count, open_balance, version, updated_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(wallet, token) DO UPDATE SET
                last_trade_key = excluded.last_trade_key,
                trade_count = excluded.trade_count,
                open_balance = excluded.open_balance,
                version = excluded.version,
                updated_at_ms = excluded.updated_at_ms
            WHERE ledger_state.version = ?
            "#,
        )
        .bind(wallet.as_str())
        .bind(token.as_str())
        .bind(commit.last_trade.as_ref().map(TradeOrderingKey::encode))
        .bind(commit.trade_count)
        .bind(commit.open_balance.to_canonical_string())
        .bind(commit.expected_version + 1)
        .bind(TimeMs::now().as_ms())
        .bind(commit.expected_version)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TradeSource for Repository {
    async fn fetch_trades(
        &self,
        wallet: &WalletId,
        token: Option<&TokenId>,
    ) -> Result<Vec<RawTrade>, DataSourceError> {
        Ok(self.query_trades(wallet, token).await?)
    }

    async fn list_tokens(&self, wallet: &WalletId) -> Result<Vec<TokenId>, DataSourceError> {
        Ok(self.query_distinct_tokens(wallet).await?)
    }
}

#[async_trait]
impl LotStore for Repository {
    async fn watermark(
        &self,
        wallet: &WalletId,
        token: &TokenId,
    ) -> Result<LedgerWatermark, LedgerError> {
        Ok(self.get_ledger_state(wallet, token).await?)
    }

    async fn replace_closed_lots(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        lots: &[ClosedLot],
        commit: &LedgerCommit,
    ) -> Result<(), LedgerError> {
        self.replace_closed_lots_atomic(wallet, token, lots, commit)
            .await
    }

    async fn append_closed_lots(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        new_lots: &[ClosedLot],
        commit: &LedgerCommit,
    ) -> Result<usize, LedgerError> {
        self.append_closed_lots_atomic(wallet, token, new_lots, commit)
            .await
    }

    async fn current_open_balance(
        &self,
        wallet: &WalletId,
        token: &TokenId,
    ) -> Result<Option<Decimal>, LedgerError> {
        let state = self.get_ledger_state(wallet, token).await?;
        Ok((state.version > 0).then_some(state.open_balance))
    }
}

#[async_trait]
impl MetricsSink for Repository {
    async fn update_trade_realized_metrics(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        metrics: &TradeRealizedMetrics,
    ) -> Result<(), LedgerError> {
        self.upsert_trade_metrics(wallet, token, std::slice::from_ref(metrics), false)
            .await?;
        Ok(())
    }

    async fn update_trade_realized_metrics_batch(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        metrics: &[TradeRealizedMetrics],
        replace: bool,
    ) -> Result<usize, LedgerError> {
        Ok(self
            .upsert_trade_metrics(wallet, token, metrics, replace)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::init_db;
    use crate::domain::Side;
    use tempfile::TempDir;

    pub(super) async fn setup_test_db() -> (Repository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (Repository::new(pool), temp_dir)
    }

    fn commit(expected_version: i64, trade_count: i64) -> LedgerCommit {
        LedgerCommit {
            expected_version,
            last_trade: Some(TradeOrderingKey::new(TimeMs::new(5000), Side::Sell, "sig:9")),
            trade_count,
            open_balance: Decimal::from_i64(30),
        }
    }

    #[tokio::test]
    async fn test_missing_ledger_state_is_empty() {
        let (repo, _temp) = setup_test_db().await;
        let state = repo
            .get_ledger_state(&WalletId::new("W"), &TokenId::new("T"))
            .await
            .unwrap();
        assert_eq!(state, LedgerWatermark::empty());
    }

    #[tokio::test]
    async fn test_advance_and_get_ledger_state() {
        let (repo, _temp) = setup_test_db().await;
        let wallet = WalletId::new("W");
        let token = TokenId::new("T");

        let mut conn = repo.pool().acquire().await.unwrap();
        assert!(Repository::advance_ledger_state(&mut conn, &wallet, &token, &commit(0, 3))
            .await
            .unwrap());
        drop(conn);

        let state = repo.get_ledger_state(&wallet, &token).await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.trade_count, 3);
        assert_eq!(state.open_balance, Decimal::from_i64(30));
        assert_eq!(
            state.last_trade,
            Some(TradeOrderingKey::new(TimeMs::new(5000), Side::Sell, "sig:9"))
        );
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let (repo, _temp) = setup_test_db().await;
        let wallet = WalletId::new("W");
        let token = TokenId::new("T");
        let mut conn = repo.pool().acquire().await.unwrap();

        assert!(Repository::advance_ledger_state(&mut conn, &wallet, &token, &commit(0, 1))
            .await
            .unwrap());
        assert!(!Repository::advance_ledger_state(&mut conn, &wallet, &token, &commit(0, 2))
            .await
            .unwrap());
        assert!(Repository::advance_ledger_state(&mut conn, &wallet, &token, &commit(1, 2))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_open_balance_none_before_first_write() {
        let (repo, _temp) = setup_test_db().await;
        let balance = repo
            .current_open_balance(&WalletId::new("W"), &TokenId::new("T"))
            .await
            .unwrap();
        assert_eq!(balance, None);
    }
}
