//! Raw trade operations for the repository.

use crate::domain::{RawTrade, TimeMs, TokenId, WalletId};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{parse_decimal_or_default, Repository};

fn trade_from_row(row: &SqliteRow) -> RawTrade {
    let trade_id: String = row.get("trade_id");
    let token_amount: String = row.get("token_amount");
    let quote_amount: String = row.get("quote_amount");
    let is_void: i64 = row.get("is_void");

    RawTrade {
        token_amount: parse_decimal_or_default("token_amount", &trade_id, &token_amount),
        quote_amount: parse_decimal_or_default("quote_amount", &trade_id, &quote_amount),
        wallet: WalletId::new(row.get::<String, _>("wallet")),
        token: TokenId::new(row.get::<String, _>("token")),
        side: row.get("side"),
        quote_currency: row.get("quote_currency"),
        time_ms: TimeMs::new(row.get("time_ms")),
        is_void: is_void != 0,
        trade_id,
    }
}

impl Repository {
    /// Insert a trade into the database idempotently.
    ///
    /// Returns false when a trade with the same id already exists.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn insert_trade(&self, trade: &RawTrade) -> Result<bool, sqlx::Error> {
        Ok(self.insert_trades_batch(std::slice::from_ref(trade)).await? > 0)
    }

    /// Insert multiple trades in a single transaction.
    ///
    /// Returns the number of newly inserted trades (excludes duplicates).
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn insert_trades_batch(&self, trades: &[RawTrade]) -> Result<usize, sqlx::Error> {
        if trades.is_empty() {
            return Ok(0);
        }

        let ingested_at = TimeMs::now().as_ms();
        let mut total_inserted = 0usize;
        let mut tx = self.pool.begin().await?;

        for trade in trades {
            let result = sqlx::query(
                r#"
                INSERT INTO raw_trades (
                    trade_id, wallet, token, side, token_amount, quote_amount,
                    quote_currency, time_ms, is_void, ingested_at_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(trade_id) DO NOTHING
                "#,
            )
            .bind(trade.trade_id.as_str())
            .bind(trade.wallet.as_str())
            .bind(trade.token.as_str())
            .bind(trade.side.as_str())
            .bind(trade.token_amount.to_canonical_string())
            .bind(trade.quote_amount.to_canonical_string())
            .bind(trade.quote_currency.as_str())
            .bind(trade.time_ms.as_ms())
            .bind(trade.is_void)
            .bind(ingested_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                total_inserted += 1;
            }
        }

        tx.commit().await?;
        Ok(total_inserted)
    }

    /// Query a wallet's trades, optionally for one token, ordered by (time_ms, trade_id).
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_trades(
        &self,
        wallet: &WalletId,
        token: Option<&TokenId>,
    ) -> Result<Vec<RawTrade>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT trade_id, wallet, token, side, token_amount, quote_amount,
                   quote_currency, time_ms, is_void
            FROM raw_trades
            WHERE wallet = ? AND (? IS NULL OR token = ?)
            ORDER BY time_ms ASC, trade_id ASC
            "#,
        )
        .bind(wallet.as_str())
        .bind(token.map(TokenId::as_str))
        .bind(token.map(TokenId::as_str))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(trade_from_row).collect())
    }

    /// Distinct tokens a wallet has trades for, sorted.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_distinct_tokens(
        &self,
        wallet: &WalletId,
    ) -> Result<Vec<TokenId>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT DISTINCT token FROM raw_trades WHERE wallet = ? ORDER BY token ASC",
        )
        .bind(wallet.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| TokenId::new(row.get::<String, _>("token")))
            .collect())
    }

    /// Distinct wallets with any stored trades, sorted.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_distinct_wallets(&self) -> Result<Vec<WalletId>, sqlx::Error> {
        let rows = sqlx::query("SELECT DISTINCT wallet FROM raw_trades ORDER BY wallet ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| WalletId::new(row.get::<String, _>("wallet")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::setup_test_db;
    use crate::domain::{Decimal, RawTrade, TimeMs, TokenId, WalletId};

    fn trade(id: &str, token: &str, t: i64) -> RawTrade {
        RawTrade::new(
            id,
            WalletId::new("W1"),
            TokenId::new(token),
            "buy",
            Decimal::from_str_canonical("1000.50").unwrap(),
            Decimal::from_str_canonical("0.25").unwrap(),
            "SOL",
            TimeMs::new(t),
        )
    }

    #[tokio::test]
    async fn test_insert_and_query_trades() {
        let (repo, _temp) = setup_test_db().await;
        let inserted = repo
            .insert_trades_batch(&[
                trade("b", "BONK", 2000),
                trade("a", "BONK", 1000),
                trade("c", "WIF", 500),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 3);

        let wallet = WalletId::new("W1");
        let bonk = repo
            .query_trades(&wallet, Some(&TokenId::new("BONK")))
            .await
            .unwrap();
        assert_eq!(bonk.len(), 2);
        assert_eq!(bonk[0], trade("a", "BONK", 1000));

        let all = repo.query_trades(&wallet, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].trade_id, "c");
    }

    #[tokio::test]
    async fn test_duplicate_trade_ignored() {
        let (repo, _temp) = setup_test_db().await;
        let t = trade("sig1", "BONK", 1000).voided();
        assert!(repo.insert_trade(&t).await.unwrap());
        assert!(!repo.insert_trade(&t).await.unwrap());

        let stored = repo.query_trades(&WalletId::new("W1"), None).await.unwrap();
        assert_eq!(stored, vec![t]);
    }

    #[tokio::test]
    async fn test_distinct_tokens_and_wallets() {
        let (repo, _temp) = setup_test_db().await;
        repo.insert_trades_batch(&[
            trade("1", "WIF", 1),
            trade("2", "BONK", 2),
            trade("3", "WIF", 3),
        ])
        .await
        .unwrap();

        let tokens = repo.query_distinct_tokens(&WalletId::new("W1")).await.unwrap();
        assert_eq!(tokens, vec![TokenId::new("BONK"), TokenId::new("WIF")]);
        let wallets = repo.query_distinct_wallets().await.unwrap();
        assert_eq!(wallets, vec![WalletId::new("W1")]);
    }
}
