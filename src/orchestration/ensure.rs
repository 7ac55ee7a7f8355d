use crate::datasource::{DataSourceError, TradeSource};
use crate::db::Repository;
use crate::domain::{TokenId, WalletId};
use std::sync::Arc;
use thiserror::Error;

/// Copies trades from an external source into the repository.
#[derive(Clone)]
pub struct Ingestor {
    source: Arc<dyn TradeSource>,
    repo: Arc<Repository>,
}

impl Ingestor {
    pub fn new(source: Arc<dyn TradeSource>, repo: Arc<Repository>) -> Self {
        Self { source, repo }
    }

    /// Ensure a wallet's trades (optionally one token's) are stored.
    ///
    /// Idempotent: trades already stored under the same id are left untouched.
    pub async fn ensure_ingested(
        &self,
        wallet: &WalletId,
        token: Option<&TokenId>,
    ) -> Result<IngestionResult, IngestionError> {
        let trades = self.source.fetch_trades(wallet, token).await?;
        let trades_fetched = trades.len();
        let trades_new = self.repo.insert_trades_batch(&trades).await?;

        tracing::info!(
            wallet = %wallet,
            fetched = trades_fetched,
            new = trades_new,
            "Ingested trades"
        );

        Ok(IngestionResult {
            trades_fetched,
            trades_new,
        })
    }

    /// Ingest every wallet in `wallets`, summing the results.
    pub async fn ensure_ingested_all(
        &self,
        wallets: &[WalletId],
    ) -> Result<IngestionResult, IngestionError> {
        let mut total = IngestionResult::default();
        for wallet in wallets {
            let result = self.ensure_ingested(wallet, None).await?;
            total.trades_fetched += result.trades_fetched;
            total.trades_new += result.trades_new;
        }
        Ok(total)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestionResult {
    pub trades_fetched: usize,
    pub trades_new: usize,
}

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error(transparent)]
    TradeSource(#[from] DataSourceError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::MockTradeSource;
    use crate::db::migrations::init_db;
    use crate::domain::{Decimal, RawTrade, TimeMs};
    use tempfile::TempDir;

    async fn setup_repo() -> (Arc<Repository>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (Arc::new(Repository::new(pool)), temp_dir)
    }

    fn make_test_trade(wallet: &str, id: &str, time_ms: i64) -> RawTrade {
        RawTrade::new(
            id,
            WalletId::new(wallet),
            TokenId::new("BONK"),
            "buy",
            Decimal::from_i64(1000),
            Decimal::from_i64(1),
            "SOL",
            TimeMs::new(time_ms),
        )
    }

    #[tokio::test]
    async fn test_ensure_ingested_fetches_and_stores() {
        let source = Arc::new(
            MockTradeSource::new()
                .with_trade(make_test_trade("W1", "t1", 1000))
                .with_trade(make_test_trade("W1", "t2", 2000))
                .with_trade(make_test_trade("W2", "t3", 2000)),
        );

        let (repo, _temp) = setup_repo().await;
        let ingestor = Ingestor::new(source, repo.clone());

        let wallet = WalletId::new("W1");
        let result = ingestor.ensure_ingested(&wallet, None).await.unwrap();
        assert_eq!(result.trades_new, 2);

        let trades = repo.query_trades(&wallet, None).await.unwrap();
        assert_eq!(trades.len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_ingested_is_idempotent() {
        let source = Arc::new(MockTradeSource::new().with_trade(make_test_trade("W1", "t1", 1000)));

        let (repo, _temp) = setup_repo().await;
        let ingestor = Ingestor::new(source, repo);
        let wallet = WalletId::new("W1");

        ingestor.ensure_ingested(&wallet, None).await.unwrap();
        let result2 = ingestor.ensure_ingested(&wallet, None).await.unwrap();

        assert_eq!(result2.trades_fetched, 1);
        assert_eq!(result2.trades_new, 0, "Second run should insert nothing new");
    }

    #[tokio::test]
    async fn test_source_failure_propagates() {
        let source = Arc::new(MockTradeSource::new().failing(DataSourceError::RateLimited));
        let (repo, _temp) = setup_repo().await;
        let ingestor = Ingestor::new(source, repo);

        let result = ingestor.ensure_ingested(&WalletId::new("W1"), None).await;
        assert!(matches!(
            result,
            Err(IngestionError::TradeSource(DataSourceError::RateLimited))
        ));
    }
}
