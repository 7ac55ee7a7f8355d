use crate::config::LedgerMode;
use crate::datasource::TradeSource;
use crate::db::Repository;
use crate::domain::{Decimal, TimeMs, TokenId, WalletId};
use crate::error::{LedgerError, TradeAnomaly};
use crate::ledger::{LedgerPipeline, LedgerWriter, WriteSummary};
use crate::pricing::ConverterStats;
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Conflicting writes are re-run this many times before the pair is reported failed.
const MAX_CONFLICT_RETRIES: usize = 2;

/// Outcome of one committed (wallet, token) run.
#[derive(Debug, Clone)]
pub struct PairReport {
    pub wallet: WalletId,
    pub token: TokenId,
    pub write: WriteSummary,
    pub closed_lots: usize,
    pub open_balance: Decimal,
    pub unmatched_quantity: Decimal,
    pub anomalies: Vec<TradeAnomaly>,
    pub converter_stats: ConverterStats,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Committed pairs, ordered by (wallet, token).
    pub pairs: Vec<PairReport>,
    pub failures: Vec<(WalletId, TokenId, LedgerError)>,
}

impl BatchReport {
    pub fn anomaly_count(&self) -> usize {
        self.pairs.iter().map(|p| p.anomalies.len()).sum()
    }
}

/// Runs ledger computations for (wallet, token) pairs over a bounded worker pool.
#[derive(Clone)]
pub struct LedgerService {
    source: Arc<dyn TradeSource>,
    pipeline: LedgerPipeline,
    writer: LedgerWriter,
    worker_concurrency: usize,
}

impl LedgerService {
    pub fn new(
        source: Arc<dyn TradeSource>,
        pipeline: LedgerPipeline,
        writer: LedgerWriter,
        worker_concurrency: usize,
    ) -> Self {
        Self {
            source,
            pipeline,
            writer,
            worker_concurrency: worker_concurrency.max(1),
        }
    }

    /// Service reading trades from, and writing lots and metrics to, `repo`.
    pub fn with_repository(
        repo: Arc<Repository>,
        pipeline: LedgerPipeline,
        worker_concurrency: usize,
    ) -> Self {
        let writer = LedgerWriter::new(repo.clone(), repo.clone());
        Self::new(repo, pipeline, writer, worker_concurrency)
    }

    /// Recompute the pair from its full history and replace its closed lots.
    pub async fn recalculate(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        as_of: TimeMs,
    ) -> Result<PairReport, LedgerError> {
        self.run_pair(wallet, token, LedgerMode::Full, as_of).await
    }

    /// Append the closed lots produced since the pair's watermark.
    pub async fn append(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        as_of: TimeMs,
    ) -> Result<PairReport, LedgerError> {
        self.run_pair(wallet, token, LedgerMode::Incremental, as_of)
            .await
    }

    pub async fn run_pair(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        mode: LedgerMode,
        as_of: TimeMs,
    ) -> Result<PairReport, LedgerError> {
        // The watermark is read first so any write that lands while we compute
        // is caught by the version check.
        let watermark = self.writer.store().watermark(wallet, token).await?;
        let trades = self.source.fetch_trades(wallet, Some(token)).await?;
        let computation = self.pipeline.compute(wallet, token, &trades, as_of).await;

        let write = match mode {
            LedgerMode::Full => self.writer.replace(&computation, &watermark).await?,
            LedgerMode::Incremental => self.writer.append(&computation, &watermark).await?,
        };

        Ok(PairReport {
            wallet: wallet.clone(),
            token: token.clone(),
            write,
            closed_lots: computation.outcome.closed_lots.len(),
            open_balance: computation.outcome.open_balance,
            unmatched_quantity: computation.outcome.unmatched_quantity,
            anomalies: computation.anomalies,
            converter_stats: computation.converter_stats,
        })
    }

    async fn run_pair_with_retry(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        mode: LedgerMode,
        as_of: TimeMs,
    ) -> Result<PairReport, LedgerError> {
        let mut attempt = 0;
        loop {
            match self.run_pair(wallet, token, mode, as_of).await {
                Err(e) if e.is_retryable() && attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    tracing::warn!(wallet = %wallet, token = %token, attempt, "Ledger write conflict, retrying");
                }
                result => return result,
            }
        }
    }

    /// Run every token of every wallet. Pairs run concurrently; a failing pair
    /// does not stop the others.
    ///
    /// # Errors
    /// Only a failure to list a wallet's tokens aborts the batch.
    pub async fn run_batch(
        &self,
        wallets: &[WalletId],
        mode: LedgerMode,
        as_of: TimeMs,
    ) -> Result<BatchReport, LedgerError> {
        let mut pairs = BTreeSet::new();
        for wallet in wallets {
            for token in self.source.list_tokens(wallet).await? {
                pairs.insert((wallet.clone(), token));
            }
        }

        tracing::info!(
            pairs = pairs.len(),
            workers = self.worker_concurrency,
            ?mode,
            "Running ledger batch"
        );

        let results: Vec<_> = stream::iter(pairs)
            .map(|(wallet, token)| async move {
                let result = self.run_pair_with_retry(&wallet, &token, mode, as_of).await;
                (wallet, token, result)
            })
            .buffer_unordered(self.worker_concurrency)
            .collect()
            .await;

        let mut report = BatchReport::default();
        for (wallet, token, result) in results {
            match result {
                Ok(pair) => report.pairs.push(pair),
                Err(e) => {
                    tracing::error!(wallet = %wallet, token = %token, error = %e, "Ledger run failed");
                    report.failures.push((wallet, token, e));
                }
            }
        }
        report
            .pairs
            .sort_by(|a, b| (&a.wallet, &a.token).cmp(&(&b.wallet, &b.token)));
        report
            .failures
            .sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

        Ok(report)
    }
}
