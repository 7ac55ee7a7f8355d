//! Commit a pair computation through the lot store and metrics sink.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use super::{LedgerCommit, LedgerWatermark, LotStore, MetricsSink, PairComputation};
use crate::domain::{ClosedLot, Side, TradeOrderingKey};
use crate::engine::aggregate_trade_metrics;
use crate::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Replace,
    Append,
    /// Nothing new since the watermark; no write issued.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub mode: WriteMode,
    pub lots_written: usize,
    pub metrics_written: usize,
}

#[derive(Clone)]
pub struct LedgerWriter {
    lots: Arc<dyn LotStore>,
    metrics: Arc<dyn MetricsSink>,
}

/// Ordering key of the sell that closed `lot`; `None` for synthetic lots.
fn sell_key(lot: &ClosedLot) -> Option<TradeOrderingKey> {
    lot.sell_trade_id
        .as_ref()
        .map(|id| TradeOrderingKey::new(lot.exit_time, Side::Sell, id.clone()))
}

fn commit_for(computation: &PairComputation, watermark: &LedgerWatermark) -> LedgerCommit {
    LedgerCommit {
        expected_version: watermark.version,
        last_trade: computation.outcome.last_trade.clone(),
        trade_count: computation.outcome.trades_processed as i64,
        open_balance: computation.outcome.open_balance,
    }
}

impl LedgerWriter {
    pub fn new(lots: Arc<dyn LotStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { lots, metrics }
    }

    pub fn store(&self) -> &Arc<dyn LotStore> {
        &self.lots
    }

    /// Atomically swap the pair's closed lots for `computation`'s, then rewrite its metrics.
    pub async fn replace(
        &self,
        computation: &PairComputation,
        watermark: &LedgerWatermark,
    ) -> Result<WriteSummary, LedgerError> {
        let lots = &computation.outcome.closed_lots;
        self.lots
            .replace_closed_lots(
                &computation.wallet,
                &computation.token,
                lots,
                &commit_for(computation, watermark),
            )
            .await?;

        let metrics = aggregate_trade_metrics(lots);
        let metrics_written = self
            .metrics
            .update_trade_realized_metrics_batch(
                &computation.wallet,
                &computation.token,
                &metrics,
                true,
            )
            .await?;

        info!(
            wallet = %computation.wallet,
            token = %computation.token,
            lots = lots.len(),
            metrics = metrics_written,
            "Replaced closed lots"
        );

        Ok(WriteSummary {
            mode: WriteMode::Replace,
            lots_written: lots.len(),
            metrics_written,
        })
    }

    /// Append the lots produced after `watermark`.
    ///
    /// `computation` must cover the pair's full history. Falls back to `replace`
    /// when the pair was never written or a trade arrived at or before the watermark.
    pub async fn append(
        &self,
        computation: &PairComputation,
        watermark: &LedgerWatermark,
    ) -> Result<WriteSummary, LedgerError> {
        if watermark.version == 0 {
            return self.replace(computation, watermark).await;
        }

        let last = watermark.last_trade.as_ref();
        let folded = last.map_or(0, |key| computation.events_through(key));
        if folded as i64 != watermark.trade_count {
            warn!(
                wallet = %computation.wallet,
                token = %computation.token,
                expected = watermark.trade_count,
                found = folded,
                "Trades changed at or before the watermark, recalculating in full"
            );
            return self.replace(computation, watermark).await;
        }

        if computation.outcome.last_trade.as_ref() == last {
            return Ok(WriteSummary {
                mode: WriteMode::Unchanged,
                lots_written: 0,
                metrics_written: 0,
            });
        }

        let new_lots: Vec<ClosedLot> = computation
            .outcome
            .closed_lots
            .iter()
            .filter(|lot| match (sell_key(lot), last) {
                (Some(key), Some(last)) => key > *last,
                _ => true,
            })
            .cloned()
            .collect();

        let lots_written = self
            .lots
            .append_closed_lots(
                &computation.wallet,
                &computation.token,
                &new_lots,
                &commit_for(computation, watermark),
            )
            .await?;

        // Metrics of touched trades are recomputed over the whole lot set, since a
        // buy may have been partly consumed before the watermark.
        let touched: BTreeSet<(Side, &str)> = new_lots
            .iter()
            .flat_map(|lot| {
                let buy = lot.buy_trade_id.as_deref().map(|id| (Side::Buy, id));
                let sell = lot.sell_trade_id.as_deref().map(|id| (Side::Sell, id));
                buy.into_iter().chain(sell)
            })
            .collect();
        let metrics: Vec<_> = aggregate_trade_metrics(&computation.outcome.closed_lots)
            .into_iter()
            .filter(|m| touched.contains(&(m.side, m.trade_id.as_str())))
            .collect();
        let metrics_written = self
            .metrics
            .update_trade_realized_metrics_batch(
                &computation.wallet,
                &computation.token,
                &metrics,
                false,
            )
            .await?;

        info!(
            wallet = %computation.wallet,
            token = %computation.token,
            lots = lots_written,
            metrics = metrics_written,
            "Appended closed lots"
        );

        Ok(WriteSummary {
            mode: WriteMode::Append,
            lots_written,
            metrics_written,
        })
    }
}
