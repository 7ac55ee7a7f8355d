//! Roll closed lots back up to the trades they came from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{ClosedLot, Decimal, Side};

/// Realized metrics for one buy or sell trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRealizedMetrics {
    pub trade_id: String,
    pub side: Side,
    pub realized_pnl: Decimal,
    /// None when the trade's lots carry no cost basis.
    pub realized_pnl_percent: Option<Decimal>,
    /// Size-weighted average hold time.
    pub hold_time_seconds: i64,
    pub lot_count: i64,
}

#[derive(Debug, Clone)]
struct Accumulator {
    pnl: Decimal,
    cost: Decimal,
    size: Decimal,
    /// `None` once the size-weighted sum stops being representable.
    weighted_hold: Option<Decimal>,
    hold_seconds: i64,
    lot_count: i64,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self {
            pnl: Decimal::zero(),
            cost: Decimal::zero(),
            size: Decimal::zero(),
            weighted_hold: Some(Decimal::zero()),
            hold_seconds: 0,
            lot_count: 0,
        }
    }
}

impl Accumulator {
    /// Size-weighted mean hold, or the plain mean when the weighted sum overflowed.
    fn hold_time_seconds(&self) -> i64 {
        match self.weighted_hold {
            Some(weighted) => weighted
                .checked_div(self.size)
                .map(|d| d.round_dp(0).trunc_i64())
                .unwrap_or(0),
            None if self.lot_count > 0 => self.hold_seconds / self.lot_count,
            None => 0,
        }
    }
}

/// Accumulates per-trade PnL, cost and size-weighted hold time.
///
/// Buy and sell sides are keyed separately; synthetic legs are skipped.
#[derive(Debug, Clone, Default)]
pub struct MetricsAggregator {
    by_trade: BTreeMap<(Side, String), Accumulator>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, lot: &ClosedLot) {
        if let Some(buy) = &lot.buy_trade_id {
            self.accumulate(Side::Buy, buy, lot);
        }
        if let Some(sell) = &lot.sell_trade_id {
            self.accumulate(Side::Sell, sell, lot);
        }
    }

    pub fn extend<'a>(&mut self, lots: impl IntoIterator<Item = &'a ClosedLot>) {
        for lot in lots {
            self.add(lot);
        }
    }

    fn accumulate(&mut self, side: Side, trade_id: &str, lot: &ClosedLot) {
        let acc = self
            .by_trade
            .entry((side, trade_id.to_string()))
            .or_default();
        acc.pnl += lot.realized_pnl;
        acc.cost += lot.cost_basis;
        acc.size += lot.size;
        let hold = lot.hold_time_seconds();
        acc.weighted_hold = acc.weighted_hold.and_then(|weighted| {
            lot.size
                .checked_mul(Decimal::from_i64(hold))
                .and_then(|w| weighted.checked_add(w))
        });
        acc.hold_seconds = acc.hold_seconds.saturating_add(hold);
        acc.lot_count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.by_trade.is_empty()
    }

    /// Metrics for every trade seen, ordered by (side, trade id).
    pub fn finish(self) -> Vec<TradeRealizedMetrics> {
        self.by_trade
            .into_iter()
            .map(|((side, trade_id), acc)| TradeRealizedMetrics {
                trade_id,
                side,
                realized_pnl: acc.pnl,
                realized_pnl_percent: if acc.cost.is_zero() {
                    None
                } else {
                    acc.pnl.percent_of(acc.cost)
                },
                hold_time_seconds: acc.hold_time_seconds(),
                lot_count: acc.lot_count,
            })
            .collect()
    }
}

/// Aggregate a full closed-lot set in one call.
pub fn aggregate_trade_metrics<'a>(
    lots: impl IntoIterator<Item = &'a ClosedLot>,
) -> Vec<TradeRealizedMetrics> {
    let mut aggregator = MetricsAggregator::new();
    aggregator.extend(lots);
    aggregator.finish()
}
