//! Pure computation engine for deterministic lot matching.

use crate::domain::{Decimal, ExitReason, TimeMs};

pub mod cycle;
pub mod dust;
pub mod lot_matcher;
pub mod metrics;

pub use cycle::{CycleRecord, CycleTracker};
pub use lot_matcher::{LotMatcher, MatchOutcome};
pub use metrics::{aggregate_trade_metrics, MetricsAggregator, TradeRealizedMetrics};

/// An open FIFO lot. Working state of the matcher only; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lot {
    /// Buy trade that opened the lot; None for a lot standing in for pre-history tokens.
    pub origin_trade_id: Option<String>,
    pub remaining_size: Decimal,
    /// Cost still attributed to `remaining_size`.
    pub remaining_cost: Decimal,
    pub entry_price: Decimal,
    pub entry_time: TimeMs,
    /// False only for tokens whose acquisition predates tracking.
    pub cost_known: bool,
    pub rate_degraded: bool,
}

/// What to do with the part of a sell that exceeds the known open position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnmatchedSellPolicy {
    /// Exclude it from closed lots and report a pre-history sell.
    #[default]
    Drop,
    /// Emit a closed lot with `cost_known = false` and zero cost basis.
    EmitUnknownCost,
}

#[derive(Debug, Clone)]
pub struct MatchPolicy {
    /// Residual balance / total historical position below which the residual is dust.
    pub dust_threshold: Decimal,
    /// Quantities at or below this are treated as zero.
    pub epsilon: Decimal,
    pub unmatched_sells: UnmatchedSellPolicy,
    /// PnL percent at or above which an exit is a take-profit (0: any gain).
    pub take_profit_pct: Decimal,
    /// Loss percent at or above which an exit is a stop-loss (0: any loss).
    pub stop_loss_pct: Decimal,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            dust_threshold: Decimal::from_str_canonical("0.02").unwrap_or_default(),
            epsilon: Decimal::from_str_canonical("0.000000001").unwrap_or_default(),
            unmatched_sells: UnmatchedSellPolicy::Drop,
            take_profit_pct: Decimal::zero(),
            stop_loss_pct: Decimal::zero(),
        }
    }
}

impl MatchPolicy {
    pub fn classify_exit(&self, pnl_percent: Decimal) -> ExitReason {
        if pnl_percent.is_positive() && pnl_percent >= self.take_profit_pct {
            ExitReason::TakeProfit
        } else if pnl_percent.is_negative() && pnl_percent.abs() >= self.stop_loss_pct {
            ExitReason::StopLoss
        } else {
            ExitReason::Manual
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_default_policy() {
        let policy = MatchPolicy::default();
        assert_eq!(policy.dust_threshold, d("0.02"));
        assert_eq!(policy.unmatched_sells, UnmatchedSellPolicy::Drop);
    }

    #[test]
    fn test_classify_exit_by_sign_when_thresholds_zero() {
        let policy = MatchPolicy::default();
        assert_eq!(policy.classify_exit(d("0.1")), ExitReason::TakeProfit);
        assert_eq!(policy.classify_exit(d("-0.1")), ExitReason::StopLoss);
        assert_eq!(policy.classify_exit(Decimal::zero()), ExitReason::Manual);
    }

    #[test]
    fn test_classify_exit_with_thresholds() {
        let policy = MatchPolicy {
            take_profit_pct: d("20"),
            stop_loss_pct: d("10"),
            ..MatchPolicy::default()
        };
        assert_eq!(policy.classify_exit(d("25")), ExitReason::TakeProfit);
        assert_eq!(policy.classify_exit(d("20")), ExitReason::TakeProfit);
        assert_eq!(policy.classify_exit(d("5")), ExitReason::Manual);
        assert_eq!(policy.classify_exit(d("-9.99")), ExitReason::Manual);
        assert_eq!(policy.classify_exit(d("-10")), ExitReason::StopLoss);
    }
}
