//! FIFO lot matching for one (wallet, token) pair.
//!
//! The matcher is a deterministic fold over time-ordered, currency-normalized
//! trade events. Buys open lots; sells consume the oldest open lots first and
//! emit one closed-lot fragment per lot touched.

use std::collections::VecDeque;

use tracing::{debug, warn};

use super::dust::{build_dust_lot, dust_residual};
use super::{CycleRecord, CycleTracker, Lot, MatchPolicy, UnmatchedSellPolicy};
use crate::domain::{
    ClosedLot, Decimal, Side, TimeMs, TokenId, TradeEvent, TradeOrderingKey, WalletId,
};
use crate::error::TradeAnomaly;

/// Everything a completed matching run produced.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub closed_lots: Vec<ClosedLot>,
    /// Lots still open after dust closing.
    pub open_lots: Vec<Lot>,
    pub anomalies: Vec<TradeAnomaly>,
    /// Sum of all buy sizes ever opened.
    pub total_original_position: Decimal,
    pub open_balance: Decimal,
    /// Sell quantity that exceeded the known open position.
    pub unmatched_quantity: Decimal,
    pub last_trade: Option<TradeOrderingKey>,
    pub trades_processed: usize,
    pub cycles: Vec<CycleRecord>,
}

impl MatchOutcome {
    pub fn dust_lot(&self) -> Option<&ClosedLot> {
        self.closed_lots.iter().find(|lot| lot.is_dust)
    }
}

pub struct LotMatcher {
    wallet: WalletId,
    token: TokenId,
    policy: MatchPolicy,
    open_lots: VecDeque<Lot>,
    total_original_position: Decimal,
    cycles: CycleTracker,

    // Outputs accumulated during processing.
    closed_lots: Vec<ClosedLot>,
    anomalies: Vec<TradeAnomaly>,
    unmatched_quantity: Decimal,
    last_trade: Option<TradeOrderingKey>,
    trades_processed: usize,
}

impl LotMatcher {
    pub fn new(wallet: WalletId, token: TokenId, policy: MatchPolicy) -> Self {
        Self {
            wallet,
            token,
            policy,
            open_lots: VecDeque::new(),
            total_original_position: Decimal::zero(),
            cycles: CycleTracker::new(),
            closed_lots: Vec::new(),
            anomalies: Vec::new(),
            unmatched_quantity: Decimal::zero(),
            last_trade: None,
            trades_processed: 0,
        }
    }

    /// Process a single event.
    ///
    /// Callers must feed events in `TradeOrderingKey` order.
    pub fn process(&mut self, event: &TradeEvent) {
        match event.side {
            Side::Buy => self.process_buy(event),
            Side::Sell => self.process_sell(event),
        }
        self.last_trade = Some(TradeOrderingKey::from_event(event));
        self.trades_processed += 1;
    }

    /// Residual balance that `finish` would close as dust, if any.
    pub fn dust_candidate(&self) -> Option<Decimal> {
        dust_residual(
            self.open_lots.iter(),
            self.total_original_position,
            self.policy.dust_threshold,
        )
    }

    fn process_buy(&mut self, event: &TradeEvent) {
        self.cycles.record_buy(event.time_ms, event.price);
        self.open_lots.push_back(Lot {
            origin_trade_id: Some(event.source_trade_id.clone()),
            remaining_size: event.token_amount,
            remaining_cost: event.quote_amount,
            entry_price: event.price,
            entry_time: event.time_ms,
            cost_known: true,
            rate_degraded: event.rate_degraded,
        });
        self.total_original_position += event.token_amount;
    }

    fn process_sell(&mut self, event: &TradeEvent) {
        let epsilon = self.policy.epsilon;
        let was_open = !self.open_lots.is_empty();
        let mut remaining = event.token_amount;
        let mut allocated = Decimal::zero();
        let mut matched = false;

        // A sell smaller than epsilon still consumes from the oldest lot.
        while remaining.is_positive() && (!matched || remaining > epsilon) {
            let Some(lot) = self.open_lots.front_mut() else {
                break;
            };

            let exhausted = lot.remaining_size - remaining <= epsilon;
            let (consumed, cost_basis) = if exhausted {
                (lot.remaining_size, lot.remaining_cost)
            } else {
                (remaining, partial_cost(lot, remaining))
            };
            lot.remaining_size -= consumed;
            lot.remaining_cost -= cost_basis;
            let origin = lot.clone();
            if exhausted {
                self.open_lots.pop_front();
            }

            remaining -= consumed;
            matched = true;
            // The last fragment of a fully matched sell takes whatever is left so
            // fragment proceeds sum to the sell's settlement value exactly.
            let proceeds = if remaining <= epsilon {
                event.quote_amount - allocated
            } else {
                consumed
                    .mul_div(event.quote_amount, event.token_amount)
                    .unwrap_or_default()
            };
            allocated += proceeds;

            self.emit_fragment(&origin, event, consumed, cost_basis, proceeds);
        }

        if remaining > epsilon || (!matched && remaining.is_positive()) {
            self.handle_unmatched(event, remaining, event.quote_amount - allocated);
        }

        if was_open && self.open_lots.is_empty() {
            debug!(
                wallet = %self.wallet,
                token = %self.token,
                sequence_number = self.cycles.current(),
                "Position fully closed"
            );
            self.cycles.close_cycle(event.time_ms, event.price);
        }
    }

    fn handle_unmatched(&mut self, event: &TradeEvent, quantity: Decimal, proceeds: Decimal) {
        warn!(
            wallet = %self.wallet,
            token = %self.token,
            trade_id = %event.source_trade_id,
            quantity = %quantity,
            "Sell exceeds known open position (pre-history sell)"
        );
        self.unmatched_quantity += quantity;
        self.anomalies.push(TradeAnomaly::UnmatchedSell {
            trade_id: event.source_trade_id.clone(),
            quantity,
        });

        if self.policy.unmatched_sells == UnmatchedSellPolicy::EmitUnknownCost {
            let unknown = Lot {
                origin_trade_id: None,
                remaining_size: quantity,
                remaining_cost: Decimal::zero(),
                entry_price: Decimal::zero(),
                entry_time: event.time_ms,
                cost_known: false,
                rate_degraded: false,
            };
            self.emit_fragment(&unknown, event, quantity, Decimal::zero(), proceeds);
        }
    }

    fn emit_fragment(
        &mut self,
        origin: &Lot,
        sell: &TradeEvent,
        size: Decimal,
        cost_basis: Decimal,
        proceeds: Decimal,
    ) {
        let realized_pnl = proceeds - cost_basis;
        let realized_pnl_percent = realized_pnl.percent_of(cost_basis).unwrap_or_default();
        let exit_reason = self.policy.classify_exit(realized_pnl_percent);

        let lot = ClosedLot {
            lot_key: ClosedLot::compute_lot_key(
                &self.wallet,
                &self.token,
                origin.origin_trade_id.as_deref(),
                Some(&sell.source_trade_id),
            ),
            wallet: self.wallet.clone(),
            token: self.token.clone(),
            size,
            entry_price: origin.entry_price,
            exit_price: sell.price,
            entry_time: origin.entry_time,
            exit_time: sell.time_ms,
            hold_time_minutes: origin.entry_time.minutes_until(sell.time_ms).max(0),
            cost_basis,
            proceeds,
            realized_pnl,
            realized_pnl_percent,
            buy_trade_id: origin.origin_trade_id.clone(),
            sell_trade_id: Some(sell.source_trade_id.clone()),
            sequence_number: self.cycles.current(),
            is_dust: false,
            cost_known: origin.cost_known,
            low_confidence: origin.rate_degraded || sell.rate_degraded,
            exit_reason,
            enrichment: self.cycles.enrichment(),
        };

        self.cycles.record_pnl(realized_pnl);
        self.closed_lots.push(lot);
    }

    /// Close out the run: apply the dust closer and return the outcome.
    ///
    /// `as_of` is the exit time of a dust lot; `current_price` its exit price when known.
    pub fn finish(self, as_of: TimeMs, current_price: Option<Decimal>) -> MatchOutcome {
        let LotMatcher {
            wallet,
            token,
            policy,
            open_lots,
            total_original_position,
            mut cycles,
            mut closed_lots,
            anomalies,
            unmatched_quantity,
            last_trade,
            trades_processed,
        } = self;

        let mut open_lots: Vec<Lot> = open_lots.into_iter().collect();

        let dust = dust_residual(
            open_lots.iter(),
            total_original_position,
            policy.dust_threshold,
        )
        .and_then(|_| build_dust_lot(&wallet, &token, &open_lots, as_of, current_price, &cycles));

        if let Some(dust) = dust {
            debug!(
                wallet = %wallet,
                token = %token,
                size = %dust.size,
                "Closing residual balance as dust"
            );
            cycles.record_pnl(dust.realized_pnl);
            cycles.close_cycle(as_of, dust.exit_price);
            closed_lots.push(dust);
            open_lots.clear();
        }

        let open_balance = open_lots.iter().map(|lot| lot.remaining_size).sum();

        MatchOutcome {
            closed_lots,
            open_lots,
            anomalies,
            total_original_position,
            open_balance,
            unmatched_quantity,
            last_trade,
            trades_processed,
            cycles: cycles.records().cloned().collect(),
        }
    }
}

/// Cost of taking `size` from a lot that stays open: `size * entry_price`, or the
/// lot's remaining cost pro rata when that product is not representable.
fn partial_cost(lot: &Lot, size: Decimal) -> Decimal {
    size.checked_mul(lot.entry_price)
        .or_else(|| size.mul_div(lot.remaining_cost, lot.remaining_size))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Currency, ExitReason};

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn event(id: &str, side: Side, amount: &str, quote: &str, t: i64) -> TradeEvent {
        let token_amount = d(amount);
        let quote_amount = d(quote);
        TradeEvent {
            source_trade_id: id.to_string(),
            token: TokenId::new("TOK"),
            side,
            token_amount,
            quote_amount,
            quote_currency: Currency::new("SOL"),
            price: quote_amount / token_amount,
            time_ms: TimeMs::new(t),
            rate_degraded: false,
        }
    }

    fn matcher() -> LotMatcher {
        LotMatcher::new(WalletId::new("W"), TokenId::new("TOK"), MatchPolicy::default())
    }

    fn run(events: &[TradeEvent]) -> MatchOutcome {
        let mut m = matcher();
        for e in events {
            m.process(e);
        }
        m.finish(TimeMs::new(1_000_000_000), None)
    }

    #[test]
    fn test_example_scenario() {
        let outcome = run(&[
            event("b1", Side::Buy, "100", "100", 0),
            event("b2", Side::Buy, "50", "60", 600_000),
            event("s1", Side::Sell, "120", "180", 1_200_000),
        ]);

        assert_eq!(outcome.closed_lots.len(), 2);
        let a = &outcome.closed_lots[0];
        assert_eq!(a.buy_trade_id.as_deref(), Some("b1"));
        assert_eq!(a.size, d("100"));
        assert_eq!(a.cost_basis, d("100"));
        assert_eq!(a.proceeds, d("150"));
        assert_eq!(a.realized_pnl, d("50"));
        assert_eq!(a.hold_time_minutes, 20);

        let b = &outcome.closed_lots[1];
        assert_eq!(b.buy_trade_id.as_deref(), Some("b2"));
        assert_eq!(b.size, d("20"));
        assert_eq!(b.cost_basis, d("24"));
        assert_eq!(b.proceeds, d("30"));
        assert_eq!(b.realized_pnl, d("6"));
        assert_eq!(b.realized_pnl_percent, d("25"));
        assert_eq!(b.exit_reason, ExitReason::TakeProfit);

        assert_eq!(outcome.open_lots.len(), 1);
        assert_eq!(outcome.open_balance, d("30"));
        assert_eq!(outcome.open_lots[0].entry_price, d("1.2"));
        assert_eq!(outcome.open_lots[0].remaining_cost, d("36"));
        assert_eq!(outcome.total_original_position, d("150"));
    }

    #[test]
    fn test_fifo_consumes_oldest_first() {
        let outcome = run(&[
            event("b1", Side::Buy, "10", "10", 1),
            event("b2", Side::Buy, "10", "20", 2),
            event("s1", Side::Sell, "15", "30", 3),
        ]);
        let sizes: Vec<_> = outcome
            .closed_lots
            .iter()
            .map(|l| (l.buy_trade_id.clone().unwrap(), l.size))
            .collect();
        assert_eq!(
            sizes,
            vec![("b1".to_string(), d("10")), ("b2".to_string(), d("5"))]
        );
    }

    #[test]
    fn test_proceeds_sum_exactly_with_repeating_ratio() {
        let outcome = run(&[
            event("b1", Side::Buy, "1", "1", 1),
            event("b2", Side::Buy, "1", "1", 2),
            event("b3", Side::Buy, "1", "1", 3),
            event("s1", Side::Sell, "3", "10", 4),
        ]);
        let proceeds: Decimal = outcome.closed_lots.iter().map(|l| l.proceeds).sum();
        assert_eq!(proceeds, d("10"));
        for lot in &outcome.closed_lots {
            assert_eq!(lot.proceeds - lot.cost_basis, lot.realized_pnl);
        }
    }

    #[test]
    fn test_exhausted_lot_releases_exact_cost() {
        // Entry price 1/3 does not terminate; the two fragments must still sum to 1.
        let outcome = run(&[
            event("b1", Side::Buy, "3", "1", 1),
            event("s1", Side::Sell, "1", "1", 2),
            event("s2", Side::Sell, "2", "2", 3),
        ]);
        let cost: Decimal = outcome.closed_lots.iter().map(|l| l.cost_basis).sum();
        assert_eq!(cost, d("1"));
        assert!(outcome.open_lots.is_empty());
    }

    #[test]
    fn test_unmatched_sell_dropped_by_default() {
        let outcome = run(&[
            event("b1", Side::Buy, "5", "5", 1),
            event("s1", Side::Sell, "8", "16", 2),
        ]);
        assert_eq!(outcome.closed_lots.len(), 1);
        assert_eq!(outcome.closed_lots[0].size, d("5"));
        assert_eq!(outcome.closed_lots[0].proceeds, d("10"));
        assert_eq!(outcome.unmatched_quantity, d("3"));
        assert_eq!(
            outcome.anomalies,
            vec![TradeAnomaly::UnmatchedSell {
                trade_id: "s1".to_string(),
                quantity: d("3"),
            }]
        );
    }

    #[test]
    fn test_unmatched_sell_emits_unknown_cost_lot() {
        let policy = MatchPolicy {
            unmatched_sells: UnmatchedSellPolicy::EmitUnknownCost,
            ..MatchPolicy::default()
        };
        let mut m = LotMatcher::new(WalletId::new("W"), TokenId::new("TOK"), policy);
        m.process(&event("b1", Side::Buy, "5", "5", 1));
        m.process(&event("s1", Side::Sell, "8", "16", 2));
        let outcome = m.finish(TimeMs::new(10), None);

        assert_eq!(outcome.closed_lots.len(), 2);
        let unknown = &outcome.closed_lots[1];
        assert!(!unknown.cost_known);
        assert_eq!(unknown.buy_trade_id, None);
        assert_eq!(unknown.size, d("3"));
        assert!(unknown.cost_basis.is_zero());
        assert_eq!(unknown.proceeds, d("6"));
        let proceeds: Decimal = outcome.closed_lots.iter().map(|l| l.proceeds).sum();
        assert_eq!(proceeds, d("16"));
    }

    #[test]
    fn test_sell_below_epsilon_still_matches() {
        let outcome = run(&[
            event("b1", Side::Buy, "10", "10", 0),
            event("s1", Side::Sell, "0.0000000005", "0.5", 60_000),
        ]);

        assert_eq!(outcome.closed_lots.len(), 1);
        let lot = &outcome.closed_lots[0];
        assert_eq!(lot.size, d("0.0000000005"));
        assert_eq!(lot.cost_basis, d("0.0000000005"));
        assert_eq!(lot.proceeds, d("0.5"));
        assert_eq!(outcome.open_balance, d("9.9999999995"));
        assert!(outcome.anomalies.is_empty());
    }

    #[test]
    fn test_sell_below_epsilon_without_position_is_unmatched() {
        let outcome = run(&[event("s1", Side::Sell, "0.0000000005", "0.5", 0)]);
        assert!(outcome.closed_lots.is_empty());
        assert_eq!(outcome.unmatched_quantity, d("0.0000000005"));
        assert_eq!(outcome.anomalies.len(), 1);
    }

    #[test]
    fn test_large_amounts_split_without_overflow() {
        let outcome = run(&[
            event("b1", Side::Buy, "1000000000000000", "1", 0),
            event("b2", Side::Buy, "1000000000000000", "1", 1),
            event("s1", Side::Sell, "2000000000000000", "100000000000000", 2),
        ]);
        let proceeds: Vec<_> = outcome.closed_lots.iter().map(|l| l.proceeds).collect();
        assert_eq!(proceeds, vec![d("50000000000000"), d("50000000000000")]);
        assert!(outcome.open_lots.is_empty());
    }

    #[test]
    fn test_partial_cost_falls_back_to_pro_rata() {
        let lot = Lot {
            origin_trade_id: Some("b1".to_string()),
            remaining_size: d("50000000000000000000000000000"),
            remaining_cost: d("50000000000000000000000000000"),
            entry_price: d("2"),
            entry_time: TimeMs::new(0),
            cost_known: true,
            rate_degraded: false,
        };
        assert_eq!(partial_cost(&lot, d("10")), d("20"));
        // 4e28 * 2 is not representable; the lot's cost share is 0.8 of 5e28.
        assert_eq!(
            partial_cost(&lot, d("40000000000000000000000000000")),
            d("40000000000000000000000000000")
        );
    }

    #[test]
    fn test_cycles_advance_on_full_close() {
        let outcome = run(&[
            event("b1", Side::Buy, "10", "10", 0),
            event("s1", Side::Sell, "10", "20", 60_000),
            event("b2", Side::Buy, "10", "25", 360_000),
            event("s2", Side::Sell, "4", "12", 420_000),
        ]);

        let first = &outcome.closed_lots[0];
        assert_eq!(first.sequence_number, 1);
        assert_eq!(first.enrichment.previous_cycle_pnl, None);

        let second = &outcome.closed_lots[1];
        assert_eq!(second.sequence_number, 2);
        assert_eq!(second.enrichment.previous_cycle_pnl, Some(d("10")));
        assert_eq!(second.enrichment.reentry_time_minutes, Some(5));
        assert_eq!(second.enrichment.reentry_price_change_percent, Some(d("25")));
        assert_eq!(outcome.cycles.len(), 1);
    }

    #[test]
    fn test_same_fragments_of_one_sell_share_sequence() {
        let outcome = run(&[
            event("b1", Side::Buy, "1", "1", 0),
            event("b2", Side::Buy, "1", "1", 1),
            event("s1", Side::Sell, "2", "4", 2),
        ]);
        assert!(outcome.closed_lots.iter().all(|l| l.sequence_number == 1));
    }

    #[test]
    fn test_dust_closed_at_finish() {
        let mut m = matcher();
        m.process(&event("b1", Side::Buy, "100", "100", 0));
        m.process(&event("s1", Side::Sell, "99", "198", 60_000));
        assert_eq!(m.dust_candidate(), Some(d("1")));

        let outcome = m.finish(TimeMs::new(120_000), Some(d("3")));
        let dust = outcome.dust_lot().unwrap();
        assert_eq!(dust.size, d("1"));
        assert_eq!(dust.proceeds, d("3"));
        assert_eq!(dust.exit_time, TimeMs::new(120_000));
        assert_eq!(dust.sequence_number, 1);
        assert!(outcome.open_lots.is_empty());
        assert!(outcome.open_balance.is_zero());
        assert_eq!(outcome.cycles.len(), 1);
    }

    #[test]
    fn test_residual_at_threshold_stays_open() {
        let mut m = matcher();
        m.process(&event("b1", Side::Buy, "100", "100", 0));
        m.process(&event("s1", Side::Sell, "98", "196", 60_000));
        assert_eq!(m.dust_candidate(), None);
        let outcome = m.finish(TimeMs::new(120_000), Some(d("3")));
        assert!(outcome.dust_lot().is_none());
        assert_eq!(outcome.open_balance, d("2"));
    }

    #[test]
    fn test_conservation() {
        let events = [
            event("b1", Side::Buy, "7", "7", 0),
            event("b2", Side::Buy, "13", "26", 1),
            event("s1", Side::Sell, "9", "18", 2),
            event("b3", Side::Buy, "5", "4", 3),
            event("s2", Side::Sell, "20", "30", 4),
        ];
        let outcome = run(&events);

        let buys: Decimal = events
            .iter()
            .filter(|e| e.side == Side::Buy)
            .map(|e| e.token_amount)
            .sum();
        let sells: Decimal = events
            .iter()
            .filter(|e| e.side == Side::Sell)
            .map(|e| e.token_amount)
            .sum();
        let closed: Decimal = outcome.closed_lots.iter().map(|l| l.size).sum();

        assert!(closed <= buys);
        assert_eq!(closed + outcome.open_balance, buys);
        assert_eq!(closed, sells - outcome.unmatched_quantity);
        assert_eq!(outcome.trades_processed, 5);
        assert_eq!(
            outcome.last_trade,
            Some(TradeOrderingKey::new(TimeMs::new(4), Side::Sell, "s2"))
        );
    }
}
