//! Round-trip (cycle) numbering and re-entry analytics.

use crate::domain::{Decimal, LotEnrichment, TimeMs};
use std::collections::BTreeMap;

/// Summary of a completed open→flat cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleRecord {
    pub sequence_number: i64,
    pub exit_time: TimeMs,
    pub exit_price: Decimal,
    pub pnl: Decimal,
}

/// Progress of the cycle currently open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CycleProgress {
    first_buy_time: Option<TimeMs>,
    last_buy_time: Option<TimeMs>,
    first_entry_price: Option<Decimal>,
    buy_count: i64,
    pnl: Decimal,
}

/// Numbers cycles from 1 and keeps a record of each completed one.
#[derive(Debug, Clone)]
pub struct CycleTracker {
    sequence_number: i64,
    records: BTreeMap<i64, CycleRecord>,
    progress: CycleProgress,
}

impl CycleTracker {
    pub fn new() -> Self {
        Self {
            sequence_number: 1,
            records: BTreeMap::new(),
            progress: CycleProgress::default(),
        }
    }

    /// Sequence number stamped on lots closed right now.
    pub fn current(&self) -> i64 {
        self.sequence_number
    }

    pub fn record_buy(&mut self, time: TimeMs, price: Decimal) {
        let progress = &mut self.progress;
        if progress.first_buy_time.is_none() {
            progress.first_buy_time = Some(time);
            progress.first_entry_price = Some(price);
        }
        progress.last_buy_time = Some(time);
        progress.buy_count += 1;
    }

    pub fn record_pnl(&mut self, pnl: Decimal) {
        self.progress.pnl += pnl;
    }

    /// Record the current cycle as complete and advance the sequence number.
    pub fn close_cycle(&mut self, exit_time: TimeMs, exit_price: Decimal) {
        let record = CycleRecord {
            sequence_number: self.sequence_number,
            exit_time,
            exit_price,
            pnl: self.progress.pnl,
        };
        self.records.insert(self.sequence_number, record);
        self.sequence_number += 1;
        self.progress = CycleProgress::default();
    }

    /// Record of the cycle before the current one, if any.
    pub fn previous(&self) -> Option<&CycleRecord> {
        self.records.get(&(self.sequence_number - 1))
    }

    pub fn records(&self) -> impl Iterator<Item = &CycleRecord> {
        self.records.values()
    }

    /// DCA and re-entry metrics for lots of the current cycle.
    pub fn enrichment(&self) -> LotEnrichment {
        let progress = &self.progress;
        let mut enrichment = LotEnrichment::default();

        if progress.buy_count > 0 {
            enrichment.dca_entry_count = Some(progress.buy_count);
        }
        if let (Some(first), Some(last)) = (progress.first_buy_time, progress.last_buy_time) {
            enrichment.dca_time_span_minutes = Some(first.minutes_until(last));
        }

        if let Some(previous) = self.previous() {
            enrichment.previous_cycle_pnl = Some(previous.pnl);
            if let Some(first) = progress.first_buy_time {
                enrichment.reentry_time_minutes = Some(previous.exit_time.minutes_until(first));
            }
            if let Some(entry) = progress.first_entry_price {
                enrichment.reentry_price_change_percent =
                    (entry - previous.exit_price).percent_of(previous.exit_price);
            }
        }

        enrichment
    }
}

impl Default for CycleTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_first_cycle_has_no_reentry_metrics() {
        let mut tracker = CycleTracker::new();
        tracker.record_buy(TimeMs::new(0), d("1"));
        tracker.record_buy(TimeMs::new(600_000), d("1.2"));

        let enrichment = tracker.enrichment();
        assert_eq!(tracker.current(), 1);
        assert_eq!(enrichment.dca_entry_count, Some(2));
        assert_eq!(enrichment.dca_time_span_minutes, Some(10));
        assert_eq!(enrichment.previous_cycle_pnl, None);
        assert_eq!(enrichment.reentry_time_minutes, None);
    }

    #[test]
    fn test_close_cycle_advances_and_feeds_reentry() {
        let mut tracker = CycleTracker::new();
        tracker.record_buy(TimeMs::new(0), d("1"));
        tracker.record_pnl(d("50"));
        tracker.close_cycle(TimeMs::new(60_000), d("2"));
        assert_eq!(tracker.current(), 2);

        tracker.record_buy(TimeMs::new(360_000), d("2.5"));
        let enrichment = tracker.enrichment();
        assert_eq!(enrichment.dca_entry_count, Some(1));
        assert_eq!(enrichment.previous_cycle_pnl, Some(d("50")));
        assert_eq!(enrichment.reentry_time_minutes, Some(5));
        assert_eq!(enrichment.reentry_price_change_percent, Some(d("25")));

        let records: Vec<_> = tracker.records().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence_number, 1);
        assert_eq!(records[0].exit_price, d("2"));
    }
}
