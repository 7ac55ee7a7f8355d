//! Synthetic closing of negligible residual balances.

use super::{CycleTracker, Lot};
use crate::domain::{ClosedLot, Decimal, ExitReason, TimeMs, TokenId, WalletId};

/// Residual balance if it qualifies as dust: `0 < residual < threshold * total`.
///
/// A residual exactly at the threshold is a genuinely open position.
pub fn dust_residual<'a>(
    open_lots: impl IntoIterator<Item = &'a Lot>,
    total_original_position: Decimal,
    threshold: Decimal,
) -> Option<Decimal> {
    let remaining: Decimal = open_lots.into_iter().map(|lot| lot.remaining_size).sum();
    let limit = threshold.checked_mul(total_original_position)?;
    (remaining.is_positive() && remaining < limit).then_some(remaining)
}

/// Build the synthetic lot closing every remaining open lot.
///
/// Exit price is `current_price` when known, otherwise the weighted entry price,
/// in which case proceeds equal cost basis and PnL is zero.
pub fn build_dust_lot(
    wallet: &WalletId,
    token: &TokenId,
    open_lots: &[Lot],
    as_of: TimeMs,
    current_price: Option<Decimal>,
    cycles: &CycleTracker,
) -> Option<ClosedLot> {
    let size: Decimal = open_lots.iter().map(|lot| lot.remaining_size).sum();
    if !size.is_positive() {
        return None;
    }
    let cost_basis: Decimal = open_lots.iter().map(|lot| lot.remaining_cost).sum();
    let entry_price = cost_basis / size;
    let entry_time = open_lots.iter().map(|lot| lot.entry_time).min()?;

    let priced = current_price
        .filter(|p| p.is_positive())
        .and_then(|price| size.checked_mul(price).map(|proceeds| (price, proceeds)));
    let (exit_price, proceeds) = priced.unwrap_or((entry_price, cost_basis));
    let realized_pnl = proceeds - cost_basis;

    Some(ClosedLot {
        lot_key: ClosedLot::compute_lot_key(wallet, token, None, None),
        wallet: wallet.clone(),
        token: token.clone(),
        size,
        entry_price,
        exit_price,
        entry_time,
        exit_time: as_of,
        hold_time_minutes: entry_time.minutes_until(as_of).max(0),
        cost_basis,
        proceeds,
        realized_pnl,
        realized_pnl_percent: realized_pnl.percent_of(cost_basis).unwrap_or_default(),
        buy_trade_id: None,
        sell_trade_id: None,
        sequence_number: cycles.current(),
        is_dust: true,
        cost_known: open_lots.iter().all(|lot| lot.cost_known),
        low_confidence: priced.is_none() || open_lots.iter().any(|lot| lot.rate_degraded),
        exit_reason: ExitReason::Dust,
        enrichment: cycles.enrichment(),
    })
}
