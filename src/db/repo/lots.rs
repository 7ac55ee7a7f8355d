//! Closed lot and trade metrics operations for the repository.

use crate::domain::{
    ClosedLot, Decimal, ExitReason, LotEnrichment, Side, TimeMs, TokenId, WalletId,
};
use crate::engine::TradeRealizedMetrics;
use crate::error::LedgerError;
use crate::ledger::LedgerCommit;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use tracing::warn;

use super::{parse_decimal_or_default, Repository};

async fn insert_lot(
    conn: &mut SqliteConnection,
    lot: &ClosedLot,
) -> Result<u64, sqlx::Error> {
    let enrichment = &lot.enrichment;
    let result = sqlx::query(
        r#"
        INSERT INTO closed_lots (
            lot_key, wallet, token, size, entry_price, exit_price,
            entry_time_ms, exit_time_ms, hold_time_minutes, cost_basis, proceeds,
            realized_pnl, realized_pnl_percent, buy_trade_id, sell_trade_id,
            sequence_number, is_dust, cost_known, low_confidence, exit_reason,
            dca_entry_count, dca_time_span_minutes, reentry_time_minutes,
            reentry_price_change_percent, previous_cycle_pnl
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(lot_key) DO UPDATE SET
            size = excluded.size,
            entry_price = excluded.entry_price,
            exit_price = excluded.exit_price,
            entry_time_ms = excluded.entry_time_ms,
            exit_time_ms = excluded.exit_time_ms,
            hold_time_minutes = excluded.hold_time_minutes,
            cost_basis = excluded.cost_basis,
            proceeds = excluded.proceeds,
            realized_pnl = excluded.realized_pnl,
            realized_pnl_percent = excluded.realized_pnl_percent,
            sequence_number = excluded.sequence_number,
            is_dust = excluded.is_dust,
            cost_known = excluded.cost_known,
            low_confidence = excluded.low_confidence,
            exit_reason = excluded.exit_reason,
            dca_entry_count = excluded.dca_entry_count,
            dca_time_span_minutes = excluded.dca_time_span_minutes,
            reentry_time_minutes = excluded.reentry_time_minutes,
            reentry_price_change_percent = excluded.reentry_price_change_percent,
            previous_cycle_pnl = excluded.previous_cycle_pnl
        "#,
    )
    .bind(lot.lot_key.as_str())
    .bind(lot.wallet.as_str())
    .bind(lot.token.as_str())
    .bind(lot.size.to_canonical_string())
    .bind(lot.entry_price.to_canonical_string())
    .bind(lot.exit_price.to_canonical_string())
    .bind(lot.entry_time.as_ms())
    .bind(lot.exit_time.as_ms())
    .bind(lot.hold_time_minutes)
    .bind(lot.cost_basis.to_canonical_string())
    .bind(lot.proceeds.to_canonical_string())
    .bind(lot.realized_pnl.to_canonical_string())
    .bind(lot.realized_pnl_percent.to_canonical_string())
    .bind(lot.buy_trade_id.as_deref())
    .bind(lot.sell_trade_id.as_deref())
    .bind(lot.sequence_number)
    .bind(lot.is_dust)
    .bind(lot.cost_known)
    .bind(lot.low_confidence)
    .bind(lot.exit_reason.as_str())
    .bind(enrichment.dca_entry_count)
    .bind(enrichment.dca_time_span_minutes)
    .bind(enrichment.reentry_time_minutes)
    .bind(enrichment.reentry_price_change_percent.map(|d| d.to_canonical_string()))
    .bind(enrichment.previous_cycle_pnl.map(|d| d.to_canonical_string()))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

fn lot_from_row(row: &SqliteRow) -> ClosedLot {
    let lot_key: String = row.get("lot_key");
    let decimal = |column: &str| -> Decimal {
        let value: String = row.get(column);
        parse_decimal_or_default(column, &lot_key, &value)
    };
    let optional_decimal = |column: &str| -> Option<Decimal> {
        row.get::<Option<String>, _>(column)
            .map(|value| parse_decimal_or_default(column, &lot_key, &value))
    };

    let exit_reason_str: String = row.get("exit_reason");
    let exit_reason = ExitReason::parse(&exit_reason_str).unwrap_or_else(|| {
        warn!(lot_key = %lot_key, exit_reason = %exit_reason_str, "Unknown exit reason, using manual");
        ExitReason::Manual
    });

    ClosedLot {
        wallet: WalletId::new(row.get::<String, _>("wallet")),
        token: TokenId::new(row.get::<String, _>("token")),
        size: decimal("size"),
        entry_price: decimal("entry_price"),
        exit_price: decimal("exit_price"),
        entry_time: TimeMs::new(row.get("entry_time_ms")),
        exit_time: TimeMs::new(row.get("exit_time_ms")),
        hold_time_minutes: row.get("hold_time_minutes"),
        cost_basis: decimal("cost_basis"),
        proceeds: decimal("proceeds"),
        realized_pnl: decimal("realized_pnl"),
        realized_pnl_percent: decimal("realized_pnl_percent"),
        buy_trade_id: row.get("buy_trade_id"),
        sell_trade_id: row.get("sell_trade_id"),
        sequence_number: row.get("sequence_number"),
        is_dust: row.get::<i64, _>("is_dust") != 0,
        cost_known: row.get::<i64, _>("cost_known") != 0,
        low_confidence: row.get::<i64, _>("low_confidence") != 0,
        exit_reason,
        enrichment: LotEnrichment {
            dca_entry_count: row.get("dca_entry_count"),
            dca_time_span_minutes: row.get("dca_time_span_minutes"),
            reentry_time_minutes: row.get("reentry_time_minutes"),
            reentry_price_change_percent: optional_decimal("reentry_price_change_percent"),
            previous_cycle_pnl: optional_decimal("previous_cycle_pnl"),
        },
        lot_key,
    }
}

impl Repository {
    /// Delete the pair's closed lots and insert `lots`, advancing the ledger state,
    /// all in one transaction.
    ///
    /// # Errors
    /// `PersistenceConflict` if the ledger state moved past `commit.expected_version`;
    /// nothing is written in that case.
    pub async fn replace_closed_lots_atomic(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        lots: &[ClosedLot],
        commit: &LedgerCommit,
    ) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        if !Self::advance_ledger_state(&mut tx, wallet, token, commit).await? {
            return Err(LedgerError::PersistenceConflict {
                wallet: wallet.clone(),
                token: token.clone(),
            });
        }

        sqlx::query("DELETE FROM closed_lots WHERE wallet = ? AND token = ?")
            .bind(wallet.as_str())
            .bind(token.as_str())
            .execute(&mut *tx)
            .await?;

        for lot in lots {
            insert_lot(&mut tx, lot).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Upsert `new_lots` by lot key, superseding any stored dust lot, and advance
    /// the ledger state, all in one transaction.
    ///
    /// Retrying with the same lots rewrites identical rows.
    ///
    /// # Errors
    /// `PersistenceConflict` if the ledger state moved past `commit.expected_version`.
    pub async fn append_closed_lots_atomic(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        new_lots: &[ClosedLot],
        commit: &LedgerCommit,
    ) -> Result<usize, LedgerError> {
        let mut tx = self.pool.begin().await?;

        if !Self::advance_ledger_state(&mut tx, wallet, token, commit).await? {
            return Err(LedgerError::PersistenceConflict {
                wallet: wallet.clone(),
                token: token.clone(),
            });
        }

        sqlx::query("DELETE FROM closed_lots WHERE wallet = ? AND token = ? AND is_dust = 1")
            .bind(wallet.as_str())
            .bind(token.as_str())
            .execute(&mut *tx)
            .await?;

        let mut written = 0usize;
        for lot in new_lots {
            if insert_lot(&mut tx, lot).await? > 0 {
                written += 1;
            }
        }

        tx.commit().await?;
        Ok(written)
    }

    /// Query a pair's closed lots ordered by exit time, then sequence and lot key.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_closed_lots(
        &self,
        wallet: &WalletId,
        token: &TokenId,
    ) -> Result<Vec<ClosedLot>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM closed_lots
            WHERE wallet = ? AND token = ?
            ORDER BY exit_time_ms ASC, sequence_number ASC, lot_key ASC
            "#,
        )
        .bind(wallet.as_str())
        .bind(token.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(lot_from_row).collect())
    }

    /// Upsert per-trade metrics; with `replace`, the pair's existing metrics are
    /// removed first in the same transaction.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn upsert_trade_metrics(
        &self,
        wallet: &WalletId,
        token: &TokenId,
        metrics: &[TradeRealizedMetrics],
        replace: bool,
    ) -> Result<usize, sqlx::Error> {
        let updated_at = TimeMs::now().as_ms();
        let mut tx = self.pool.begin().await?;

        if replace {
            sqlx::query("DELETE FROM trade_metrics WHERE wallet = ? AND token = ?")
                .bind(wallet.as_str())
                .bind(token.as_str())
                .execute(&mut *tx)
                .await?;
        }

        for m in metrics {
            sqlx::query(
                r#"
                INSERT INTO trade_metrics (
                    trade_id, side, wallet, token, realized_pnl, realized_pnl_percent,
                    hold_time_seconds, lot_count, updated_at_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(trade_id, side) DO UPDATE SET
                    realized_pnl = excluded.realized_pnl,
                    realized_pnl_percent = excluded.realized_pnl_percent,
                    hold_time_seconds = excluded.hold_time_seconds,
                    lot_count = excluded.lot_count,
                    updated_at_ms = excluded.updated_at_ms
                "#,
            )
            .bind(m.trade_id.as_str())
            .bind(m.side.to_string())
            .bind(wallet.as_str())
            .bind(token.as_str())
            .bind(m.realized_pnl.to_canonical_string())
            .bind(m.realized_pnl_percent.map(|d| d.to_canonical_string()))
            .bind(m.hold_time_seconds)
            .bind(m.lot_count)
            .bind(updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(metrics.len())
    }

    /// Query a pair's trade metrics ordered by (side, trade_id).
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_trade_metrics(
        &self,
        wallet: &WalletId,
        token: &TokenId,
    ) -> Result<Vec<TradeRealizedMetrics>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT trade_id, side, realized_pnl, realized_pnl_percent, hold_time_seconds, lot_count
            FROM trade_metrics
            WHERE wallet = ? AND token = ?
            ORDER BY side ASC, trade_id ASC
            "#,
        )
        .bind(wallet.as_str())
        .bind(token.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let trade_id: String = row.get("trade_id");
                let side = match row.get::<String, _>("side").as_str() {
                    "sell" => Side::Sell,
                    _ => Side::Buy,
                };
                let pnl: String = row.get("realized_pnl");
                let pnl_percent: Option<String> = row.get("realized_pnl_percent");

                TradeRealizedMetrics {
                    realized_pnl: parse_decimal_or_default("realized_pnl", &trade_id, &pnl),
                    realized_pnl_percent: pnl_percent.map(|p| {
                        parse_decimal_or_default("realized_pnl_percent", &trade_id, &p)
                    }),
                    hold_time_seconds: row.get("hold_time_seconds"),
                    lot_count: row.get("lot_count"),
                    side,
                    trade_id,
                }
            })
            .collect())
    }
}
