//! Domain types and determinism layer for the lot ledger.
//!
//! This module provides:
//! - Lossless numeric handling via Decimal wrapper
//! - Domain primitives: TimeMs, WalletId, TokenId, Currency, Side
//! - RawTrade / TradeEvent and the ClosedLot output record
//! - Stable trade ordering key for deterministic matching

pub mod closed_lot;
pub mod decimal;
pub mod ordering;
pub mod primitives;
pub mod trade;

pub use closed_lot::{ClosedLot, ExitReason, LotEnrichment, SYNTHETIC_TRADE_ID};
pub use decimal::Decimal;
pub use ordering::TradeOrderingKey;
pub use primitives::{Currency, Side, TimeMs, TokenId, WalletId};
pub use trade::{RawTrade, TradeEvent};
