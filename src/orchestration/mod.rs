//! Job-level orchestration: trade ingestion and batch ledger runs.

pub mod ensure;
pub mod orchestrator;

pub use ensure::{IngestionError, IngestionResult, Ingestor};
pub use orchestrator::{BatchReport, LedgerService, PairReport};
