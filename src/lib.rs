pub mod config;
pub mod datasource;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod normalize;
pub mod orchestration;
pub mod pricing;

pub use config::{Config, LedgerMode};
pub use datasource::{CsvTradeSource, DataSourceError, MockTradeSource, TradeSource};
pub use db::{init_db, Repository};
pub use domain::{
    ClosedLot, Currency, Decimal, ExitReason, RawTrade, Side, TimeMs, TokenId, TradeEvent,
    WalletId,
};
pub use engine::{LotMatcher, MatchOutcome, MatchPolicy, TradeRealizedMetrics};
pub use error::{LedgerError, SkipReason, TradeAnomaly};
pub use ledger::{LedgerPipeline, LedgerWriter, LotStore, MetricsSink};
pub use orchestration::{BatchReport, Ingestor, LedgerService};
pub use pricing::{BirdeyePriceOracle, MockPriceOracle, PriceOracle};
