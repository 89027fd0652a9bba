//! # Transfer rollup pipeline
//!
//! Storage and the periodic stages that run after ingestion:
//!
//! 1. `aggregator` - pending transfers → 1-minute `transfer_grouped` rows
//! 2. `promoter` - 1m → 5m → 60m promotion along the configured ladder
//! 3. `retention` - per-table deletion of expired rows
//!
//! `scheduler` runs the three in that order, once per cycle, on a single
//! connection. Watchers (see `crate::ingest`) write through `db::IngestSink`
//! on their own connections.
//!
//! ## Schema Reference
//!
//! All row types match the SQL schema in `/sql/`:
//! - `log_entries` → `RawLogRecord`
//! - `transfers` → `TransferRecord`
//! - `reputations` → `ReputationSnapshot`
//! - `transfer_grouped` → `TransferAggregate`

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod db;
pub mod granularity;
pub mod promoter;
pub mod queries;
pub mod retention;
pub mod scheduler;
pub mod types;

// Re-export commonly used types
pub use aggregator::{AggregationReport, TransferAggregator};
pub use clock::Clock;
pub use config::{ConfigError, PipelineConfig, RetentionPolicy, SourceDefinition, SourceKind};
pub use db::{IngestBatch, IngestSink, SqliteIngestWriter, StoreError};
pub use granularity::PromotionRule;
pub use promoter::{GranularityPromoter, PromotionOutcome, PromotionReport};
pub use retention::{RetentionReport, RetentionSweeper};
pub use scheduler::{CycleReport, PipelineScheduler};
pub use types::{
    LogLevel, RawLogRecord, ReputationSnapshot, SizeClass, TransferAction, TransferAggregate,
    TransferCounters, TransferRecord,
};
