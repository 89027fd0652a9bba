//! SQLite storage backend: schema, connections and ingest writes
//!
//! Tables (see `/sql/`):
//! - `log_entries` - INSERT (append-only generic log records)
//! - `transfers` - INSERT, later UPDATE of `is_aggregated` by the aggregator
//! - `reputations` - UPSERT on (source, satellite_id), newer timestamp wins
//! - `transfer_grouped` - UPSERT on the aggregation key, counters are added
//!
//! Every logical unit of work runs in its own transaction. Readers on other
//! connections see either the state before a commit or after it.

use super::types::{
    LogLevel, RawLogRecord, ReputationSnapshot, SizeClass, TransferAction, TransferAggregate,
    TransferCounters, TransferRecord, COUNTER_COLUMNS,
};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, Row, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;

/// Errors surfaced by every storage operation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database connection lock poisoned")]
    Poisoned,

    #[error("Blocking database task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Ordered schema migrations compiled into the binary
///
/// Every statement uses `IF NOT EXISTS`, so re-running is a no-op.
const MIGRATIONS: &[(&str, &str)] = &[
    ("01_log_entries.sql", include_str!("../../sql/01_log_entries.sql")),
    ("02_transfers.sql", include_str!("../../sql/02_transfers.sql")),
    ("03_reputations.sql", include_str!("../../sql/03_reputations.sql")),
    ("04_transfer_grouped.sql", include_str!("../../sql/04_transfer_grouped.sql")),
];

/// Open a tuned connection, creating the parent directory if needed
pub fn open_connection(db_path: impl AsRef<Path>) -> Result<Connection, StoreError> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;
    apply_optimized_pragmas(&conn)?;
    Ok(conn)
}

/// Apply all schema migrations in order
pub fn run_schema_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    log::info!("🔧 Running {} schema migrations", MIGRATIONS.len());

    let tx = conn.transaction()?;
    for (name, sql) in MIGRATIONS {
        log::debug!("   ├─ Executing: {}", name);
        tx.execute_batch(sql)?;
    }
    tx.commit()?;

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

/// One flush worth of typed records from a single source
#[derive(Debug, Default, Clone)]
pub struct IngestBatch {
    pub logs: Vec<RawLogRecord>,
    pub transfers: Vec<TransferRecord>,
    pub reputations: Vec<ReputationSnapshot>,
}

impl IngestBatch {
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.transfers.is_empty() && self.reputations.is_empty()
    }

    /// Total records across all three buffers
    pub fn len(&self) -> usize {
        self.logs.len() + self.transfers.len() + self.reputations.len()
    }

    /// Size of the fullest buffer (flush trigger)
    pub fn largest_buffer(&self) -> usize {
        self.logs.len().max(self.transfers.len()).max(self.reputations.len())
    }

    pub fn clear(&mut self) {
        self.logs.clear();
        self.transfers.clear();
        self.reputations.clear();
    }
}

/// Destination for watcher flushes
#[async_trait]
pub trait IngestSink: Send + Sync {
    /// Persist a batch atomically: all records are committed or none are
    async fn write_batch(&self, batch: &IngestBatch) -> Result<(), StoreError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// SQLite implementation of [`IngestSink`]
///
/// Watchers share one writer; the connection mutex serialises flushes. The
/// SQLite work runs on the blocking pool so a slow commit never stalls the
/// runtime threads driving the other watchers.
pub struct SqliteIngestWriter {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteIngestWriter {
    /// Open a writer on `db_path` (schema must already exist)
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::from_connection(open_connection(db_path)?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn write_batch_blocking(conn: &Mutex<Connection>, batch: &IngestBatch) -> Result<(), StoreError> {
        let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;

        let tx = conn.transaction()?;
        insert_log_entries(&tx, &batch.logs)?;
        insert_transfers(&tx, &batch.transfers)?;
        upsert_reputations(&tx, &batch.reputations)?;
        tx.commit()?;

        log::debug!(
            "✅ Flushed {} logs, {} transfers, {} reputations",
            batch.logs.len(),
            batch.transfers.len(),
            batch.reputations.len()
        );
        Ok(())
    }
}

#[async_trait]
impl IngestSink for SqliteIngestWriter {
    async fn write_batch(&self, batch: &IngestBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let conn = Arc::clone(&self.conn);
        let batch = batch.clone();
        tokio::task::spawn_blocking(move || Self::write_batch_blocking(&conn, &batch)).await?
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

pub fn insert_log_entries(tx: &Transaction<'_>, logs: &[RawLogRecord]) -> Result<(), StoreError> {
    if logs.is_empty() {
        return Ok(());
    }

    let mut stmt = tx.prepare_cached(
        "INSERT INTO log_entries (source, timestamp, level, area, action, details)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for log in logs {
        let details = serde_json::to_string(&log.details)?;
        stmt.execute(params![
            log.source,
            log.timestamp,
            log.level.as_str(),
            log.area,
            log.action,
            details,
        ])?;
    }
    Ok(())
}

pub fn insert_transfers(tx: &Transaction<'_>, transfers: &[TransferRecord]) -> Result<(), StoreError> {
    if transfers.is_empty() {
        return Ok(());
    }

    let mut stmt = tx.prepare_cached(
        "INSERT INTO transfers
         (source, timestamp, action, is_success, piece_id, satellite_id,
          is_repair, size, offset_bytes, remote_address, is_aggregated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    for transfer in transfers {
        stmt.execute(params![
            transfer.source,
            transfer.timestamp,
            transfer.action.as_str(),
            transfer.is_success,
            transfer.piece_id,
            transfer.satellite_id,
            transfer.is_repair,
            transfer.size,
            transfer.offset,
            transfer.remote_address,
            transfer.is_aggregated,
        ])?;
    }
    Ok(())
}

/// Upsert snapshots; an existing row is only replaced by a strictly newer one
pub fn upsert_reputations(
    tx: &Transaction<'_>,
    reputations: &[ReputationSnapshot],
) -> Result<(), StoreError> {
    if reputations.is_empty() {
        return Ok(());
    }

    let mut stmt = tx.prepare_cached(
        r#"
        INSERT INTO reputations (
            source, satellite_id, timestamp, audits_total, audits_success,
            score_audit, score_online, score_suspension
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(source, satellite_id) DO UPDATE SET
            timestamp = excluded.timestamp,
            audits_total = excluded.audits_total,
            audits_success = excluded.audits_success,
            score_audit = excluded.score_audit,
            score_online = excluded.score_online,
            score_suspension = excluded.score_suspension
        WHERE excluded.timestamp > reputations.timestamp
        "#,
    )?;
    for rep in reputations {
        stmt.execute(params![
            rep.source,
            rep.satellite_id,
            rep.timestamp,
            rep.audits_total,
            rep.audits_success,
            rep.score_audit,
            rep.score_online,
            rep.score_suspension,
        ])?;
    }
    Ok(())
}

fn aggregate_upsert_sql() -> &'static str {
    static SQL: OnceLock<String> = OnceLock::new();
    SQL.get_or_init(|| {
        let columns = COUNTER_COLUMNS.join(", ");
        let placeholders = (1..=6 + COUNTER_COLUMNS.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let accumulate = COUNTER_COLUMNS
            .iter()
            .map(|c| {
                // SQLite turns an overflowing integer sum into REAL; clamp instead
                format!(
                    "{c} = CASE WHEN excluded.{c} > {max} - {c} THEN {max} ELSE {c} + excluded.{c} END",
                    max = i64::MAX
                )
            })
            .collect::<Vec<_>>()
            .join(",\n            ");

        format!(
            "INSERT INTO transfer_grouped (
            source, satellite_id, interval_start, interval_end, size_class, granularity, {columns}
        ) VALUES ({placeholders})
        ON CONFLICT(source, satellite_id, size_class, granularity, interval_start) DO UPDATE SET
            {accumulate}"
        )
    })
}

/// Insert an aggregate, or add its counters into the row with the same key
pub fn upsert_aggregate(tx: &Transaction<'_>, aggregate: &TransferAggregate) -> Result<(), StoreError> {
    let mut values: Vec<Value> = vec![
        Value::Text(aggregate.source.clone()),
        Value::Text(aggregate.satellite_id.clone()),
        Value::Integer(aggregate.interval_start),
        Value::Integer(aggregate.interval_end),
        Value::Text(aggregate.size_class.as_str().to_string()),
        Value::Integer(i64::from(aggregate.granularity)),
    ];
    values.extend(aggregate.counters.as_array().into_iter().map(Value::Integer));

    let mut stmt = tx.prepare_cached(aggregate_upsert_sql())?;
    stmt.execute(params_from_iter(values))?;
    Ok(())
}

/// Column list matching [`aggregate_from_row`]
pub fn aggregate_select_columns() -> &'static str {
    static COLUMNS: OnceLock<String> = OnceLock::new();
    COLUMNS.get_or_init(|| {
        format!(
            "id, source, satellite_id, interval_start, interval_end, size_class, granularity, {}",
            COUNTER_COLUMNS.join(", ")
        )
    })
}

/// Column list matching [`transfer_from_row`]
pub const TRANSFER_SELECT_COLUMNS: &str = "id, source, timestamp, action, is_success, piece_id, \
     satellite_id, is_repair, size, offset_bytes, remote_address, is_aggregated";

/// Column list matching [`log_entry_from_row`]
pub const LOG_ENTRY_SELECT_COLUMNS: &str = "source, timestamp, level, area, action, details";

/// Column list matching [`reputation_from_row`]
pub const REPUTATION_SELECT_COLUMNS: &str = "source, satellite_id, timestamp, audits_total, \
     audits_success, score_audit, score_online, score_suspension";

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

pub fn aggregate_from_row(row: &Row<'_>) -> rusqlite::Result<TransferAggregate> {
    let size_class: String = row.get(5)?;
    let size_class = SizeClass::from_str(&size_class)
        .ok_or_else(|| conversion_error(5, format!("unknown size class: {}", size_class)))?;

    let mut counters = [0i64; 16];
    for (i, slot) in counters.iter_mut().enumerate() {
        *slot = row.get(7 + i)?;
    }

    Ok(TransferAggregate {
        id: Some(row.get(0)?),
        source: row.get(1)?,
        satellite_id: row.get(2)?,
        interval_start: row.get(3)?,
        interval_end: row.get(4)?,
        size_class,
        granularity: row.get(6)?,
        counters: TransferCounters::from_array(counters),
    })
}

pub fn transfer_from_row(row: &Row<'_>) -> rusqlite::Result<TransferRecord> {
    let action: String = row.get(3)?;
    let action = TransferAction::from_str(&action)
        .ok_or_else(|| conversion_error(3, format!("invalid action: {}", action)))?;

    Ok(TransferRecord {
        id: Some(row.get(0)?),
        source: row.get(1)?,
        timestamp: row.get(2)?,
        action,
        is_success: row.get(4)?,
        piece_id: row.get(5)?,
        satellite_id: row.get(6)?,
        is_repair: row.get(7)?,
        size: row.get(8)?,
        offset: row.get(9)?,
        remote_address: row.get(10)?,
        is_aggregated: row.get(11)?,
    })
}

pub fn log_entry_from_row(row: &Row<'_>) -> rusqlite::Result<RawLogRecord> {
    let level: String = row.get(2)?;
    let level = LogLevel::from_str(&level)
        .ok_or_else(|| conversion_error(2, format!("invalid level: {}", level)))?;
    let details: String = row.get(5)?;
    let details = serde_json::from_str(&details)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(RawLogRecord {
        source: row.get(0)?,
        timestamp: row.get(1)?,
        level,
        area: row.get(3)?,
        action: row.get(4)?,
        details,
    })
}

pub fn reputation_from_row(row: &Row<'_>) -> rusqlite::Result<ReputationSnapshot> {
    Ok(ReputationSnapshot {
        source: row.get(0)?,
        satellite_id: row.get(1)?,
        timestamp: row.get(2)?,
        audits_total: row.get(3)?,
        audits_success: row.get(4)?,
        score_audit: row.get(5)?,
        score_online: row.get(6)?,
        score_suspension: row.get(7)?,
    })
}
