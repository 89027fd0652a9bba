//! Filtered reads for the reporting layer
//!
//! Everything here is read-only. Callers may open their connection with
//! `PRAGMA query_only = ON`.

use super::db::{
    aggregate_from_row, aggregate_select_columns, log_entry_from_row, reputation_from_row,
    transfer_from_row, StoreError, LOG_ENTRY_SELECT_COLUMNS, REPUTATION_SELECT_COLUMNS,
    TRANSFER_SELECT_COLUMNS,
};
use super::granularity::PromotionRule;
use super::types::{
    LogLevel, RawLogRecord, ReputationSnapshot, SizeClass, TransferAction, TransferAggregate,
    TransferCounters, TransferRecord,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

/// Granularity tag for raw transfers converted by [`collect_interval_rows`]
pub const RAW_TRANSFER_GRANULARITY: u32 = 0;

const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct LogEntryFilter {
    pub source: Option<String>,
    pub level: Option<LogLevel>,
    pub area: Option<String>,
    pub action: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct TransferFilter {
    pub source: Option<String>,
    pub action: Option<TransferAction>,
    pub satellite_id: Option<String>,
    pub piece_id: Option<String>,
    pub is_success: Option<bool>,
    pub is_repair: Option<bool>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateFilter {
    pub source: Option<String>,
    pub granularity: Option<u32>,
    pub satellite_id: Option<String>,
    pub size_class: Option<SizeClass>,
    /// Inclusive lower bound on `interval_start`
    pub interval_start_from: Option<i64>,
    /// Inclusive upper bound on `interval_start`
    pub interval_start_to: Option<i64>,
    pub limit: Option<usize>,
}

/// Accumulates `AND` clauses with positional parameters
#[derive(Default)]
struct WhereClause {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl WhereClause {
    fn push(&mut self, condition: &str, value: Value) {
        self.values.push(value);
        self.clauses.push(condition.replace('?', &format!("?{}", self.values.len())));
    }

    fn push_text(&mut self, condition: &str, value: &Option<String>) {
        if let Some(v) = value {
            self.push(condition, Value::Text(v.clone()));
        }
    }

    fn push_bool(&mut self, condition: &str, value: Option<bool>) {
        if let Some(v) = value {
            self.push(condition, Value::Integer(i64::from(v)));
        }
    }

    /// `column IN (...)`; an empty list matches every source
    fn push_in(&mut self, column: &str, items: &[String]) {
        if items.is_empty() {
            return;
        }
        let start = self.values.len();
        let placeholders = (1..=items.len())
            .map(|i| format!("?{}", start + i))
            .collect::<Vec<_>>()
            .join(", ");
        self.values.extend(items.iter().cloned().map(Value::Text));
        self.clauses.push(format!("{} IN ({})", column, placeholders));
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn query_rows<T>(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
    map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), map)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Newest log entries first
pub fn list_log_entries(conn: &Connection, filter: &LogEntryFilter) -> Result<Vec<RawLogRecord>, StoreError> {
    let mut wc = WhereClause::default();
    wc.push_text("source = ?", &filter.source);
    if let Some(level) = filter.level {
        wc.push("level = ?", Value::Text(level.as_str().to_string()));
    }
    wc.push_text("area = ?", &filter.area);
    wc.push_text("action = ?", &filter.action);

    let sql = format!(
        "SELECT {} FROM log_entries{} ORDER BY timestamp DESC, id DESC LIMIT {}",
        LOG_ENTRY_SELECT_COLUMNS,
        wc.sql(),
        filter.limit.unwrap_or(DEFAULT_LIMIT)
    );
    query_rows(conn, &sql, wc.values, log_entry_from_row)
}

/// Newest transfers first
pub fn list_transfers(conn: &Connection, filter: &TransferFilter) -> Result<Vec<TransferRecord>, StoreError> {
    let mut wc = WhereClause::default();
    wc.push_text("source = ?", &filter.source);
    if let Some(action) = filter.action {
        wc.push("action = ?", Value::Text(action.as_str().to_string()));
    }
    wc.push_text("satellite_id = ?", &filter.satellite_id);
    wc.push_text("piece_id = ?", &filter.piece_id);
    wc.push_bool("is_success = ?", filter.is_success);
    wc.push_bool("is_repair = ?", filter.is_repair);

    let sql = format!(
        "SELECT {} FROM transfers{} ORDER BY timestamp DESC, id DESC LIMIT {}",
        TRANSFER_SELECT_COLUMNS,
        wc.sql(),
        filter.limit.unwrap_or(DEFAULT_LIMIT)
    );
    query_rows(conn, &sql, wc.values, transfer_from_row)
}

/// Transfers with `start <= timestamp < end`, oldest first
pub fn list_transfers_between(
    conn: &Connection,
    sources: &[String],
    start: i64,
    end: i64,
) -> Result<Vec<TransferRecord>, StoreError> {
    let mut wc = WhereClause::default();
    wc.push("timestamp >= ?", Value::Integer(start));
    wc.push("timestamp < ?", Value::Integer(end));
    wc.push_in("source", sources);

    let sql = format!(
        "SELECT {} FROM transfers{} ORDER BY timestamp ASC, id ASC",
        TRANSFER_SELECT_COLUMNS,
        wc.sql()
    );
    query_rows(conn, &sql, wc.values, transfer_from_row)
}

/// Aggregates ordered by newest interval first
pub fn list_aggregates(conn: &Connection, filter: &AggregateFilter) -> Result<Vec<TransferAggregate>, StoreError> {
    let mut wc = WhereClause::default();
    wc.push_text("source = ?", &filter.source);
    if let Some(granularity) = filter.granularity {
        wc.push("granularity = ?", Value::Integer(i64::from(granularity)));
    }
    wc.push_text("satellite_id = ?", &filter.satellite_id);
    if let Some(size_class) = filter.size_class {
        wc.push("size_class = ?", Value::Text(size_class.as_str().to_string()));
    }
    if let Some(from) = filter.interval_start_from {
        wc.push("interval_start >= ?", Value::Integer(from));
    }
    if let Some(to) = filter.interval_start_to {
        wc.push("interval_start <= ?", Value::Integer(to));
    }

    let sql = format!(
        "SELECT {} FROM transfer_grouped{} ORDER BY interval_start DESC, id DESC LIMIT {}",
        aggregate_select_columns(),
        wc.sql(),
        filter.limit.unwrap_or(DEFAULT_LIMIT)
    );
    query_rows(conn, &sql, wc.values, aggregate_from_row)
}

/// Aggregates of one granularity fully inside `[start, end]`, oldest first
pub fn list_aggregates_between(
    conn: &Connection,
    sources: &[String],
    start: i64,
    end: i64,
    granularity: u32,
) -> Result<Vec<TransferAggregate>, StoreError> {
    let mut wc = WhereClause::default();
    wc.push("granularity = ?", Value::Integer(i64::from(granularity)));
    wc.push("interval_start >= ?", Value::Integer(start));
    wc.push("interval_end <= ?", Value::Integer(end));
    wc.push_in("source", sources);

    let sql = format!(
        "SELECT {} FROM transfer_grouped{} ORDER BY interval_start ASC, id ASC",
        aggregate_select_columns(),
        wc.sql()
    );
    query_rows(conn, &sql, wc.values, aggregate_from_row)
}

pub fn list_reputations(
    conn: &Connection,
    source: Option<&str>,
    satellite_id: Option<&str>,
) -> Result<Vec<ReputationSnapshot>, StoreError> {
    let mut wc = WhereClause::default();
    wc.push_text("source = ?", &source.map(str::to_string));
    wc.push_text("satellite_id = ?", &satellite_id.map(str::to_string));

    let sql = format!(
        "SELECT {} FROM reputations{} ORDER BY source ASC, satellite_id ASC",
        REPUTATION_SELECT_COLUMNS,
        wc.sql()
    );
    query_rows(conn, &sql, wc.values, reputation_from_row)
}

pub fn get_reputation(
    conn: &Connection,
    source: &str,
    satellite_id: &str,
) -> Result<Option<ReputationSnapshot>, StoreError> {
    let sql = format!(
        "SELECT {} FROM reputations WHERE source = ?1 AND satellite_id = ?2",
        REPUTATION_SELECT_COLUMNS
    );
    let snapshot = conn
        .query_row(&sql, params![source, satellite_id], reputation_from_row)
        .optional()?;
    Ok(snapshot)
}

/// Cover `[start, end)` with non-overlapping rows across all granularities
///
/// Walks the ladder from the coarsest tier down, moving a cursor to the
/// newest `interval_end` seen at each tier. Whatever is left after the finest
/// tier is read from raw transfers, each converted to a single-transfer
/// pseudo-aggregate tagged [`RAW_TRANSFER_GRANULARITY`].
pub fn collect_interval_rows(
    conn: &Connection,
    rules: &[PromotionRule],
    sources: &[String],
    start: i64,
    end: i64,
) -> Result<Vec<TransferAggregate>, StoreError> {
    let mut tiers: Vec<u32> = rules
        .iter()
        .flat_map(|r| [r.from_granularity, r.to_granularity])
        .collect();
    tiers.sort_unstable();
    tiers.dedup();

    let mut rows = Vec::new();
    let mut cursor = start;

    for granularity in tiers.into_iter().rev() {
        let tier_rows = list_aggregates_between(conn, sources, cursor, end, granularity)?;
        log::debug!(
            "collect_interval_rows: granularity={} returned {} rows",
            granularity,
            tier_rows.len()
        );
        cursor = tier_rows.iter().map(|r| r.interval_end).fold(cursor, i64::max);
        rows.extend(tier_rows);
    }

    let tail = list_transfers_between(conn, sources, cursor, end)?;
    log::debug!("collect_interval_rows: {} raw transfers after {}", tail.len(), cursor);
    rows.extend(tail.iter().map(transfer_as_aggregate));

    Ok(rows)
}

fn transfer_as_aggregate(transfer: &TransferRecord) -> TransferAggregate {
    let mut counters = TransferCounters::default();
    counters.add_record(transfer);

    TransferAggregate {
        id: None,
        source: transfer.source.clone(),
        satellite_id: transfer.satellite_id.clone(),
        interval_start: transfer.timestamp,
        interval_end: transfer.timestamp,
        size_class: SizeClass::from_size(transfer.size),
        granularity: RAW_TRANSFER_GRANULARITY,
        counters,
    }
}
