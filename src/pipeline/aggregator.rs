//! Transfer Aggregator: raw transfers → 1-minute rollups
//!
//! One call to [`TransferAggregator::run`] processes at most one hour of
//! pending transfers, oldest first. Inserting the aggregates and flipping
//! `is_aggregated` happen in one IMMEDIATE transaction, so a failure leaves
//! every row exactly as it was and the next cycle retries the same window.

use super::clock::Clock;
use super::db::{transfer_from_row, upsert_aggregate, StoreError, TRANSFER_SELECT_COLUMNS};
use super::granularity::{floor_to_granularity, granularity_secs, BASE_GRANULARITY};
use super::types::{SizeClass, TransferAggregate, TransferCounters, TransferRecord};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeMap;

/// Largest window processed per cycle
const MAX_WINDOW_SECS: i64 = 60 * 60;

/// Result of one aggregation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregationReport {
    /// `[start, end)` window processed, if any
    pub window: Option<(i64, i64)>,
    pub transfers_aggregated: usize,
    pub aggregates_written: usize,
}

type GroupKey = (String, String, i64, SizeClass);

/// Bucket transfers by (source, satellite, minute, size class)
pub fn group_transfers(transfers: &[TransferRecord]) -> Vec<TransferAggregate> {
    let mut groups: BTreeMap<GroupKey, TransferCounters> = BTreeMap::new();

    for transfer in transfers {
        let key = (
            transfer.source.clone(),
            transfer.satellite_id.clone(),
            floor_to_granularity(transfer.timestamp, BASE_GRANULARITY),
            SizeClass::from_size(transfer.size),
        );
        groups.entry(key).or_default().add_record(transfer);
    }

    groups
        .into_iter()
        .map(|((source, satellite_id, interval_start, size_class), counters)| TransferAggregate {
            id: None,
            source,
            satellite_id,
            interval_start,
            interval_end: interval_start + granularity_secs(BASE_GRANULARITY),
            size_class,
            granularity: BASE_GRANULARITY,
            counters,
        })
        .collect()
}

pub struct TransferAggregator {
    clock: Clock,
}

impl TransferAggregator {
    pub fn new(clock: Clock) -> Self {
        Self { clock }
    }

    /// Processing window for the oldest pending transfer, or `None` when the
    /// cycle should wait
    pub fn window_for(&self, oldest_pending: i64) -> Option<(i64, i64)> {
        let now = self.clock.now();
        let unit = granularity_secs(BASE_GRANULARITY);

        // Rows this recent may still have late-arriving siblings
        if oldest_pending > now - 2 * unit {
            return None;
        }

        let end = floor_to_granularity(
            (oldest_pending + MAX_WINDOW_SECS).min(now - unit),
            BASE_GRANULARITY,
        );
        (end > oldest_pending).then_some((oldest_pending, end))
    }

    pub fn run(&self, conn: &mut Connection) -> Result<AggregationReport, StoreError> {
        let oldest: Option<i64> = conn
            .query_row(
                "SELECT timestamp FROM transfers WHERE is_aggregated = 0
                 ORDER BY timestamp ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(oldest) = oldest else {
            log::debug!("⏭️  No pending transfers to aggregate");
            return Ok(AggregationReport::default());
        };

        let Some((start, end)) = self.window_for(oldest) else {
            log::debug!("⏭️  Oldest pending transfer ({}) is too recent to aggregate", oldest);
            return Ok(AggregationReport::default());
        };

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let transfers: Vec<TransferRecord> = {
            let sql = format!(
                "SELECT {} FROM transfers
                 WHERE is_aggregated = 0 AND timestamp >= ?1 AND timestamp < ?2
                 ORDER BY timestamp ASC, id ASC",
                TRANSFER_SELECT_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt
                .query_map(params![start, end], transfer_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let aggregates = group_transfers(&transfers);
        for aggregate in &aggregates {
            upsert_aggregate(&tx, aggregate)?;
        }

        {
            let mut mark = tx.prepare_cached("UPDATE transfers SET is_aggregated = 1 WHERE id = ?1")?;
            for id in transfers.iter().filter_map(|t| t.id) {
                mark.execute(params![id])?;
            }
        }

        tx.commit()?;

        log::info!(
            "📊 Aggregated {} transfers into {} rows (window {}..{})",
            transfers.len(),
            aggregates.len(),
            start,
            end
        );

        Ok(AggregationReport {
            window: Some((start, end)),
            transfers_aggregated: transfers.len(),
            aggregates_written: aggregates.len(),
        })
    }
}
