//! Granularity Promoter: collapse old fine rollups into coarser buckets
//!
//! Promotion never merges across size classes. The coarse rows are upserted
//! and the consumed fine rows are deleted in one transaction, so per-key
//! counter sums are identical before and after a pass.

use super::clock::Clock;
use super::db::{aggregate_from_row, aggregate_select_columns, upsert_aggregate, StoreError};
use super::granularity::{floor_to_granularity, granularity_secs, PromotionRule, MINUTE_SECS};
use super::types::{SizeClass, TransferAggregate, TransferCounters};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeMap;

/// Why a rule did not run this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionSkip {
    /// No rows at the source granularity
    Empty,
    /// Oldest row is younger than `min_old_minutes`
    NotOldEnough,
    /// Newest row is older than `newest_threshold_minutes`
    Idle,
    /// Nothing starts before the cutoff
    NothingBeforeCutoff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionOutcome {
    Skipped(PromotionSkip),
    Promoted {
        cutoff: i64,
        rows_consumed: usize,
        rows_written: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromotionReport {
    pub rule: PromotionRule,
    pub outcome: PromotionOutcome,
}

type GroupKey = (String, String, SizeClass, i64);

/// Sum fine rows into `to_granularity` buckets
pub fn group_for_promotion(rows: &[TransferAggregate], to_granularity: u32) -> Vec<TransferAggregate> {
    let mut groups: BTreeMap<GroupKey, TransferCounters> = BTreeMap::new();

    for row in rows {
        let key = (
            row.source.clone(),
            row.satellite_id.clone(),
            row.size_class,
            floor_to_granularity(row.interval_start, to_granularity),
        );
        groups.entry(key).or_default().merge(&row.counters);
    }

    groups
        .into_iter()
        .map(|((source, satellite_id, size_class, interval_start), counters)| TransferAggregate {
            id: None,
            source,
            satellite_id,
            interval_start,
            interval_end: interval_start + granularity_secs(to_granularity),
            size_class,
            granularity: to_granularity,
            counters,
        })
        .collect()
}

pub struct GranularityPromoter {
    clock: Clock,
}

impl GranularityPromoter {
    pub fn new(clock: Clock) -> Self {
        Self { clock }
    }

    /// Apply one rule
    pub fn promote(&self, conn: &mut Connection, rule: &PromotionRule) -> Result<PromotionReport, StoreError> {
        let outcome = self.promote_inner(conn, rule)?;
        match &outcome {
            PromotionOutcome::Skipped(reason) => log::debug!(
                "⏭️  Promotion {}→{} skipped: {:?}",
                rule.from_granularity,
                rule.to_granularity,
                reason
            ),
            PromotionOutcome::Promoted {
                rows_consumed,
                rows_written,
                ..
            } => log::info!(
                "🔼 Promoted {} rows at {}m into {} rows at {}m",
                rows_consumed,
                rule.from_granularity,
                rows_written,
                rule.to_granularity
            ),
        }
        Ok(PromotionReport { rule: *rule, outcome })
    }

    fn promote_inner(&self, conn: &mut Connection, rule: &PromotionRule) -> Result<PromotionOutcome, StoreError> {
        let now = self.clock.now();

        let (oldest, newest): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(interval_start), MAX(interval_start) FROM transfer_grouped
             WHERE granularity = ?1",
            params![rule.from_granularity],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let (Some(oldest), Some(newest)) = (oldest, newest) else {
            return Ok(PromotionOutcome::Skipped(PromotionSkip::Empty));
        };
        if oldest > now - rule.min_old_minutes * MINUTE_SECS {
            return Ok(PromotionOutcome::Skipped(PromotionSkip::NotOldEnough));
        }
        if newest < now - rule.newest_threshold_minutes * MINUTE_SECS {
            return Ok(PromotionOutcome::Skipped(PromotionSkip::Idle));
        }

        let cutoff = floor_to_granularity(
            now - rule.newest_threshold_minutes * MINUTE_SECS,
            rule.to_granularity,
        );

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let fine_rows: Vec<TransferAggregate> = {
            let sql = format!(
                "SELECT {} FROM transfer_grouped
                 WHERE granularity = ?1 AND interval_start < ?2
                 ORDER BY interval_start ASC, id ASC",
                aggregate_select_columns()
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt
                .query_map(params![rule.from_granularity, cutoff], aggregate_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        if fine_rows.is_empty() {
            return Ok(PromotionOutcome::Skipped(PromotionSkip::NothingBeforeCutoff));
        }

        let coarse_rows = group_for_promotion(&fine_rows, rule.to_granularity);
        for row in &coarse_rows {
            upsert_aggregate(&tx, row)?;
        }

        {
            let mut delete = tx.prepare_cached("DELETE FROM transfer_grouped WHERE id = ?1")?;
            for id in fine_rows.iter().filter_map(|r| r.id) {
                delete.execute(params![id])?;
            }
        }

        tx.commit()?;

        Ok(PromotionOutcome::Promoted {
            cutoff,
            rows_consumed: fine_rows.len(),
            rows_written: coarse_rows.len(),
        })
    }
}
