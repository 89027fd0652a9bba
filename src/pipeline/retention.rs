//! Retention Sweeper
//!
//! Rows strictly older than `now - retention` are deleted; a row sitting
//! exactly on the cutoff survives. Each table is swept in its own statement
//! and a failure on one table does not stop the others.

use super::clock::Clock;
use super::config::RetentionPolicy;
use super::db::StoreError;
use super::granularity::MINUTE_SECS;
use rusqlite::{params, Connection};
use serde::Serialize;

/// Swept tables and the column their age is measured by
const TABLES: [(&str, &str); 3] = [
    ("log_entries", "timestamp"),
    ("transfers", "timestamp"),
    ("transfer_grouped", "interval_end"),
];

/// Deleted row counts; `None` means unlimited retention or a failed sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub log_entries: Option<usize>,
    pub transfers: Option<usize>,
    pub transfer_grouped: Option<usize>,
}

impl RetentionReport {
    pub fn total_deleted(&self) -> usize {
        [self.log_entries, self.transfers, self.transfer_grouped]
            .iter()
            .flatten()
            .sum()
    }
}

pub struct RetentionSweeper {
    policy: RetentionPolicy,
    clock: Clock,
}

impl RetentionSweeper {
    pub fn new(policy: RetentionPolicy, clock: Clock) -> Self {
        Self { policy, clock }
    }

    fn minutes_for(&self, table: &str) -> Option<i64> {
        match table {
            "log_entries" => self.policy.log_entries,
            "transfers" => self.policy.transfers,
            "transfer_grouped" => self.policy.transfer_grouped,
            _ => None,
        }
    }

    /// Delete rows of `table` older than `cutoff`
    fn delete_older_than(conn: &Connection, table: &str, column: &str, cutoff: i64) -> Result<usize, StoreError> {
        let sql = format!("DELETE FROM {} WHERE {} < ?1", table, column);
        Ok(conn.execute(&sql, params![cutoff])?)
    }

    pub fn sweep(&self, conn: &Connection) -> RetentionReport {
        let now = self.clock.now();
        let mut deleted = [None; 3];

        for (slot, (table, column)) in deleted.iter_mut().zip(TABLES) {
            let Some(minutes) = self.minutes_for(table) else {
                log::debug!("♾️  Retention for {} is unlimited", table);
                continue;
            };

            let cutoff = now - minutes * MINUTE_SECS;
            match Self::delete_older_than(conn, table, column, cutoff) {
                Ok(rows) => {
                    if rows > 0 {
                        log::info!("🧹 Retention removed {} rows from {} (cutoff {})", rows, table, cutoff);
                    }
                    *slot = Some(rows);
                }
                Err(e) => {
                    log::error!("❌ Retention sweep failed for {}: {}", table, e);
                }
            }
        }

        let [log_entries, transfers, transfer_grouped] = deleted;
        RetentionReport {
            log_entries,
            transfers,
            transfer_grouped,
        }
    }
}
