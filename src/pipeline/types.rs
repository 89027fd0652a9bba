//! Core data structures for the ingestion and rollup pipeline
//!
//! Row types mirror the SQLite schema in `sql/`:
//! - `log_entries` → `RawLogRecord`
//! - `transfers` → `TransferRecord`
//! - `reputations` → `ReputationSnapshot`
//! - `transfer_grouped` → `TransferAggregate`
//!
//! All timestamps are Unix seconds (UTC).

use serde_json::{Map, Value};

/// Severity level of a storage-node log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Generic log entry, persisted append-only
#[derive(Debug, Clone, PartialEq)]
pub struct RawLogRecord {
    pub source: String,
    pub timestamp: i64,
    pub level: LogLevel,
    pub area: String,
    pub action: String,
    pub details: Map<String, Value>,
}

/// Transfer direction code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferAction {
    Download,
    Upload,
}

impl TransferAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferAction::Download => "DL",
            TransferAction::Upload => "UL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DL" => Some(TransferAction::Download),
            "UL" => Some(TransferAction::Upload),
            _ => None,
        }
    }
}

/// Piecestore transfer extracted from a log line
///
/// `id` is `None` until the row has been persisted. `is_aggregated` flips
/// false → true exactly once, in the same transaction that writes the
/// 1-minute aggregate the transfer contributed to.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub id: Option<i64>,
    pub source: String,
    pub timestamp: i64,
    pub action: TransferAction,
    pub is_success: bool,
    pub piece_id: String,
    pub satellite_id: String,
    pub is_repair: bool,
    pub size: i64,
    pub offset: Option<i64>,
    pub remote_address: Option<String>,
    pub is_aggregated: bool,
}

/// Latest reputation metrics per (source, satellite)
#[derive(Debug, Clone, PartialEq)]
pub struct ReputationSnapshot {
    pub source: String,
    pub satellite_id: String,
    pub timestamp: i64,
    pub audits_total: i64,
    pub audits_success: i64,
    pub score_audit: f64,
    pub score_online: f64,
    pub score_suspension: f64,
}

/// Coarse payload size bucket used as an aggregation dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SizeClass {
    K1,
    K4,
    K16,
    K64,
    K256,
    M1,
    Big,
}

impl SizeClass {
    /// Classify a payload by byte size (upper bounds are exclusive)
    pub fn from_size(size: i64) -> Self {
        const KIB: i64 = 1024;
        if size < KIB {
            SizeClass::K1
        } else if size < 4 * KIB {
            SizeClass::K4
        } else if size < 16 * KIB {
            SizeClass::K16
        } else if size < 64 * KIB {
            SizeClass::K64
        } else if size < 256 * KIB {
            SizeClass::K256
        } else if size < KIB * KIB {
            SizeClass::M1
        } else {
            SizeClass::Big
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SizeClass::K1 => "1K",
            SizeClass::K4 => "4K",
            SizeClass::K16 => "16K",
            SizeClass::K64 => "64K",
            SizeClass::K256 => "256K",
            SizeClass::M1 => "1M",
            SizeClass::Big => "big",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1K" => Some(SizeClass::K1),
            "4K" => Some(SizeClass::K4),
            "16K" => Some(SizeClass::K16),
            "64K" => Some(SizeClass::K64),
            "256K" => Some(SizeClass::K256),
            "1M" => Some(SizeClass::M1),
            "big" => Some(SizeClass::Big),
            _ => None,
        }
    }

    pub fn all() -> [SizeClass; 7] {
        [
            SizeClass::K1,
            SizeClass::K4,
            SizeClass::K16,
            SizeClass::K64,
            SizeClass::K256,
            SizeClass::M1,
            SizeClass::Big,
        ]
    }
}

/// Column names of the 16 counters, in `TransferCounters::as_array` order
pub const COUNTER_COLUMNS: [&str; 16] = [
    "size_dl_succ_nor",
    "size_ul_succ_nor",
    "size_dl_fail_nor",
    "size_ul_fail_nor",
    "size_dl_succ_rep",
    "size_ul_succ_rep",
    "size_dl_fail_rep",
    "size_ul_fail_rep",
    "count_dl_succ_nor",
    "count_ul_succ_nor",
    "count_dl_fail_nor",
    "count_ul_fail_nor",
    "count_dl_succ_rep",
    "count_ul_succ_rep",
    "count_dl_fail_rep",
    "count_ul_fail_rep",
];

/// The {size,count} × {dl,ul} × {succ,fail} × {nor,rep} counter block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounters {
    pub size_dl_succ_nor: i64,
    pub size_ul_succ_nor: i64,
    pub size_dl_fail_nor: i64,
    pub size_ul_fail_nor: i64,
    pub size_dl_succ_rep: i64,
    pub size_ul_succ_rep: i64,
    pub size_dl_fail_rep: i64,
    pub size_ul_fail_rep: i64,
    pub count_dl_succ_nor: i64,
    pub count_ul_succ_nor: i64,
    pub count_dl_fail_nor: i64,
    pub count_ul_fail_nor: i64,
    pub count_dl_succ_rep: i64,
    pub count_ul_succ_rep: i64,
    pub count_dl_fail_rep: i64,
    pub count_ul_fail_rep: i64,
}

impl TransferCounters {
    /// Account one transfer in the (size, count) pair selected by its flags
    pub fn add_transfer(&mut self, action: TransferAction, is_success: bool, is_repair: bool, size: i64) {
        use TransferAction::{Download, Upload};

        let (size_slot, count_slot) = match (action, is_success, is_repair) {
            (Download, true, false) => (&mut self.size_dl_succ_nor, &mut self.count_dl_succ_nor),
            (Upload, true, false) => (&mut self.size_ul_succ_nor, &mut self.count_ul_succ_nor),
            (Download, false, false) => (&mut self.size_dl_fail_nor, &mut self.count_dl_fail_nor),
            (Upload, false, false) => (&mut self.size_ul_fail_nor, &mut self.count_ul_fail_nor),
            (Download, true, true) => (&mut self.size_dl_succ_rep, &mut self.count_dl_succ_rep),
            (Upload, true, true) => (&mut self.size_ul_succ_rep, &mut self.count_ul_succ_rep),
            (Download, false, true) => (&mut self.size_dl_fail_rep, &mut self.count_dl_fail_rep),
            (Upload, false, true) => (&mut self.size_ul_fail_rep, &mut self.count_ul_fail_rep),
        };

        *size_slot = size_slot.saturating_add(size);
        *count_slot = count_slot.saturating_add(1);
    }

    pub fn add_record(&mut self, transfer: &TransferRecord) {
        self.add_transfer(transfer.action, transfer.is_success, transfer.is_repair, transfer.size);
    }

    /// Add every counter of `other` into `self`
    pub fn merge(&mut self, other: &TransferCounters) {
        let mut merged = self.as_array();
        for (slot, value) in merged.iter_mut().zip(other.as_array()) {
            *slot = slot.saturating_add(value);
        }
        *self = Self::from_array(merged);
    }

    pub fn as_array(&self) -> [i64; 16] {
        [
            self.size_dl_succ_nor,
            self.size_ul_succ_nor,
            self.size_dl_fail_nor,
            self.size_ul_fail_nor,
            self.size_dl_succ_rep,
            self.size_ul_succ_rep,
            self.size_dl_fail_rep,
            self.size_ul_fail_rep,
            self.count_dl_succ_nor,
            self.count_ul_succ_nor,
            self.count_dl_fail_nor,
            self.count_ul_fail_nor,
            self.count_dl_succ_rep,
            self.count_ul_succ_rep,
            self.count_dl_fail_rep,
            self.count_ul_fail_rep,
        ]
    }

    pub fn from_array(values: [i64; 16]) -> Self {
        Self {
            size_dl_succ_nor: values[0],
            size_ul_succ_nor: values[1],
            size_dl_fail_nor: values[2],
            size_ul_fail_nor: values[3],
            size_dl_succ_rep: values[4],
            size_ul_succ_rep: values[5],
            size_dl_fail_rep: values[6],
            size_ul_fail_rep: values[7],
            count_dl_succ_nor: values[8],
            count_ul_succ_nor: values[9],
            count_dl_fail_nor: values[10],
            count_ul_fail_nor: values[11],
            count_dl_succ_rep: values[12],
            count_ul_succ_rep: values[13],
            count_dl_fail_rep: values[14],
            count_ul_fail_rep: values[15],
        }
    }

    pub fn total_count(&self) -> i64 {
        self.as_array()[8..].iter().fold(0, |acc, v| acc.saturating_add(*v))
    }

    pub fn total_size(&self) -> i64 {
        self.as_array()[..8].iter().fold(0, |acc, v| acc.saturating_add(*v))
    }
}

/// Time-bucketed rollup of transfers
///
/// `granularity` is the bucket width in minutes; `interval_end` is always
/// `interval_start + granularity * 60`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferAggregate {
    pub id: Option<i64>,
    pub source: String,
    pub satellite_id: String,
    pub interval_start: i64,
    pub interval_end: i64,
    pub size_class: SizeClass,
    pub granularity: u32,
    pub counters: TransferCounters,
}
