//! Event classifier and normalizer
//!
//! Routes a parsed line to an extractor chosen by (level, area). Extractors
//! return zero or more typed records, or reject the line when a recognised
//! event is missing required fields.

use super::line_parser::{parse_line, ParseError, ParsedLine};
use crate::pipeline::types::{LogLevel, RawLogRecord, ReputationSnapshot, TransferAction, TransferRecord};
use serde_json::{Map, Value};

/// One record produced from a log line
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedRecord {
    Log(RawLogRecord),
    Transfer(TransferRecord),
    Reputation(ReputationSnapshot),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// The line does not have the log line shape
    Syntax(ParseError),
    /// A recognised event is missing or has invalid required fields
    Rule(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Syntax(e) => write!(f, "syntax: {}", e),
            RejectReason::Rule(msg) => write!(f, "rule: {}", msg),
        }
    }
}

/// Outcome for one line
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// High-volume noise; nothing is stored and nothing is sent to the sink
    Ignored,
    /// Processed; may hold no records (e.g. an incomplete transfer)
    Accepted(Vec<ClassifiedRecord>),
    /// Goes verbatim to the unprocessed sink
    Rejected(RejectReason),
}

enum ActionMatch {
    Any,
    Exact(&'static str),
    Prefix(&'static str),
}

struct IgnoreRule {
    level: LogLevel,
    area: Option<&'static str>,
    action: ActionMatch,
}

const IGNORE_RULES: &[IgnoreRule] = &[
    IgnoreRule {
        level: LogLevel::Debug,
        area: None,
        action: ActionMatch::Any,
    },
    IgnoreRule {
        level: LogLevel::Info,
        area: Some("piecemigrate:chore"),
        action: ActionMatch::Prefix("enqueued for migration"),
    },
    IgnoreRule {
        level: LogLevel::Info,
        area: Some("orders"),
        action: ActionMatch::Exact("finished"),
    },
    IgnoreRule {
        level: LogLevel::Info,
        area: Some("bandwidth"),
        action: ActionMatch::Exact("Persisting bandwidth usage cache to db"),
    },
    IgnoreRule {
        level: LogLevel::Info,
        area: Some("piecestore"),
        action: ActionMatch::Exact("New bloomfilter is received"),
    },
    IgnoreRule {
        level: LogLevel::Info,
        area: Some("trust"),
        action: ActionMatch::Exact("Scheduling next refresh"),
    },
];

pub fn is_ignored(level: LogLevel, area: &str, action: &str) -> bool {
    IGNORE_RULES.iter().any(|rule| {
        rule.level == level
            && rule.area.map_or(true, |a| a == area)
            && match rule.action {
                ActionMatch::Any => true,
                ActionMatch::Exact(expected) => action == expected,
                ActionMatch::Prefix(prefix) => action.starts_with(prefix),
            }
    })
}

type Extractor = fn(&str, ParsedLine) -> Classification;

/// (level, area) → extractor; anything else passes through as a log record
const EXTRACTORS: &[(LogLevel, &str, Extractor)] = &[
    (LogLevel::Info, "piecestore", extract_piecestore),
    (LogLevel::Info, "reputation:service", extract_reputation),
];

fn extractor_for(level: LogLevel, area: &str) -> Extractor {
    EXTRACTORS
        .iter()
        .find(|(l, a, _)| *l == level && *a == area)
        .map(|(_, _, extractor)| *extractor)
        .unwrap_or(passthrough)
}

/// Classify a parsed line from `source`
pub fn classify(source: &str, line: ParsedLine) -> Classification {
    if is_ignored(line.level, &line.area, &line.action) {
        return Classification::Ignored;
    }
    extractor_for(line.level, &line.area)(source, line)
}

/// Parse then classify a raw line
pub fn process_line(source: &str, raw: &str) -> Classification {
    match parse_line(raw) {
        Ok(parsed) => classify(source, parsed),
        Err(e) => Classification::Rejected(RejectReason::Syntax(e)),
    }
}

fn log_record(source: &str, line: ParsedLine) -> RawLogRecord {
    RawLogRecord {
        source: source.to_string(),
        timestamp: line.timestamp,
        level: line.level,
        area: line.area,
        action: line.action,
        details: line.details,
    }
}

fn passthrough(source: &str, line: ParsedLine) -> Classification {
    Classification::Accepted(vec![ClassifiedRecord::Log(log_record(source, line))])
}

fn transfer_kind(action: &str) -> Option<(TransferAction, bool)> {
    match action {
        "downloaded" => Some((TransferAction::Download, true)),
        "download canceled" => Some((TransferAction::Download, false)),
        "uploaded" => Some((TransferAction::Upload, true)),
        "upload canceled" => Some((TransferAction::Upload, false)),
        _ => None,
    }
}

/// Largest piece size taken at face value (1 TiB); anything above is garbage
pub const MAX_TRANSFER_SIZE: i64 = 1 << 40;

fn extract_piecestore(source: &str, line: ParsedLine) -> Classification {
    let Some((action, is_success)) = transfer_kind(&line.action) else {
        return passthrough(source, line);
    };

    let details = &line.details;
    let size = coerce_i64(details.get("Size")).filter(|s| (0..=MAX_TRANSFER_SIZE).contains(s));
    let piece_id = non_empty_str(details.get("Piece ID"));
    let satellite_id = non_empty_str(details.get("Satellite ID"));

    // Incomplete transfers are dropped silently but still count as processed
    let (Some(size), Some(piece_id), Some(satellite_id)) = (size, piece_id, satellite_id) else {
        log::debug!("Skipping incomplete transfer from {} at {}", source, line.timestamp);
        return Classification::Accepted(Vec::new());
    };

    let transfer_type = details.get("Action").and_then(Value::as_str).unwrap_or("");

    Classification::Accepted(vec![ClassifiedRecord::Transfer(TransferRecord {
        id: None,
        source: source.to_string(),
        timestamp: line.timestamp,
        action,
        is_success,
        piece_id,
        satellite_id,
        is_repair: matches!(transfer_type, "GET_REPAIR" | "PUT_REPAIR"),
        size,
        offset: coerce_i64(details.get("Offset")),
        remote_address: non_empty_str(details.get("Remote Address")),
        is_aggregated: false,
    })])
}

fn extract_reputation(source: &str, line: ParsedLine) -> Classification {
    match reputation_snapshot(source, line.timestamp, &line.details) {
        Ok(snapshot) => Classification::Accepted(vec![
            ClassifiedRecord::Log(log_record(source, line)),
            ClassifiedRecord::Reputation(snapshot),
        ]),
        Err(field) => Classification::Rejected(RejectReason::Rule(format!(
            "reputation update missing or invalid '{}'",
            field
        ))),
    }
}

/// Build a snapshot, or name the first missing field
fn reputation_snapshot(
    source: &str,
    timestamp: i64,
    details: &Map<String, Value>,
) -> Result<ReputationSnapshot, &'static str> {
    let int = |key: &'static str| coerce_i64(details.get(key)).ok_or(key);
    let float = |key: &'static str| coerce_f64(details.get(key)).ok_or(key);

    Ok(ReputationSnapshot {
        source: source.to_string(),
        satellite_id: non_empty_str(details.get("Satellite ID")).ok_or("Satellite ID")?,
        timestamp,
        audits_total: int("Total Audits")?,
        audits_success: int("Successful Audits")?,
        score_audit: float("Audit Score")?,
        score_online: float("Online Score")?,
        score_suspension: float("Suspension Score")?,
    })
}

/// Integer from a JSON number or numeric string
pub fn coerce_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.is_finite()).map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0 && f.is_finite())
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

/// Float from a JSON number or numeric string
pub fn coerce_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(level: &str, area: &str, action: &str, details: Value) -> String {
        format!("2025-10-25T12:00:00Z\t{}\t{}\t{}\t{}", level, area, action, details)
    }

    fn records(classification: Classification) -> Vec<ClassifiedRecord> {
        match classification {
            Classification::Accepted(records) => records,
            other => panic!("expected accepted line, got {:?}", other),
        }
    }

    #[test]
    fn test_ignore_rules() {
        let ignored = [
            line("DEBUG", "piecestore", "downloaded", json!({"Size": 1})),
            line("INFO", "piecemigrate:chore", "enqueued for migration", json!({})),
            line("INFO", "piecemigrate:chore", "enqueued for migration (batch)", json!({})),
            line("INFO", "orders", "finished", json!({})),
            line("INFO", "bandwidth", "Persisting bandwidth usage cache to db", json!({})),
            line("INFO", "piecestore", "New bloomfilter is received", json!({})),
            line("INFO", "trust", "Scheduling next refresh", json!({})),
        ];
        for raw in &ignored {
            assert_eq!(process_line("node", raw), Classification::Ignored, "{}", raw);
        }
    }

    #[test]
    fn test_ignore_rules_are_level_specific() {
        let raw = line("WARN", "orders", "finished", json!({}));
        assert_eq!(records(process_line("node", &raw)).len(), 1);
    }

    #[test]
    fn test_download_extracted_as_transfer_only() {
        let raw = line(
            "INFO",
            "piecestore",
            "downloaded",
            json!({"Piece ID": "p1", "Satellite ID": "s1", "Size": 2048, "Action": "GET"}),
        );
        let out = records(process_line("node", &raw));

        assert_eq!(out.len(), 1);
        let ClassifiedRecord::Transfer(transfer) = &out[0] else {
            panic!("expected transfer, got {:?}", out[0]);
        };
        assert_eq!(transfer.action, TransferAction::Download);
        assert!(transfer.is_success);
        assert!(!transfer.is_repair);
        assert_eq!(transfer.size, 2048);
        assert_eq!(transfer.timestamp, 1_761_393_600);
        assert!(!transfer.is_aggregated);
    }

    #[test]
    fn test_canceled_repair_upload() {
        let raw = line(
            "INFO",
            "piecestore",
            "upload canceled",
            json!({
                "Piece ID": "p2",
                "Satellite ID": "s1",
                "Size": "4096",
                "Offset": "12",
                "Action": "PUT_REPAIR",
                "Remote Address": "10.0.0.1:7777"
            }),
        );
        let out = records(process_line("node", &raw));
        let ClassifiedRecord::Transfer(transfer) = &out[0] else {
            panic!("expected transfer");
        };

        assert_eq!(transfer.action, TransferAction::Upload);
        assert!(!transfer.is_success);
        assert!(transfer.is_repair);
        assert_eq!(transfer.size, 4096);
        assert_eq!(transfer.offset, Some(12));
        assert_eq!(transfer.remote_address.as_deref(), Some("10.0.0.1:7777"));
    }

    #[test]
    fn test_incomplete_transfer_is_processed_without_records() {
        for details in [
            json!({"Piece ID": "p1", "Satellite ID": "s1"}),
            json!({"Piece ID": "p1", "Satellite ID": "s1", "Size": "lots"}),
            json!({"Piece ID": "", "Satellite ID": "s1", "Size": 1}),
            json!({"Piece ID": "p1", "Size": 1}),
            json!({"Piece ID": "p1", "Satellite ID": "s1", "Size": -1}),
        ] {
            let raw = line("INFO", "piecestore", "downloaded", details);
            assert_eq!(process_line("node", &raw), Classification::Accepted(Vec::new()));
        }
    }

    #[test]
    fn test_oversized_transfer_is_dropped() {
        for size in [json!(i64::MAX), json!("9223372036854775807"), json!(MAX_TRANSFER_SIZE + 1)] {
            let raw = line(
                "INFO",
                "piecestore",
                "uploaded",
                json!({"Piece ID": "p1", "Satellite ID": "s1", "Size": size}),
            );
            assert_eq!(process_line("node", &raw), Classification::Accepted(Vec::new()));
        }

        let raw = line(
            "INFO",
            "piecestore",
            "uploaded",
            json!({"Piece ID": "p1", "Satellite ID": "s1", "Size": MAX_TRANSFER_SIZE}),
        );
        let Classification::Accepted(records) = process_line("node", &raw) else {
            panic!("expected accepted");
        };
        assert!(matches!(&records[..], [ClassifiedRecord::Transfer(t)] if t.size == MAX_TRANSFER_SIZE));
    }

    #[test]
    fn test_bad_offset_becomes_none() {
        let raw = line(
            "INFO",
            "piecestore",
            "downloaded",
            json!({"Piece ID": "p1", "Satellite ID": "s1", "Size": 1, "Offset": "abc"}),
        );
        let out = records(process_line("node", &raw));
        let ClassifiedRecord::Transfer(transfer) = &out[0] else {
            panic!("expected transfer");
        };
        assert_eq!(transfer.offset, None);
    }

    #[test]
    fn test_other_piecestore_actions_pass_through() {
        let raw = line("INFO", "piecestore", "download started", json!({"Piece ID": "p1"}));
        let out = records(process_line("node", &raw));
        assert!(matches!(out[..], [ClassifiedRecord::Log(_)]));
    }

    #[test]
    fn test_reputation_with_string_numbers() {
        let raw = line(
            "INFO",
            "reputation:service",
            "update",
            json!({
                "Satellite ID": "12T",
                "Total Audits": "100",
                "Successful Audits": 98,
                "Audit Score": "0.98",
                "Online Score": "0.97",
                "Suspension Score": "1.0"
            }),
        );
        let out = records(process_line("node-1", &raw));

        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], ClassifiedRecord::Log(_)));
        let ClassifiedRecord::Reputation(rep) = &out[1] else {
            panic!("expected reputation");
        };
        assert_eq!(rep.source, "node-1");
        assert_eq!(rep.satellite_id, "12T");
        assert_eq!(rep.audits_total, 100);
        assert_eq!(rep.audits_success, 98);
        assert!((rep.score_audit - 0.98).abs() < 1e-9);
        assert!((rep.score_suspension - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_reputation_missing_field_rejected() {
        let raw = line(
            "INFO",
            "reputation:service",
            "update",
            json!({
                "Satellite ID": "34F",
                "Total Audits": "10",
                "Successful Audits": 9,
                "Audit Score": "0.91",
                "Online Score": "0.9"
            }),
        );
        assert!(matches!(
            process_line("node-2", &raw),
            Classification::Rejected(RejectReason::Rule(_))
        ));
    }

    #[test]
    fn test_generic_areas_pass_through() {
        let raw = line("INFO", "collector", "status", json!({"duration": "5s"}));
        let out = records(process_line("node-a", &raw));
        let ClassifiedRecord::Log(log) = &out[0] else {
            panic!("expected log record");
        };
        assert_eq!(log.area, "collector");
        assert_eq!(log.details.get("duration"), Some(&json!("5s")));

        let raw = line("ERROR", "piecestore", "download failed", json!({"error": "timeout"}));
        assert!(matches!(records(process_line("node-a", &raw))[..], [ClassifiedRecord::Log(_)]));
    }

    #[test]
    fn test_syntax_errors_rejected() {
        assert!(matches!(
            process_line("node", "not a log line"),
            Classification::Rejected(RejectReason::Syntax(ParseError::FieldCount(1)))
        ));
    }

    #[test]
    fn test_coercion() {
        assert_eq!(coerce_i64(Some(&json!(12))), Some(12));
        assert_eq!(coerce_i64(Some(&json!("12"))), Some(12));
        assert_eq!(coerce_i64(Some(&json!(12.0))), Some(12));
        assert_eq!(coerce_i64(Some(&json!(12.5))), None);
        assert_eq!(coerce_i64(Some(&json!(null))), None);
        assert_eq!(coerce_f64(Some(&json!("0.5"))), Some(0.5));
        assert_eq!(coerce_f64(None), None);
    }
}
