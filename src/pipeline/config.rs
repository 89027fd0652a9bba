//! Pipeline configuration from environment variables
//!
//! Every component receives its settings from a [`PipelineConfig`] passed in
//! at construction; nothing reads the environment after startup.

use super::clock::Clock;
use super::granularity::PromotionRule;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid source declaration '{raw}': {reason}")]
    InvalidSource { raw: String, reason: String },

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Invalid promotion ladder: {0}")]
    InvalidLadder(String),
}

/// Where a source's lines come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    File(PathBuf),
    Tcp { host: String, port: u16 },
}

/// One configured log source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDefinition {
    pub name: String,
    pub kind: SourceKind,
    /// Node status API base URL (consumed by the external node poller)
    pub node_api: Option<String>,
}

impl SourceDefinition {
    /// Parse `NAME:PATH`, `NAME:HOST:PORT` or `NAME:[IPv6]:PORT`, with an
    /// optional `|NODEAPI_URL` suffix
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSource {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        let (base, node_api) = match raw.split_once('|') {
            Some((base, api)) => {
                let api = api.trim();
                (base, (!api.is_empty()).then(|| api.to_string()))
            }
            None => (raw, None),
        };

        let (name, spec) = base.split_once(':').ok_or_else(|| invalid("expected NAME:SPEC"))?;
        let name = name.trim();
        let spec = spec.trim();

        if name.is_empty() {
            return Err(invalid("missing node name"));
        }
        if spec.is_empty() {
            return Err(invalid("missing path or address"));
        }

        let kind = match split_host_port(spec) {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("port out of range"))?;
                SourceKind::Tcp {
                    host: host.to_string(),
                    port,
                }
            }
            None => SourceKind::File(PathBuf::from(spec)),
        };

        Ok(Self {
            name: name.to_string(),
            kind,
            node_api,
        })
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            SourceKind::File(path) => format!("{} (file {})", self.name, path.display()),
            SourceKind::Tcp { host, port } => format!("{} (tcp {}:{})", self.name, host, port),
        }
    }
}

/// Split `host:port` or `[v6]:port`; `None` means the spec is a file path
fn split_host_port(spec: &str) -> Option<(&str, &str)> {
    let is_port = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());

    if let Some(rest) = spec.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return is_port(port).then_some((host, port));
    }

    let (host, port) = spec.rsplit_once(':')?;
    if !is_port(port) || host.is_empty() || host.contains('/') || host.contains('\\') {
        return None;
    }
    Some((host, port))
}

/// Split a sources setting into raw entries
///
/// Accepts a JSON array string, or a comma/newline separated list.
pub fn split_source_list(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.starts_with('[') {
        if let Ok(items) = serde_json::from_str::<Vec<serde_json::Value>>(trimmed) {
            return items
                .into_iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => s.trim().to_string(),
                    other => other.to_string(),
                })
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    trimmed
        .replace('\n', ",")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_sources(value: &str) -> Result<Vec<SourceDefinition>, ConfigError> {
    split_source_list(value)
        .iter()
        .map(|raw| SourceDefinition::parse(raw))
        .collect()
}

/// Per-table retention in minutes; `None` keeps rows forever
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub log_entries: Option<i64>,
    pub transfers: Option<i64>,
    pub transfer_grouped: Option<i64>,
}

impl RetentionPolicy {
    /// Negative minutes are the "unlimited" sentinel
    pub fn minutes(value: i64) -> Option<i64> {
        (value >= 0).then_some(value)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            log_entries: Some(40_320),
            transfers: Some(1_440),
            transfer_grouped: None,
        }
    }
}

/// Configuration for the ingestion pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: PathBuf,

    /// Ordered log sources, one watcher each
    pub sources: Vec<SourceDefinition>,

    /// Watcher idle sleep between reads
    pub poll_interval: Duration,

    /// Buffered records per flush
    pub batch_size: usize,

    /// Pause between scheduler cycles
    pub grouping_interval: Duration,

    /// Flush pause after a failed write
    pub db_write_suspend: Duration,

    pub retention: RetentionPolicy,

    /// Directory for per-source unprocessed line files
    pub unprocessed_log_dir: PathBuf,

    /// Shift the logical "now" back by this many days
    pub days_offset: i64,

    pub promotion_rules: Vec<PromotionRule>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/monstr.db"),
            sources: Vec::new(),
            poll_interval: Duration::from_secs(1),
            batch_size: 32,
            grouping_interval: Duration::from_secs(120),
            db_write_suspend: Duration::from_secs(60),
            retention: RetentionPolicy::default(),
            unprocessed_log_dir: PathBuf::from("./data/"),
            days_offset: 0,
            promotion_rules: PromotionRule::default_ladder(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `MONSTR_DB_PATH` (default: ./data/monstr.db)
    /// - `MONSTR_SOURCES` (default: none)
    /// - `MONSTR_LOG_POLL_INTERVAL` (default: 1.0 seconds)
    /// - `MONSTR_LOG_BATCH_SIZE` (default: 32)
    /// - `MONSTR_GROUPING_INTERVAL_SECONDS` (default: 120)
    /// - `MONSTR_DB_WRITE_SUSPEND_SECONDS` (default: 60)
    /// - `MONSTR_RETENTION_MINUTES` (default: 40320)
    /// - `MONSTR_RETENTION_LOG_ENTRIES_MINUTES` (default: 40320)
    /// - `MONSTR_RETENTION_TRANSFERS_MINUTES` (default: 1440)
    /// - `MONSTR_RETENTION_TRANSFER_GROUPED_MINUTES` (default: -1, unlimited)
    /// - `MONSTR_UNPROCESSED_LOG_DIR` (default: ./data/)
    /// - `MONSTR_DAYS_OFFSET` (default: 0)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup (tests pass a map instead of the environment)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let poll_secs: f64 = parse_or(&get, "MONSTR_LOG_POLL_INTERVAL", 1.0)?;
        if !poll_secs.is_finite() || poll_secs <= 0.0 {
            return Err(invalid_value("MONSTR_LOG_POLL_INTERVAL", poll_secs));
        }

        let batch_size: usize = parse_or(&get, "MONSTR_LOG_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(invalid_value("MONSTR_LOG_BATCH_SIZE", batch_size));
        }

        let grouping_secs: u64 = parse_or(&get, "MONSTR_GROUPING_INTERVAL_SECONDS", 120)?;
        let suspend_secs: u64 = parse_or(&get, "MONSTR_DB_WRITE_SUSPEND_SECONDS", 60)?;

        let global_retention: i64 = parse_or(&get, "MONSTR_RETENTION_MINUTES", 40_320)?;
        // Unparsable per-table overrides fall back to the global value
        let table_retention = |key: &str, default: i64| -> Option<i64> {
            let minutes = match get(key) {
                Some(raw) => raw.parse::<i64>().unwrap_or(global_retention),
                None => default,
            };
            RetentionPolicy::minutes(minutes)
        };

        let sources = match get("MONSTR_SOURCES") {
            Some(raw) => parse_sources(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            db_path: get("MONSTR_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            sources,
            poll_interval: Duration::from_secs_f64(poll_secs),
            batch_size,
            grouping_interval: Duration::from_secs(grouping_secs),
            db_write_suspend: Duration::from_secs(suspend_secs),
            retention: RetentionPolicy {
                log_entries: table_retention("MONSTR_RETENTION_LOG_ENTRIES_MINUTES", global_retention),
                transfers: table_retention("MONSTR_RETENTION_TRANSFERS_MINUTES", 1_440),
                transfer_grouped: table_retention("MONSTR_RETENTION_TRANSFER_GROUPED_MINUTES", -1),
            },
            unprocessed_log_dir: get("MONSTR_UNPROCESSED_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.unprocessed_log_dir),
            days_offset: parse_or(&get, "MONSTR_DAYS_OFFSET", 0)?,
            promotion_rules: defaults.promotion_rules,
        })
    }

    /// Logical clock honouring `days_offset`
    pub fn clock(&self) -> Clock {
        Clock::with_days_offset(self.days_offset)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        PromotionRule::validate_ladder(&self.promotion_rules).map_err(ConfigError::InvalidLadder)
    }
}

fn invalid_value(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|_| invalid_value(key, raw)),
        None => Ok(default),
    }
}
