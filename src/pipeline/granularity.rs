//! Granularity ladder and time-bucket arithmetic

use serde::Serialize;

/// Seconds per minute; granularities are expressed in minutes
pub const MINUTE_SECS: i64 = 60;
const DAY_SECS: i64 = 24 * 60 * MINUTE_SECS;

/// Base granularity produced by the transfer aggregator
pub const BASE_GRANULARITY: u32 = 1;

/// Round a Unix timestamp down to a `granularity`-minute boundary
///
/// Buckets are aligned within the UTC day, so every granularity that divides
/// 1440 lines up with midnight.
pub fn floor_to_granularity(timestamp: i64, granularity: u32) -> i64 {
    let bucket_secs = i64::from(granularity.max(1)) * MINUTE_SECS;
    let day_start = timestamp - timestamp.rem_euclid(DAY_SECS);
    let secs_into_day = timestamp - day_start;
    day_start + (secs_into_day / bucket_secs) * bucket_secs
}

/// Width of a granularity bucket in seconds
pub fn granularity_secs(granularity: u32) -> i64 {
    i64::from(granularity) * MINUTE_SECS
}

/// One step of the promotion ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PromotionRule {
    pub from_granularity: u32,
    pub to_granularity: u32,
    /// The oldest fine row must be at least this old before promoting
    pub min_old_minutes: i64,
    /// Promotion cutoff lag; also the idle-tier threshold for the newest fine row
    pub newest_threshold_minutes: i64,
}

impl PromotionRule {
    pub const fn new(
        from_granularity: u32,
        to_granularity: u32,
        min_old_minutes: i64,
        newest_threshold_minutes: i64,
    ) -> Self {
        Self {
            from_granularity,
            to_granularity,
            min_old_minutes,
            newest_threshold_minutes,
        }
    }

    /// Default ladder: 1m → 5m → 60m
    pub fn default_ladder() -> Vec<PromotionRule> {
        vec![
            PromotionRule::new(1, 5, 120, 90),
            PromotionRule::new(5, 60, 36 * 60, 31 * 60),
        ]
    }

    /// Check a ladder is usable: coarser targets that are whole multiples of
    /// their source, in ascending order
    pub fn validate_ladder(rules: &[PromotionRule]) -> Result<(), String> {
        let mut previous_from = 0;
        for rule in rules {
            if rule.from_granularity == 0 || rule.to_granularity <= rule.from_granularity {
                return Err(format!(
                    "promotion {}→{} must go to a coarser granularity",
                    rule.from_granularity, rule.to_granularity
                ));
            }
            if rule.to_granularity % rule.from_granularity != 0 {
                return Err(format!(
                    "promotion {}→{}: target is not a multiple of the source",
                    rule.from_granularity, rule.to_granularity
                ));
            }
            if rule.from_granularity <= previous_from {
                return Err("promotion rules must be sorted by ascending granularity".to_string());
            }
            previous_from = rule.from_granularity;
        }
        Ok(())
    }
}
