//! Logical "now" shared by the time-dependent pipeline stages

use std::sync::Arc;

/// Timestamp source (Unix seconds)
///
/// Production uses the system clock shifted back by a configurable number of
/// days; tests pin time with [`Clock::fixed`].
#[derive(Clone)]
pub struct Clock {
    now_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl Clock {
    /// System time via `chrono::Utc::now()`
    pub fn system() -> Self {
        Self::with_days_offset(0)
    }

    /// System time moved `days_offset` days into the past
    pub fn with_days_offset(days_offset: i64) -> Self {
        let shift = days_offset * 24 * 60 * 60;
        Self::from_fn(move || chrono::Utc::now().timestamp() - shift)
    }

    /// A clock frozen at `timestamp`
    pub fn fixed(timestamp: i64) -> Self {
        Self::from_fn(move || timestamp)
    }

    pub fn from_fn(now_fn: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        Self {
            now_fn: Arc::new(now_fn),
        }
    }

    pub fn now(&self) -> i64 {
        (self.now_fn)()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").field("now", &self.now()).finish()
    }
}
