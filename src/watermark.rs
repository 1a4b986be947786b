use chrono::{DateTime, Duration as ChronoDuration, Utc};

pub const DEFAULT_LOOKBACK_HOURS: i64 = 24;

/// Starting point when nothing has been persisted yet: `now - lookback`.
pub fn initial(
    existing_max_processed: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lookback: ChronoDuration,
) -> DateTime<Utc> {
    existing_max_processed.unwrap_or(now - lookback)
}

pub fn advance(current: DateTime<Utc>, candidate: DateTime<Utc>) -> DateTime<Utc> {
    current.max(candidate)
}

/// Highest event timestamp known to be durably converted into anomaly rows.
///
/// Only the worker mutates it, and only after a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkStore {
    current: DateTime<Utc>,
}

impl WatermarkStore {
    pub fn new(current: DateTime<Utc>) -> Self {
        Self { current }
    }

    pub fn from_existing(
        existing_max_processed: Option<DateTime<Utc>>,
        lookback: ChronoDuration,
    ) -> Self {
        Self::new(initial(existing_max_processed, Utc::now(), lookback))
    }

    pub fn current(&self) -> DateTime<Utc> {
        self.current
    }

    /// Moves forward to `candidate` unless it is older than what we hold.
    /// Returns `true` when the watermark moved.
    pub fn advance(&mut self, candidate: DateTime<Utc>) -> bool {
        let next = advance(self.current, candidate);
        let moved = next > self.current;
        if candidate < self.current {
            tracing::warn!(
                current = %self.current,
                candidate = %candidate,
                "ignoring stale watermark candidate"
            );
        }
        self.current = next;
        moved
    }
}
