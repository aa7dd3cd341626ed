//! Storage ports and their adapters.
//!
//! The engine talks to storage exclusively through the traits in [`ports`].
//! [`memory::InMemoryStore`] serves tests and single-process development;
//! [`postgres::PostgresStore`] is the durable, multi-replica adapter.

use chrono::{DateTime, Duration, DurationRound, Utc};

mod merge;
pub mod memory;
pub mod ports;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::InMemoryStore;
pub use ports::Store;
#[cfg(feature = "database")]
pub use postgres::PostgresStore;

/// Truncates to the microsecond precision Postgres stores, so a value
/// written and read back compares equal to the one held in memory.
pub fn storage_time(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::microseconds(1)).unwrap_or(at)
}

/// Next `updated_at` revision for a row last written at `previous`.
///
/// Strictly greater than `previous`, so compare-and-swap on `updated_at`
/// cannot mistake two writes for one.
pub fn next_revision(
    previous: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    storage_time(now).max(previous + Duration::microseconds(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_always_moves_forward() {
        let t = Utc::now();
        assert!(next_revision(t, t) > t);
        assert!(next_revision(t, t - Duration::hours(1)) > t);
        let later = t + Duration::seconds(5);
        assert!(next_revision(t, later) <= later);
    }
}
