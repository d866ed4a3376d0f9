//! Timestamp helpers.

use chrono::{DateTime, Utc};

/// Current time, clamped so it is never earlier than `floor`.
///
/// Lifecycle timestamps must be ordered even if the wall clock steps
/// backwards between two transitions.
pub fn not_before(floor: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(floor)
}
