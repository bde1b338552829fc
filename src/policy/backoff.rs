use chrono::{DateTime, Utc};

/// Parses a `Retry-After` header value into an absolute Unix timestamp
///
/// Both forms are accepted: delta-seconds (`120`) and an HTTP date
/// (`Wed, 21 Oct 2015 07:28:00 GMT`). Dates in the past yield `now`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<i64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(now.timestamp().saturating_add(seconds.min(i64::MAX as u64) as i64));
    }

    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.timestamp().max(now.timestamp()))
}

/// Caps how long a single rate-limit signal may hold a host
#[derive(Debug, Clone, Copy)]
pub struct HoldPolicy {
    max_hold: i64,
}

impl HoldPolicy {
    pub fn new(max_hold_secs: u64) -> Self {
        Self {
            max_hold: max_hold_secs.min(i64::MAX as u64) as i64,
        }
    }

    /// Hold deadline for a `Retry-After` value, or `None` if it is unparseable
    pub fn hold_until(&self, retry_after: &str, now: DateTime<Utc>) -> Option<i64> {
        let until = parse_retry_after(retry_after, now)?;
        Some(until.min(now.timestamp().saturating_add(self.max_hold)))
    }
}
