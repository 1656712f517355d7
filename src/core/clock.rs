use std::time::Duration;

use time::OffsetDateTime;

/// Returns the time elapsed between `since` and `now`, zero if `since` is in the future.
pub(crate) fn elapsed(since: OffsetDateTime, now: OffsetDateTime) -> Duration {
    (now - since).try_into().unwrap_or(Duration::ZERO)
}

/// Returns `true` if more than `interval` has passed since `since`, or if `since` never happened.
pub(crate) fn is_due(since: Option<OffsetDateTime>, now: OffsetDateTime, interval: Duration) -> bool {
    since.map_or(true, |since| elapsed(since, now) >= interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_saturates() {
        let now = OffsetDateTime::now_utc();
        let later = now + Duration::from_secs(5);

        assert_eq!(elapsed(now, later), Duration::from_secs(5));
        assert_eq!(elapsed(later, now), Duration::ZERO);
    }

    #[test]
    fn due() {
        let now = OffsetDateTime::now_utc();
        let interval = Duration::from_secs(10);

        assert!(is_due(None, now, interval));
        assert!(!is_due(Some(now), now + Duration::from_secs(9), interval));
        assert!(is_due(Some(now), now + interval, interval));
    }
}
