use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Delay before the next attempt of a job that has failed `retry_count`
/// retries so far.
///
/// A lookup table, not a curve: 5m, 30m, 2h, then 24h from the third retry on.
pub fn backoff(retry_count: i32) -> Duration {
    let secs = match retry_count {
        i32::MIN..=0 => 5 * MINUTE,
        1 => 30 * MINUTE,
        2 => 2 * HOUR,
        _ => 24 * HOUR,
    };
    Duration::from_secs(secs)
}
