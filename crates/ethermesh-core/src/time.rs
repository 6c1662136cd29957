//! Wall-clock sampling shared by the service loop and peer bookkeeping.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// All peer activity timestamps and service-loop timers are expressed in
/// this clock. Returns 0 if the system clock is before the epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        // Sanity: we are later than 2020-01-01.
        assert!(a > 1_577_836_800_000);
    }
}
