//! Pure service-loop decision logic.
//!
//! The timing decisions of one loop iteration, separated from the I/O so
//! they can be tested without sockets or a running node: when each
//! periodic step is due, how suspend/resume is detected, which ping plan a
//! cycle uses, when the announce-all timer may be advanced, and how long
//! the next wait should be.

use ethermesh_core::constants::{
    DB_CLEAN_PERIOD, MIN_SERVICE_LOOP_INTERVAL, MULTICAST_LIKE_ANNOUNCE_ALL_PERIOD,
    MULTICAST_LOCAL_POLL_PERIOD, NETWORK_FINGERPRINT_CHECK_DELAY, PING_CHECK_DELAY,
    SLEEP_WAKE_DETECTION_THRESHOLD,
};

/// Last-run timestamps for the periodic service-loop steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleTimers {
    pub last_ping_check: u64,
    pub last_clean: u64,
    pub last_network_fingerprint_check: u64,
    pub last_autoconfigure_check: u64,
    pub last_multicast_check: u64,
    pub last_multicast_announce_all: u64,
}

impl CycleTimers {
    /// Fresh timers: everything immediately due except housekeeping, which
    /// has nothing to clean right after startup.
    #[must_use]
    pub fn new(now: u64) -> Self {
        Self {
            last_ping_check: 0,
            last_clean: now,
            last_network_fingerprint_check: 0,
            last_autoconfigure_check: 0,
            last_multicast_check: 0,
            last_multicast_announce_all: 0,
        }
    }

    /// Force the environment-sensitive checks on the next iteration after
    /// a suspected suspend/resume.
    pub fn force_environment_resync(&mut self) {
        self.last_network_fingerprint_check = 0;
        self.last_multicast_check = 0;
    }

    /// A fingerprint change re-kicks autoconfiguration and the multicast
    /// check.
    pub fn note_fingerprint_change(&mut self) {
        self.last_autoconfigure_check = 0;
        self.last_multicast_check = 0;
    }

    #[must_use]
    pub fn due_fingerprint_check(&self, now: u64) -> bool {
        due(now, self.last_network_fingerprint_check, NETWORK_FINGERPRINT_CHECK_DELAY)
    }

    #[must_use]
    pub fn due_multicast_check(&self, now: u64) -> bool {
        due(now, self.last_multicast_check, MULTICAST_LOCAL_POLL_PERIOD)
    }

    #[must_use]
    pub fn due_announce_all(&self, now: u64) -> bool {
        due(
            now,
            self.last_multicast_announce_all,
            MULTICAST_LIKE_ANNOUNCE_ALL_PERIOD,
        )
    }

    #[must_use]
    pub fn due_ping_check(&self, now: u64) -> bool {
        due(now, self.last_ping_check, PING_CHECK_DELAY)
    }

    #[must_use]
    pub fn due_clean(&self, now: u64) -> bool {
        due(now, self.last_clean, DB_CLEAN_PERIOD)
    }
}

fn due(now: u64, last: u64, period: u64) -> bool {
    now.saturating_sub(last) >= period
}

/// Whether an overshot wait indicates the host was suspended.
///
/// `last_delay_delta` is how much longer the previous wait lasted than
/// requested.
#[must_use]
pub fn sleep_wake_detected(last_delay_delta: i64) -> bool {
    last_delay_delta >= SLEEP_WAKE_DETECTION_THRESHOLD as i64
}

/// How a ping cycle selects its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingPlan {
    /// Supernodes ping only stale fellow supernodes and never send
    /// firewall openers.
    Supernode,
    /// Ping every peer with a direct path.
    All,
    /// Ping peers due a keepalive; open firewalls for peers due an opener.
    Selective,
}

/// Choose the ping plan for one cycle.
#[must_use]
pub fn choose_ping_plan(am_supernode: bool, ping_all: bool) -> PingPlan {
    if am_supernode {
        PingPlan::Supernode
    } else if ping_all {
        PingPlan::All
    } else {
        PingPlan::Selective
    }
}

/// Whether this cycle may advance the announce-all timer. Keeping the
/// timer still while nothing announced keeps the announce-all condition
/// pending through startup until there is at least one group to announce.
#[must_use]
pub fn should_record_announce_all(announce_all: bool, announced_any: bool) -> bool {
    announce_all && announced_any
}

/// Clamp the switch's requested delay to one service-loop wait.
#[must_use]
pub fn compute_wait(switch_delay: u64) -> u64 {
    switch_delay.min(MIN_SERVICE_LOOP_INTERVAL)
}

/// How much longer a wait took than requested.
#[must_use]
pub fn delay_delta(requested_ms: u64, actual_ms: u64) -> i64 {
    actual_ms as i64 - requested_ms as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn fresh_timers_make_everything_due_except_clean() {
        let timers = CycleTimers::new(T0);
        assert!(timers.due_fingerprint_check(T0));
        assert!(timers.due_multicast_check(T0));
        assert!(timers.due_announce_all(T0));
        assert!(timers.due_ping_check(T0));
        assert!(!timers.due_clean(T0));
        assert!(timers.due_clean(T0 + DB_CLEAN_PERIOD));
    }

    #[test]
    fn steps_become_due_exactly_at_their_period() {
        let mut timers = CycleTimers::new(T0);
        timers.last_ping_check = T0;
        assert!(!timers.due_ping_check(T0 + PING_CHECK_DELAY - 1));
        assert!(timers.due_ping_check(T0 + PING_CHECK_DELAY));

        timers.last_multicast_check = T0;
        assert!(!timers.due_multicast_check(T0 + MULTICAST_LOCAL_POLL_PERIOD - 1));
        assert!(timers.due_multicast_check(T0 + MULTICAST_LOCAL_POLL_PERIOD));

        timers.last_network_fingerprint_check = T0;
        assert!(!timers.due_fingerprint_check(T0 + NETWORK_FINGERPRINT_CHECK_DELAY - 1));
        assert!(timers.due_fingerprint_check(T0 + NETWORK_FINGERPRINT_CHECK_DELAY));
    }

    #[test]
    fn environment_resync_forces_both_checks() {
        let mut timers = CycleTimers::new(T0);
        timers.last_network_fingerprint_check = T0;
        timers.last_multicast_check = T0;
        timers.last_ping_check = T0;

        timers.force_environment_resync();
        assert!(timers.due_fingerprint_check(T0 + 1));
        assert!(timers.due_multicast_check(T0 + 1));
        // Ping scheduling is untouched; ping_all covers that path.
        assert!(!timers.due_ping_check(T0 + 1));
    }

    #[test]
    fn fingerprint_change_rekicks_autoconf_and_multicast() {
        let mut timers = CycleTimers::new(T0);
        timers.last_autoconfigure_check = T0;
        timers.last_multicast_check = T0;
        timers.note_fingerprint_change();
        assert_eq!(timers.last_autoconfigure_check, 0);
        assert_eq!(timers.last_multicast_check, 0);
    }

    #[test]
    fn sleep_wake_threshold_is_inclusive() {
        let threshold = SLEEP_WAKE_DETECTION_THRESHOLD as i64;
        assert!(!sleep_wake_detected(0));
        assert!(!sleep_wake_detected(threshold - 1));
        assert!(sleep_wake_detected(threshold));
        assert!(sleep_wake_detected(threshold * 10));
        assert!(!sleep_wake_detected(-threshold));
    }

    #[test]
    fn ping_plan_selection() {
        // Supernode status dominates ping_all.
        assert_eq!(choose_ping_plan(true, true), PingPlan::Supernode);
        assert_eq!(choose_ping_plan(true, false), PingPlan::Supernode);
        assert_eq!(choose_ping_plan(false, true), PingPlan::All);
        assert_eq!(choose_ping_plan(false, false), PingPlan::Selective);
    }

    #[test]
    fn announce_all_timer_only_advances_when_something_announced() {
        assert!(should_record_announce_all(true, true));
        assert!(!should_record_announce_all(true, false));
        assert!(!should_record_announce_all(false, true));
        assert!(!should_record_announce_all(false, false));
    }

    #[test]
    fn wait_is_clamped_to_loop_interval() {
        assert_eq!(compute_wait(0), 0);
        assert_eq!(compute_wait(50), 50);
        assert_eq!(compute_wait(MIN_SERVICE_LOOP_INTERVAL), MIN_SERVICE_LOOP_INTERVAL);
        assert_eq!(compute_wait(u64::MAX), MIN_SERVICE_LOOP_INTERVAL);
    }

    #[test]
    fn delay_delta_signs() {
        assert_eq!(delay_delta(500, 500), 0);
        assert_eq!(delay_delta(500, 450), -50);
        assert_eq!(delay_delta(500, 20_500), 20_000);
    }
}
