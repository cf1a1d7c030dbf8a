//! Circuit breaker: three-state admission gate with timed recovery probing.
//!
//! `can_execute` is the single admission gate; the OPEN→HALF_OPEN transition and its probe
//! bookkeeping happen atomically with the admission decision via an upgradable read lock, so
//! two callers racing the transition can't both believe they issued the first probe.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Numeric encoding for the `circuit_breaker_state` gauge.
    pub fn as_gauge(self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_probes_issued: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    inner: RwLock<Inner>,
    failure_threshold: u32,
    recovery: Duration,
    half_open_probes: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery: Duration, half_open_probes: u32) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_probes_issued: 0,
                opened_at: None,
            }),
            failure_threshold,
            recovery,
            half_open_probes,
        }
    }

    /// The single admission gate. Performs the OPEN→HALF_OPEN transition in place
    /// when the recovery window has elapsed, and issues at most `half_open_probes`
    /// concurrent probes while HALF_OPEN.
    pub fn can_execute(&self) -> bool {
        let guard = self.inner.upgradable_read();
        match guard.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = guard
                    .opened_at
                    .map(|t| t.elapsed() >= self.recovery)
                    .unwrap_or(false);
                if !elapsed {
                    return false;
                }
                let mut guard = parking_lot::RwLockUpgradableReadGuard::upgrade(guard);
                // Re-check under the write lock: another thread may have already flipped
                // us to HALF_OPEN while we waited for the upgrade.
                if guard.state == BreakerState::Open {
                    guard.state = BreakerState::HalfOpen;
                    guard.half_open_successes = 0;
                    guard.half_open_probes_issued = 1;
                    info!("circuit breaker: OPEN -> HALF_OPEN, issuing first probe");
                    return true;
                }
                drop(guard);
                self.can_execute()
            }
            BreakerState::HalfOpen => {
                if guard.half_open_probes_issued >= self.half_open_probes {
                    return false;
                }
                let mut guard = parking_lot::RwLockUpgradableReadGuard::upgrade(guard);
                if guard.state != BreakerState::HalfOpen
                    || guard.half_open_probes_issued >= self.half_open_probes
                {
                    return guard.state == BreakerState::Closed;
                }
                guard.half_open_probes_issued += 1;
                true
            }
        }
    }

    pub fn record_success(&self) {
        let mut guard = self.inner.write();
        match guard.state {
            BreakerState::Closed => {
                guard.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                guard.half_open_successes += 1;
                if guard.half_open_successes >= self.half_open_probes {
                    guard.state = BreakerState::Closed;
                    guard.consecutive_failures = 0;
                    guard.half_open_successes = 0;
                    guard.half_open_probes_issued = 0;
                    guard.opened_at = None;
                    info!("circuit breaker: HALF_OPEN -> CLOSED");
                }
            }
            BreakerState::Open => {
                // A success can't observably occur while OPEN (can_execute would have
                // refused it); ignore defensively rather than panic.
            }
        }
    }

    pub fn record_failure(&self) {
        let mut guard = self.inner.write();
        match guard.state {
            BreakerState::Closed => {
                guard.consecutive_failures += 1;
                if guard.consecutive_failures >= self.failure_threshold {
                    guard.state = BreakerState::Open;
                    guard.opened_at = Some(Instant::now());
                    warn!(
                        threshold = self.failure_threshold,
                        "circuit breaker: CLOSED -> OPEN"
                    );
                }
            }
            BreakerState::HalfOpen => {
                guard.state = BreakerState::Open;
                guard.opened_at = Some(Instant::now());
                guard.consecutive_failures = self.failure_threshold;
                guard.half_open_successes = 0;
                guard.half_open_probes_issued = 0;
                warn!("circuit breaker: HALF_OPEN -> OPEN (probe failed)");
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.read().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed_and_admits() {
        let b = CircuitBreaker::new(5, Duration::from_secs(30), 3);
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.can_execute());
    }

    #[test]
    fn trips_open_after_f_consecutive_failures() {
        let b = CircuitBreaker::new(5, Duration::from_secs(30), 3);
        for _ in 0..5 {
            assert!(b.can_execute());
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_execute());
    }

    #[test]
    fn success_resets_failure_counter_while_closed() {
        let b = CircuitBreaker::new(5, Duration::from_secs(30), 3);
        for _ in 0..4 {
            b.record_failure();
        }
        b.record_success();
        for _ in 0..4 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_recovery_window_and_closes_after_p_successes() {
        let b = CircuitBreaker::new(2, Duration::from_millis(20), 3);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_execute());
        std::thread::sleep(Duration::from_millis(30));
        assert!(b.can_execute());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_success();
        assert!(b.can_execute());
        b.record_success();
        assert!(b.can_execute());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_caps_concurrent_probes_at_p() {
        let b = CircuitBreaker::new(1, Duration::from_millis(1), 3);
        b.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(b.can_execute()); // probe 1 (also the OPEN->HALF_OPEN transition)
        assert!(b.can_execute()); // probe 2
        assert!(b.can_execute()); // probe 3
        assert!(!b.can_execute()); // fourth is refused
    }

    #[test]
    fn failure_in_half_open_reopens_and_restarts_timer() {
        let b = CircuitBreaker::new(1, Duration::from_millis(10), 3);
        b.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert!(b.can_execute());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_execute());
    }
}
