//! Per-destination circuit breaker.
//!
//! State is serialized behind a `parking_lot::Mutex` so concurrent failures
//! cannot double count or race a Closed→Open against a HalfOpen→Closed
//! transition. Thresholds are not stored here: each call passes the
//! [`BreakerSettings`] of the route it is serving, so a reload that only
//! changes a policy does not discard the accumulated state.
use std::{
    collections::VecDeque,
    fmt,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds taken from the calling route's resilience policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub break_duration: Duration,
    pub half_open_max_trials: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(30),
            break_duration: Duration::from_secs(5),
            half_open_max_trials: 1,
        }
    }
}

/// A state change, reported to the caller so it can emit an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
}

impl BreakerInner {
    fn transition(&mut self, to: BreakerState, now: Instant) -> Option<BreakerTransition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        match to {
            BreakerState::Closed => {
                self.failures.clear();
                self.opened_at = None;
                self.trials_in_flight = 0;
            }
            BreakerState::Open => {
                self.failures.clear();
                self.opened_at = Some(now);
                self.trials_in_flight = 0;
            }
            BreakerState::HalfOpen => {
                self.trials_in_flight = 0;
            }
        }
        Some(BreakerTransition { from, to })
    }

    fn cooldown_elapsed(&self, settings: &BreakerSettings, now: Instant) -> bool {
        self.opened_at
            .is_none_or(|opened| now.saturating_duration_since(opened) >= settings.break_duration)
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trials_in_flight: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// True when a call right now would be short-circuited.
    ///
    /// Used by the load balancer to skip destinations; does not change state.
    pub fn is_rejecting(&self, settings: &BreakerSettings) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => !inner.cooldown_elapsed(settings, Instant::now()),
            BreakerState::HalfOpen => inner.trials_in_flight >= settings.half_open_max_trials,
        }
    }

    /// Ask permission to call the destination.
    ///
    /// Returns the permit plus the transition it caused (Open→HalfOpen once the
    /// cooldown has elapsed), or `None` when the call must be short-circuited.
    pub fn try_acquire(
        &self,
        settings: &BreakerSettings,
    ) -> Option<(BreakerPermit<'_>, Option<BreakerTransition>)> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut transition = None;

        if inner.state == BreakerState::Open {
            if !inner.cooldown_elapsed(settings, now) {
                return None;
            }
            transition = inner.transition(BreakerState::HalfOpen, now);
        }

        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::HalfOpen => {
                if inner.trials_in_flight >= settings.half_open_max_trials {
                    return None;
                }
                inner.trials_in_flight += 1;
                true
            }
            BreakerState::Open => return None,
        };

        Some((
            BreakerPermit {
                breaker: self,
                settings: *settings,
                trial,
                resolved: false,
            },
            transition,
        ))
    }

    fn on_success(&self, trial: bool) -> Option<BreakerTransition> {
        let mut inner = self.inner.lock();
        if trial && inner.state == BreakerState::HalfOpen {
            return inner.transition(BreakerState::Closed, Instant::now());
        }
        None
    }

    fn on_failure(&self, trial: bool, settings: &BreakerSettings) -> Option<BreakerTransition> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen if trial => inner.transition(BreakerState::Open, now),
            BreakerState::Closed => {
                inner.failures.push_back(now);
                while let Some(oldest) = inner.failures.front() {
                    if now.saturating_duration_since(*oldest) > settings.failure_window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() as u32 >= settings.failure_threshold {
                    inner.transition(BreakerState::Open, now)
                } else {
                    None
                }
            }
            // outcome of a call admitted under an earlier state
            _ => None,
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }
}

/// Admission to call a destination. Must be resolved with
/// [`BreakerPermit::record_success`] or [`BreakerPermit::record_failure`];
/// dropping an unresolved half-open permit frees its trial slot.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    settings: BreakerSettings,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) -> Option<BreakerTransition> {
        self.resolved = true;
        self.breaker.on_success(self.trial)
    }

    pub fn record_failure(mut self) -> Option<BreakerTransition> {
        self.resolved = true;
        self.breaker.on_failure(self.trial, &self.settings)
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.resolved {
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: u32, break_ms: u64) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: threshold,
            failure_window: Duration::from_secs(30),
            break_duration: Duration::from_millis(break_ms),
            half_open_max_trials: 1,
        }
    }

    fn fail(breaker: &CircuitBreaker, settings: &BreakerSettings) -> Option<BreakerTransition> {
        let (permit, _) = breaker.try_acquire(settings).expect("admitted");
        permit.record_failure()
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new();
        let settings = settings(3, 10_000);

        assert_eq!(fail(&breaker, &settings), None);
        assert_eq!(fail(&breaker, &settings), None);
        assert_eq!(
            fail(&breaker, &settings),
            Some(BreakerTransition {
                from: BreakerState::Closed,
                to: BreakerState::Open
            })
        );

        assert!(breaker.try_acquire(&settings).is_none());
        assert!(breaker.is_rejecting(&settings));
    }

    #[test]
    fn test_successes_in_closed_state_do_not_open() {
        let breaker = CircuitBreaker::new();
        let settings = settings(2, 10_000);

        for _ in 0..10 {
            let (permit, _) = breaker.try_acquire(&settings).unwrap();
            assert_eq!(permit.record_success(), None);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_admits_exactly_one_trial() {
        let breaker = CircuitBreaker::new();
        let settings = settings(1, 20);
        fail(&breaker, &settings);

        std::thread::sleep(Duration::from_millis(40));
        assert!(!breaker.is_rejecting(&settings));

        let (trial, transition) = breaker.try_acquire(&settings).unwrap();
        assert!(trial.is_trial());
        assert_eq!(
            transition,
            Some(BreakerTransition {
                from: BreakerState::Open,
                to: BreakerState::HalfOpen
            })
        );
        assert!(breaker.try_acquire(&settings).is_none());

        assert_eq!(
            trial.record_success(),
            Some(BreakerTransition {
                from: BreakerState::HalfOpen,
                to: BreakerState::Closed
            })
        );
        assert!(breaker.try_acquire(&settings).is_some());
    }

    #[test]
    fn test_failed_trial_reopens_and_restarts_cooldown() {
        let breaker = CircuitBreaker::new();
        let settings = settings(1, 30);
        fail(&breaker, &settings);
        std::thread::sleep(Duration::from_millis(50));

        let (trial, _) = breaker.try_acquire(&settings).unwrap();
        assert_eq!(
            trial.record_failure(),
            Some(BreakerTransition {
                from: BreakerState::HalfOpen,
                to: BreakerState::Open
            })
        );
        assert!(breaker.try_acquire(&settings).is_none());
    }

    #[test]
    fn test_dropped_trial_releases_slot() {
        let breaker = CircuitBreaker::new();
        let settings = settings(1, 10);
        fail(&breaker, &settings);
        std::thread::sleep(Duration::from_millis(30));

        {
            let (_trial, _) = breaker.try_acquire(&settings).unwrap();
            assert!(breaker.try_acquire(&settings).is_none());
        }
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire(&settings).is_some());
    }

    #[test]
    fn test_failures_outside_window_are_forgotten() {
        let breaker = CircuitBreaker::new();
        let settings = BreakerSettings {
            failure_threshold: 2,
            failure_window: Duration::from_millis(20),
            break_duration: Duration::from_secs(10),
            half_open_max_trials: 1,
        };

        fail(&breaker, &settings);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(fail(&breaker, &settings), None);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
