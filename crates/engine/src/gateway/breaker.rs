//! Per-integration circuit breaker.
//!
//! One breaker exists per (integration, connection) key. State transitions
//! happen only through [`CircuitBreakerRegistry::admit`],
//! [`record_success`](CircuitBreakerRegistry::record_success), and
//! [`record_failure`](CircuitBreakerRegistry::record_failure); each is a
//! single read-modify-write under the registry mutex, so concurrent
//! invocations of the same integration cannot lose updates. A half-open
//! breaker admits exactly one trial call; concurrent callers are rejected
//! until that trial's outcome is recorded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;

/// Breaker tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before allowing a trial.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Identity of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    pub integration_slug: String,
    pub connection_id: Option<String>,
}

impl BreakerKey {
    pub fn new(integration_slug: impl Into<String>, connection_id: Option<String>) -> Self {
        Self {
            integration_slug: integration_slug.into(),
            connection_id,
        }
    }
}

/// Whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed; call normally.
    Allowed,
    /// Breaker half-open; this call is the single trial.
    Trial,
    /// Breaker open; fail fast without network I/O.
    Rejected,
}

#[derive(Debug, Clone)]
struct BreakerState {
    status: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            status: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// Keyed, lock-protected store of breaker states.
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<BreakerKey, BreakerState>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Decides whether a call for `key` may proceed right now.
    ///
    /// An open breaker whose cooldown has elapsed transitions to half-open
    /// and admits this caller as the single trial.
    pub fn admit(&self, key: &BreakerKey) -> Admission {
        let mut states = self.states.lock().expect("breaker lock");
        let state = states.entry(key.clone()).or_insert_with(BreakerState::closed);

        match state.status {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let cooled_down = state
                    .opened_at
                    .map(|opened_at| self.clock.now() - opened_at >= chrono::TimeDelta::from_std(self.config.cooldown).expect("cooldown fits"))
                    .unwrap_or(true);
                if cooled_down {
                    state.status = CircuitState::HalfOpen;
                    state.trial_in_flight = true;
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    Admission::Rejected
                } else {
                    state.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    /// Records a successful call: closes the breaker and resets the failure
    /// count.
    pub fn record_success(&self, key: &BreakerKey) {
        let mut states = self.states.lock().expect("breaker lock");
        let state = states.entry(key.clone()).or_insert_with(BreakerState::closed);
        *state = BreakerState::closed();
    }

    /// Records a failed call.
    ///
    /// A failed half-open trial reopens the breaker and restarts the
    /// cooldown; in the closed state, crossing the failure threshold opens
    /// the breaker.
    pub fn record_failure(&self, key: &BreakerKey) {
        let mut states = self.states.lock().expect("breaker lock");
        let state = states.entry(key.clone()).or_insert_with(BreakerState::closed);
        state.trial_in_flight = false;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        let should_open = matches!(state.status, CircuitState::HalfOpen)
            || state.consecutive_failures >= self.config.failure_threshold;
        if should_open {
            state.status = CircuitState::Open;
            state.opened_at = Some(self.clock.now());
        }
    }

    /// Clears an admitted trial without recording an outcome.
    ///
    /// Used when a call fails locally after admission, before any network
    /// I/O; the upstream's health was not observed, so the state machine
    /// must not move.
    pub fn release(&self, key: &BreakerKey) {
        let mut states = self.states.lock().expect("breaker lock");
        if let Some(state) = states.get_mut(key) {
            state.trial_in_flight = false;
        }
    }

    /// Current status for a key (closed when never used).
    pub fn state(&self, key: &BreakerKey) -> CircuitState {
        self.states
            .lock()
            .expect("breaker lock")
            .get(key)
            .map(|state| state.status)
            .unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry(threshold: u32, cooldown_secs: u64) -> (CircuitBreakerRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = CircuitBreakerRegistry::new(
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(cooldown_secs),
            },
            clock.clone(),
        );
        (registry, clock)
    }

    fn key() -> BreakerKey {
        BreakerKey::new("slack", None)
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let (registry, _clock) = registry(3, 30);
        for _ in 0..2 {
            registry.record_failure(&key());
            assert_eq!(registry.state(&key()), CircuitState::Closed);
        }
        registry.record_failure(&key());
        assert_eq!(registry.state(&key()), CircuitState::Open);
        assert_eq!(registry.admit(&key()), Admission::Rejected);
    }

    #[test]
    fn success_resets_the_failure_count() {
        let (registry, _clock) = registry(3, 30);
        registry.record_failure(&key());
        registry.record_failure(&key());
        registry.record_success(&key());
        registry.record_failure(&key());
        registry.record_failure(&key());
        assert_eq!(registry.state(&key()), CircuitState::Closed);
    }

    #[test]
    fn cooldown_admits_exactly_one_trial() {
        let (registry, clock) = registry(1, 30);
        registry.record_failure(&key());
        assert_eq!(registry.admit(&key()), Admission::Rejected);

        clock.advance(Duration::from_secs(31));
        assert_eq!(registry.admit(&key()), Admission::Trial);
        // concurrent caller while the trial is in flight
        assert_eq!(registry.admit(&key()), Admission::Rejected);
    }

    #[test]
    fn trial_success_closes_the_breaker() {
        let (registry, clock) = registry(1, 30);
        registry.record_failure(&key());
        clock.advance(Duration::from_secs(31));
        assert_eq!(registry.admit(&key()), Admission::Trial);

        registry.record_success(&key());
        assert_eq!(registry.state(&key()), CircuitState::Closed);
        assert_eq!(registry.admit(&key()), Admission::Allowed);
    }

    #[test]
    fn trial_failure_reopens_and_restarts_the_cooldown() {
        let (registry, clock) = registry(1, 30);
        registry.record_failure(&key());
        clock.advance(Duration::from_secs(31));
        assert_eq!(registry.admit(&key()), Admission::Trial);

        registry.record_failure(&key());
        assert_eq!(registry.state(&key()), CircuitState::Open);
        assert_eq!(registry.admit(&key()), Admission::Rejected);

        clock.advance(Duration::from_secs(31));
        assert_eq!(registry.admit(&key()), Admission::Trial);
    }

    #[test]
    fn releasing_a_trial_allows_the_next_caller() {
        let (registry, clock) = registry(1, 30);
        registry.record_failure(&key());
        clock.advance(Duration::from_secs(31));
        assert_eq!(registry.admit(&key()), Admission::Trial);

        registry.release(&key());
        assert_eq!(registry.state(&key()), CircuitState::HalfOpen);
        assert_eq!(registry.admit(&key()), Admission::Trial);
    }

    #[test]
    fn keys_isolate_integrations_and_connections() {
        let (registry, _clock) = registry(1, 30);
        registry.record_failure(&key());
        assert_eq!(registry.state(&key()), CircuitState::Open);

        let other_connection = BreakerKey::new("slack", Some("conn-1".into()));
        assert_eq!(registry.state(&other_connection), CircuitState::Closed);
        assert_eq!(registry.admit(&other_connection), Admission::Allowed);
    }
}
