//! Per-channel circuit breaker.
//!
//! CLOSED / OPEN / HALF_OPEN state machine over a windowed failure count.
//! The breaker never performs restarts; it answers "may a start be attempted
//! now" and records outcomes. At most one half-open probe is in flight per
//! channel, and all transitions happen atomically under the channel's entry
//! lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::clock::{Clock, SharedClock};
use crate::config::BreakerConfig;
use crate::metrics;
use crate::models::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

#[derive(Debug)]
struct ChannelCircuit {
    state: CircuitState,
    /// Failure instants within the accounting window.
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_probe_pending: bool,
}

impl ChannelCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            half_open_probe_pending: false,
        }
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: SharedClock,
    channels: DashMap<ChannelId, Arc<Mutex<ChannelCircuit>>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            channels: DashMap::new(),
        }
    }

    fn entry(&self, channel_id: &ChannelId) -> Arc<Mutex<ChannelCircuit>> {
        self.channels
            .entry(channel_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ChannelCircuit::new())))
            .clone()
    }

    fn set_state(channel_id: &ChannelId, circuit: &mut ChannelCircuit, state: CircuitState) {
        circuit.state = state;
        metrics::restart::CIRCUIT_BREAKER_STATE
            .with_label_values(&[channel_id.as_str()])
            .set(state.gauge_value());
    }

    /// May a start be attempted for this channel right now?
    ///
    /// An `Open` circuit moves to `HalfOpen` once the cooldown elapsed; the
    /// one permitted half-open attempt is the probe.
    pub fn allow(&self, channel_id: &ChannelId) -> bool {
        let entry = self.entry(channel_id);
        let mut circuit = entry.lock();
        let now = self.clock.now();

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = circuit.opened_at.is_some_and(|at| {
                    now.duration_since(at) >= Duration::from_secs(self.config.cooldown_seconds)
                });
                if cooled {
                    info!(channel = %channel_id, "Circuit cooldown elapsed, half-open probe permitted");
                    Self::set_state(channel_id, &mut circuit, CircuitState::HalfOpen);
                    circuit.half_open_probe_pending = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if circuit.half_open_probe_pending {
                    false
                } else {
                    circuit.half_open_probe_pending = true;
                    true
                }
            }
        }
    }

    /// Record a start failure (or a failed half-open probe).
    pub fn record_failure(&self, channel_id: &ChannelId) {
        let entry = self.entry(channel_id);
        let mut circuit = entry.lock();
        let now = self.clock.now();
        let window = Duration::from_secs(self.config.failure_window_seconds);

        match circuit.state {
            CircuitState::HalfOpen => {
                warn!(channel = %channel_id, "Half-open probe failed, circuit re-opened");
                circuit.half_open_probe_pending = false;
                circuit.opened_at = Some(now);
                Self::set_state(channel_id, &mut circuit, CircuitState::Open);
            }
            CircuitState::Closed => {
                while circuit
                    .failures
                    .front()
                    .is_some_and(|&at| now.duration_since(at) > window)
                {
                    circuit.failures.pop_front();
                }
                circuit.failures.push_back(now);
                if circuit.failures.len() >= self.config.failure_threshold as usize {
                    warn!(
                        channel = %channel_id,
                        failures = circuit.failures.len(),
                        "Failure threshold reached, circuit opened"
                    );
                    circuit.opened_at = Some(now);
                    circuit.failures.clear();
                    Self::set_state(channel_id, &mut circuit, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record that a started source proved stable (up for the probe window).
    pub fn record_success(&self, channel_id: &ChannelId) {
        let entry = self.entry(channel_id);
        let mut circuit = entry.lock();
        if circuit.state == CircuitState::HalfOpen {
            info!(channel = %channel_id, "Half-open probe succeeded, circuit closed");
        }
        circuit.half_open_probe_pending = false;
        circuit.failures.clear();
        circuit.opened_at = None;
        Self::set_state(channel_id, &mut circuit, CircuitState::Closed);
    }

    #[must_use]
    pub fn state(&self, channel_id: &ChannelId) -> CircuitState {
        self.entry(channel_id).lock().state
    }

    /// How long a post-open start must stay up to count as a probe success.
    #[must_use]
    pub fn probe_window(&self) -> Duration {
        Duration::from_secs(self.config.probe_up_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;

    fn breaker() -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let breaker = CircuitBreaker::new(BreakerConfig::default(), clock.clone());
        (clock, breaker)
    }

    fn channel() -> ChannelId {
        ChannelId::from("7")
    }

    #[test]
    fn stays_closed_below_threshold() {
        let (_clock, breaker) = breaker();
        for _ in 0..4 {
            breaker.record_failure(&channel());
        }
        assert_eq!(breaker.state(&channel()), CircuitState::Closed);
        assert!(breaker.allow(&channel()));
    }

    #[test]
    fn opens_at_threshold_within_window() {
        let (_clock, breaker) = breaker();
        for _ in 0..5 {
            breaker.record_failure(&channel());
        }
        assert_eq!(breaker.state(&channel()), CircuitState::Open);
        assert!(!breaker.allow(&channel()));
    }

    #[test]
    fn old_failures_age_out_of_the_window() {
        let (clock, breaker) = breaker();
        for _ in 0..4 {
            breaker.record_failure(&channel());
        }
        // Push the old failures out of the 300s window.
        clock.advance(Duration::from_secs(301));
        breaker.record_failure(&channel());
        assert_eq!(breaker.state(&channel()), CircuitState::Closed);
    }

    #[test]
    fn cooldown_permits_single_probe() {
        let (clock, breaker) = breaker();
        for _ in 0..5 {
            breaker.record_failure(&channel());
        }
        assert!(!breaker.allow(&channel()));

        clock.advance(Duration::from_secs(120));
        assert!(breaker.allow(&channel()), "first post-cooldown attempt is the probe");
        assert_eq!(breaker.state(&channel()), CircuitState::HalfOpen);
        assert!(!breaker.allow(&channel()), "only one probe in flight");
    }

    #[test]
    fn probe_success_closes() {
        let (clock, breaker) = breaker();
        for _ in 0..5 {
            breaker.record_failure(&channel());
        }
        clock.advance(Duration::from_secs(120));
        assert!(breaker.allow(&channel()));

        breaker.record_success(&channel());
        assert_eq!(breaker.state(&channel()), CircuitState::Closed);
        assert!(breaker.allow(&channel()));
    }

    #[test]
    fn probe_failure_reopens() {
        let (clock, breaker) = breaker();
        for _ in 0..5 {
            breaker.record_failure(&channel());
        }
        clock.advance(Duration::from_secs(120));
        assert!(breaker.allow(&channel()));

        breaker.record_failure(&channel());
        assert_eq!(breaker.state(&channel()), CircuitState::Open);
        assert!(!breaker.allow(&channel()));

        // A fresh cooldown is required before the next probe.
        clock.advance(Duration::from_secs(119));
        assert!(!breaker.allow(&channel()));
        clock.advance(Duration::from_secs(1));
        assert!(breaker.allow(&channel()));
    }

    #[test]
    fn channels_are_independent() {
        let (_clock, breaker) = breaker();
        for _ in 0..5 {
            breaker.record_failure(&ChannelId::from("a"));
        }
        assert_eq!(breaker.state(&ChannelId::from("a")), CircuitState::Open);
        assert_eq!(breaker.state(&ChannelId::from("b")), CircuitState::Closed);
        assert!(breaker.allow(&ChannelId::from("b")));
    }
}
