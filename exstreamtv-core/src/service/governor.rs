//! Restart governor: the sole restart entry point.
//!
//! Every path that restarts a channel, whether the health monitor, the
//! source-exit handler, an operator action or an external remediation tool,
//! goes through [`RestartGovernor::request_restart`]. Denials are decisions,
//! not errors.
//!
//! Lock order is always governor, then the channel's breaker entry; never
//! the reverse.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::clock::{Clock, SharedClock};
use crate::config::RestartConfig;
use crate::metrics;
use crate::models::ChannelId;

use super::breaker::CircuitBreaker;

/// Why a restart was requested. Labels the metric; never part of the rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCause {
    SourceFailed,
    HealthStale,
    LongRunRevoke,
    Manual,
    AiRemediation,
    /// Half-open probe attempt after a breaker cooldown.
    BreakerProbe,
}

impl RestartCause {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceFailed => "source_failed",
            Self::HealthStale => "health_stale",
            Self::LongRunRevoke => "long_run_revoke",
            Self::Manual => "manual",
            Self::AiRemediation => "ai_remediation",
            Self::BreakerProbe => "breaker_probe",
        }
    }
}

/// Governor verdict, in rule-evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    DeniedThrottle,
    DeniedCooldown,
    DeniedBreakerOpen,
}

impl Decision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::DeniedThrottle => "denied_throttle",
            Self::DeniedCooldown => "denied_cooldown",
            Self::DeniedBreakerOpen => "denied_breaker_open",
        }
    }

    #[must_use]
    pub fn is_allowed(self) -> bool {
        self == Self::Allowed
    }
}

#[derive(Debug, Default)]
struct GovernorState {
    /// Instants of allowed restarts inside the rolling window, oldest first.
    window: VecDeque<Instant>,
    last_restart_at: HashMap<ChannelId, Instant>,
}

pub struct RestartGovernor {
    config: RestartConfig,
    clock: SharedClock,
    breaker: Arc<CircuitBreaker>,
    state: Mutex<GovernorState>,
}

impl RestartGovernor {
    #[must_use]
    pub fn new(config: RestartConfig, breaker: Arc<CircuitBreaker>, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            breaker,
            state: Mutex::new(GovernorState::default()),
        }
    }

    /// Decide whether `channel_id` may restart now.
    ///
    /// Rules in order: global storm throttle, per-channel cooldown, breaker.
    /// An `Allowed` outcome records the restart instant in both ledgers.
    pub fn request_restart(&self, channel_id: &ChannelId, cause: RestartCause) -> Decision {
        let now = self.clock.now();
        let window = Duration::from_secs(self.config.global_window_seconds);

        let decision = {
            let mut state = self.state.lock();

            while state.window.front().is_some_and(|&at| now.duration_since(at) >= window) {
                state.window.pop_front();
            }

            if state.window.len() >= self.config.global_restarts_per_window as usize {
                Decision::DeniedThrottle
            } else if state.last_restart_at.get(channel_id).is_some_and(|&at| {
                now.duration_since(at) < Duration::from_secs(self.config.channel_cooldown_seconds)
            }) {
                Decision::DeniedCooldown
            } else if !self.breaker.allow(channel_id) {
                Decision::DeniedBreakerOpen
            } else {
                state.window.push_back(now);
                state.last_restart_at.insert(channel_id.clone(), now);
                Decision::Allowed
            }
        };

        metrics::restart::RESTART_REQUESTS_TOTAL
            .with_label_values(&[decision.as_str()])
            .inc();

        match decision {
            Decision::Allowed => {
                info!(channel = %channel_id, cause = cause.as_str(), "Restart allowed")
            }
            denied => {
                debug!(channel = %channel_id, cause = cause.as_str(), decision = denied.as_str(), "Restart denied")
            }
        }
        decision
    }

    /// Shared breaker, for outcome reporting by the channel runtime.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BreakerConfig;
    use chrono::Utc;

    fn governor() -> (Arc<ManualClock>, RestartGovernor) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), clock.clone()));
        let governor = RestartGovernor::new(RestartConfig::default(), breaker, clock.clone());
        (clock, governor)
    }

    fn ch(n: u32) -> ChannelId {
        ChannelId::from(format!("ch-{n}"))
    }

    #[test]
    fn cause_labels_are_stable() {
        let causes = [
            (RestartCause::SourceFailed, "source_failed"),
            (RestartCause::HealthStale, "health_stale"),
            (RestartCause::LongRunRevoke, "long_run_revoke"),
            (RestartCause::Manual, "manual"),
            (RestartCause::AiRemediation, "ai_remediation"),
            (RestartCause::BreakerProbe, "breaker_probe"),
        ];
        for (cause, label) in causes {
            assert_eq!(cause.as_str(), label);
        }
    }

    #[test]
    fn first_request_is_allowed() {
        let (_clock, governor) = governor();
        assert_eq!(
            governor.request_restart(&ch(1), RestartCause::SourceFailed),
            Decision::Allowed
        );
    }

    #[test]
    fn global_window_caps_allowed_restarts() {
        let (_clock, governor) = governor();
        // 15 distinct channels failing at once: only 10 get through.
        let mut allowed = 0;
        let mut throttled = 0;
        for n in 0..15 {
            match governor.request_restart(&ch(n), RestartCause::SourceFailed) {
                Decision::Allowed => allowed += 1,
                Decision::DeniedThrottle => throttled += 1,
                other => panic!("unexpected decision {other:?}"),
            }
        }
        assert_eq!(allowed, 10);
        assert_eq!(throttled, 5);
    }

    #[test]
    fn window_slides_open_again() {
        let (clock, governor) = governor();
        for n in 0..10 {
            assert!(governor.request_restart(&ch(n), RestartCause::SourceFailed).is_allowed());
        }
        assert_eq!(
            governor.request_restart(&ch(99), RestartCause::SourceFailed),
            Decision::DeniedThrottle
        );

        clock.advance(Duration::from_secs(60));
        assert!(governor.request_restart(&ch(99), RestartCause::SourceFailed).is_allowed());
    }

    #[test]
    fn per_channel_cooldown_enforced() {
        let (clock, governor) = governor();
        assert!(governor.request_restart(&ch(1), RestartCause::SourceFailed).is_allowed());
        assert_eq!(
            governor.request_restart(&ch(1), RestartCause::Manual),
            Decision::DeniedCooldown
        );

        clock.advance(Duration::from_secs(29));
        assert_eq!(
            governor.request_restart(&ch(1), RestartCause::Manual),
            Decision::DeniedCooldown
        );
        clock.advance(Duration::from_secs(1));
        assert!(governor.request_restart(&ch(1), RestartCause::Manual).is_allowed());
    }

    #[test]
    fn breaker_open_vetoes() {
        let (_clock, governor) = governor();
        for _ in 0..5 {
            governor.breaker().record_failure(&ch(7));
        }
        assert_eq!(
            governor.request_restart(&ch(7), RestartCause::SourceFailed),
            Decision::DeniedBreakerOpen
        );
    }

    #[test]
    fn denied_requests_do_not_consume_the_window() {
        let (_clock, governor) = governor();
        assert!(governor.request_restart(&ch(1), RestartCause::SourceFailed).is_allowed());
        // Nine cooldown denials for channel 1.
        for _ in 0..9 {
            assert_eq!(
                governor.request_restart(&ch(1), RestartCause::SourceFailed),
                Decision::DeniedCooldown
            );
        }
        // The window still has room for nine other channels.
        for n in 2..=10 {
            assert!(governor.request_restart(&ch(n), RestartCause::SourceFailed).is_allowed());
        }
    }

    #[test]
    fn cooldown_and_throttle_order() {
        let (clock, governor) = governor();
        // Fill the global window with distinct channels.
        for n in 0..10 {
            assert!(governor.request_restart(&ch(n), RestartCause::SourceFailed).is_allowed());
        }
        // Channel 0 is both throttled and cooling down; throttle wins (rule 1).
        assert_eq!(
            governor.request_restart(&ch(0), RestartCause::SourceFailed),
            Decision::DeniedThrottle
        );

        // 60s later: window clear, channel cooldown (30s) also elapsed.
        clock.advance(Duration::from_secs(60));
        assert!(governor.request_restart(&ch(0), RestartCause::SourceFailed).is_allowed());
    }
}
