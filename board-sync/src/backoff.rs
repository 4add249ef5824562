//! Reconnection policy and state machine.
//!
//! ```text
//!            transport lost
//! Connected ───────────────► Retrying{attempt} ──► (delay) ──► connect()
//!     ▲                         │    ▲                  │
//!     │        ok               │    └──── failed ──────┘
//!     └─────────────────────────┘
//!                               │ attempts exhausted        auth refused
//!                               ▼                               │
//!                            Offline ──── retry() ───► Retrying  ▼
//!                                                          AuthRejected
//! ```
//!
//! `Offline` and `AuthRejected` are terminal until the user acts.

use std::time::Duration;

use uuid::Uuid;

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomised in both directions (0.0 – 1.0)
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Delay with jitter; `unit` in `[0, 1]` picks the point in the jitter band.
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.delay_for(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + jitter * (2.0 * unit.clamp(0.0, 1.0) - 1.0);
        Duration::from_secs_f64(base * factor).min(self.max_delay)
    }

    /// Jittered delay using a random unit.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let unit = (Uuid::new_v4().as_u128() & 0xFFFF) as f64 / 65535.0;
        self.delay_with_jitter(attempt, unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Connected,
    Retrying { attempt: u32 },
    Offline,
    AuthRejected,
}

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    RetryAfter { attempt: u32, delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    state: ReconnectState,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ReconnectState::Connected,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// The transport dropped or an attempt failed.
    pub fn on_failure(&mut self) -> ReconnectStep {
        let attempt = match self.state {
            ReconnectState::Connected => 1,
            ReconnectState::Retrying { attempt } => attempt + 1,
            ReconnectState::Offline | ReconnectState::AuthRejected => return ReconnectStep::GiveUp,
        };
        if attempt > self.policy.max_attempts {
            log::warn!("giving up after {} reconnect attempts", self.policy.max_attempts);
            self.state = ReconnectState::Offline;
            return ReconnectStep::GiveUp;
        }
        self.state = ReconnectState::Retrying { attempt };
        ReconnectStep::RetryAfter {
            attempt,
            delay: self.policy.next_delay(attempt),
        }
    }

    pub fn on_connected(&mut self) {
        self.state = ReconnectState::Connected;
    }

    /// Credentials were refused; no automatic retry.
    pub fn on_auth_rejected(&mut self) {
        self.state = ReconnectState::AuthRejected;
    }

    /// Explicit user retry from `Offline`. Returns `false` in any other state.
    pub fn retry(&mut self) -> bool {
        if self.state == ReconnectState::Offline {
            self.state = ReconnectState::Connected;
            true
        } else {
            false
        }
    }

    /// Fresh credentials were supplied after an auth refusal.
    pub fn reset(&mut self) {
        self.state = ReconnectState::Connected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_band() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_with_jitter(1, 0.5), Duration::from_millis(250));
        let low = policy.delay_with_jitter(1, 0.0).as_secs_f64();
        let high = policy.delay_with_jitter(1, 1.0).as_secs_f64();
        assert!((low - 0.2).abs() < 1e-6);
        assert!((high - 0.3).abs() < 1e-6);
        for _ in 0..50 {
            let d = policy.next_delay(2);
            let secs = d.as_secs_f64();
            assert!(secs > 0.399 && secs < 0.601, "delay out of band: {d:?}");
        }
    }

    #[test]
    fn test_goes_offline_after_max_attempts() {
        let mut r = Reconnector::new(ReconnectPolicy {
            max_attempts: 2,
            ..Default::default()
        });
        assert!(matches!(r.on_failure(), ReconnectStep::RetryAfter { attempt: 1, .. }));
        assert!(matches!(r.on_failure(), ReconnectStep::RetryAfter { attempt: 2, .. }));
        assert_eq!(r.on_failure(), ReconnectStep::GiveUp);
        assert_eq!(r.state(), ReconnectState::Offline);
        // Stays offline until the user retries.
        assert_eq!(r.on_failure(), ReconnectStep::GiveUp);

        assert!(r.retry());
        assert!(matches!(r.on_failure(), ReconnectStep::RetryAfter { attempt: 1, .. }));
    }

    #[test]
    fn test_success_resets_attempts() {
        let mut r = Reconnector::new(ReconnectPolicy::default());
        r.on_failure();
        r.on_failure();
        r.on_connected();
        assert!(matches!(r.on_failure(), ReconnectStep::RetryAfter { attempt: 1, .. }));
    }

    #[test]
    fn test_auth_rejection_is_terminal() {
        let mut r = Reconnector::new(ReconnectPolicy::default());
        r.on_auth_rejected();
        assert_eq!(r.on_failure(), ReconnectStep::GiveUp);
        assert!(!r.retry());
        r.reset();
        assert_eq!(r.state(), ReconnectState::Connected);
    }
}
