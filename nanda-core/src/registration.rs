//! Registration state machine: UNREGISTERED / REGISTERED / DEGRADED and the heartbeat failure counter.

use serde::Serialize;

/// Default consecutive heartbeat failures before the registration is considered degraded.
pub const DEFAULT_MAX_HEARTBEAT_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Unregistered,
    Registered,
    Degraded,
}

/// What the host must do after a heartbeat result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Not registered; no heartbeat was due.
    Skipped,
    Healthy,
    /// Failure below the threshold.
    Failed { failures: u32 },
    /// Threshold reached: state is now DEGRADED; re-register immediately.
    Degraded,
}

/// Tracks registration state. Host reports results of register/heartbeat calls.
#[derive(Debug, Clone)]
pub struct RegistrationTracker {
    state: RegistrationState,
    failures: u32,
    max_failures: u32,
}

impl Default for RegistrationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationTracker {
    pub fn new() -> Self {
        Self::with_max_failures(DEFAULT_MAX_HEARTBEAT_FAILURES)
    }

    /// A threshold of 0 is treated as 1.
    pub fn with_max_failures(max_failures: u32) -> Self {
        Self {
            state: RegistrationState::Unregistered,
            failures: 0,
            max_failures: max_failures.max(1),
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_registered(&self) -> bool {
        self.state == RegistrationState::Registered
    }

    /// Heartbeats are only sent while REGISTERED.
    pub fn heartbeat_due(&self) -> bool {
        self.is_registered()
    }

    /// Success from any state moves to REGISTERED; failure leaves state unchanged.
    pub fn on_register_result(&mut self, success: bool) -> RegistrationState {
        if success {
            self.state = RegistrationState::Registered;
            self.failures = 0;
        }
        self.state
    }

    pub fn on_heartbeat_result(&mut self, success: bool) -> HeartbeatOutcome {
        if !self.is_registered() {
            return HeartbeatOutcome::Skipped;
        }
        if success {
            self.failures = 0;
            return HeartbeatOutcome::Healthy;
        }
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.max_failures {
            self.state = RegistrationState::Degraded;
            HeartbeatOutcome::Degraded
        } else {
            HeartbeatOutcome::Failed {
                failures: self.failures,
            }
        }
    }
}
