//! Configuration types for peerbind

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Named timers armed during an authentication session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimerName {
    /// Whole-handshake deadline
    Authenticate,
    /// Waiting for the peer's negotiate response
    Negotiate,
    /// Waiting for the confirmation decision
    Confirm,
    /// Waiting for the user to type the PIN
    Input,
    /// PIN credential rounds
    PinAuth,
}

impl TimerName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerName::Authenticate => "deviceManagerTimer:authenticate",
            TimerName::Negotiate => "deviceManagerTimer:negotiate",
            TimerName::Confirm => "deviceManagerTimer:confirm",
            TimerName::Input => "deviceManagerTimer:inputPin",
            TimerName::PinAuth => "deviceManagerTimer:pinAuth",
        }
    }
}

impl std::fmt::Display for TimerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables for the authentication manager
///
/// Durations are stored in milliseconds so the struct reads naturally from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthConfig {
    /// Deadline for the whole handshake
    pub authenticate_timeout_ms: u64,
    /// Deadline for the negotiate response
    pub negotiate_timeout_ms: u64,
    /// Deadline for the confirmation decision
    pub confirm_timeout_ms: u64,
    /// Deadline for PIN entry
    pub input_timeout_ms: u64,
    /// Deadline for the PIN credential rounds
    pub pin_auth_timeout_ms: u64,
    /// Upper bound on every wait for a credential engine event
    pub wait_event_timeout_ms: u64,
    /// PIN attempts allowed before the bind fails
    pub max_pin_attempts: u32,
    /// Capacity of the per-request credential event queue
    pub event_queue_capacity: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            authenticate_timeout_ms: 120_000,
            negotiate_timeout_ms: 10_000,
            confirm_timeout_ms: 60_000,
            input_timeout_ms: 60_000,
            pin_auth_timeout_ms: 20_000,
            wait_event_timeout_ms: 10_000,
            max_pin_attempts: 3,
            event_queue_capacity: 16,
        }
    }
}

impl AuthConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from JSON; absent fields keep their defaults
    pub fn from_json_str(json: &str) -> crate::DmResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            tracing::warn!("Invalid auth config: {}", e);
            crate::DmError::InputParaInvalid
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the state machine cannot run with
    pub fn validate(&self) -> crate::DmResult<()> {
        if self.wait_event_timeout_ms == 0
            || self.authenticate_timeout_ms == 0
            || self.max_pin_attempts == 0
            || self.event_queue_capacity == 0
        {
            return Err(crate::DmError::InputParaInvalid);
        }
        Ok(())
    }

    /// Builder pattern: set the whole-handshake timeout
    pub fn with_authenticate_timeout(mut self, timeout: Duration) -> Self {
        self.authenticate_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder pattern: set the negotiate timeout
    pub fn with_negotiate_timeout(mut self, timeout: Duration) -> Self {
        self.negotiate_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder pattern: set the confirmation timeout
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder pattern: set the PIN input timeout
    pub fn with_input_timeout(mut self, timeout: Duration) -> Self {
        self.input_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder pattern: set the PIN credential round timeout
    pub fn with_pin_auth_timeout(mut self, timeout: Duration) -> Self {
        self.pin_auth_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder pattern: set the credential event wait bound
    pub fn with_wait_event_timeout(mut self, timeout: Duration) -> Self {
        self.wait_event_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder pattern: set the PIN attempt limit
    pub fn with_max_pin_attempts(mut self, attempts: u32) -> Self {
        self.max_pin_attempts = attempts;
        self
    }

    pub fn wait_event_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_event_timeout_ms)
    }

    /// Duration of a named timer
    pub fn task_timeout(&self, name: TimerName) -> Duration {
        let ms = match name {
            TimerName::Authenticate => self.authenticate_timeout_ms,
            TimerName::Negotiate => self.negotiate_timeout_ms,
            TimerName::Confirm => self.confirm_timeout_ms,
            TimerName::Input => self.input_timeout_ms,
            TimerName::PinAuth => self.pin_auth_timeout_ms,
        };
        Duration::from_millis(ms)
    }
}
