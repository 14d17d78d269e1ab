//! Client notification boundary
//!
//! Every session ends with exactly one [`AuthResult`]. UI state changes are
//! best effort and may be dropped.

use peerbind_core::AuthRole;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Terminal outcome of one authentication session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthResult {
    pub pkg_name: String,
    pub device_id: String,
    pub request_id: i64,
    pub role: AuthRole,
    /// `DM_OK` on success, otherwise a `DmError` code
    pub result_code: i32,
}

/// Progress notifications for the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UiState {
    ConfirmShown,
    PinDisplayShown,
    PinInputShown,
    /// Wrong PIN, the user is asked again
    PinRetry,
    Finished,
}

/// Receiver of client-visible events
pub trait AuthListener: Send + Sync {
    fn on_auth_result(&self, result: &AuthResult);

    fn on_ui_state(&self, _request_id: i64, _state: UiState) {}
}

/// Event published by [`BroadcastListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    Result(AuthResult),
    UiState { request_id: i64, state: UiState },
}

/// Re-publishes events on a tokio broadcast channel
pub struct BroadcastListener {
    tx: broadcast::Sender<AuthEvent>,
}

impl BroadcastListener {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastListener {
    fn default() -> Self {
        Self::new(64)
    }
}

impl AuthListener for BroadcastListener {
    fn on_auth_result(&self, result: &AuthResult) {
        if self.tx.send(AuthEvent::Result(result.clone())).is_err() {
            debug!("No subscribers for result of request {}", result.request_id);
        }
    }

    fn on_ui_state(&self, request_id: i64, state: UiState) {
        let _ = self.tx.send(AuthEvent::UiState { request_id, state });
    }
}
