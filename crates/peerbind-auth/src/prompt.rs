//! User interaction boundary
//!
//! The manager never renders UI. It asks a [`UserPrompt`] to show a dialog
//! and hands it a [`PromptReply`]; the decision can come back at any time,
//! from any thread.

use crate::session::SessionInput;
use peerbind_core::{AuthType, BindLevel, UserAction};
use tokio::sync::mpsc;
use tracing::debug;

/// Content of the confirmation dialog shown on the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmParams {
    pub request_id: i64,
    pub peer_udid: String,
    pub bundle_name: String,
    pub app_name: String,
    pub custom_description: String,
    pub auth_type: AuthType,
    pub bind_level: BindLevel,
}

/// Handle for answering a dialog
#[derive(Debug, Clone)]
pub struct PromptReply {
    request_id: i64,
    tx: mpsc::UnboundedSender<SessionInput>,
}

impl PromptReply {
    pub(crate) fn new(request_id: i64, tx: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self { request_id, tx }
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Deliver the user's decision; false once the session has ended
    pub fn send(&self, action: UserAction, params: Option<String>) -> bool {
        let delivered = self
            .tx
            .send(SessionInput::UserOperation { action, params })
            .is_ok();
        if !delivered {
            debug!("Dropping {:?} for finished request {}", action, self.request_id);
        }
        delivered
    }
}

/// Dialogs the handshake may need
pub trait UserPrompt: Send + Sync {
    /// Ask the sink user to accept the bind
    fn show_confirm_dialog(&self, params: ConfirmParams, reply: PromptReply);

    /// Ask the source user to type the PIN shown on the peer
    fn show_pin_input_dialog(&self, request_id: i64, reply: PromptReply);

    /// Show the generated PIN on the sink
    fn show_pin_display(&self, request_id: i64, pin_code: u32);

    /// Dismiss whatever is open for the request
    fn close_dialogs(&self, _request_id: i64) {}
}
