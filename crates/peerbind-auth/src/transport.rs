//! Session transport boundary
//!
//! Discovery and connection setup live outside this crate. The manager only
//! needs to open a session to a known peer, send bytes on it and close it.
//! Inbound traffic comes back through `AuthManager::on_session_opened`,
//! `on_session_closed` and `on_data_received`.

use crate::message::{encode, AuthMessage};
use peerbind_core::DmResult;
use std::sync::Arc;
use tracing::{debug, warn};

/// Byte-stream sessions between devices
pub trait SessionTransport: Send + Sync {
    /// Start opening a session to `peer_udid`.
    ///
    /// Returns the local session id at once; the outcome is reported later
    /// through `AuthManager::on_session_opened`.
    fn open_session(&self, peer_udid: &str) -> DmResult<i32>;

    fn close_session(&self, session_id: i32);

    fn send_bytes(&self, session_id: i32, data: &[u8]) -> DmResult<()>;
}

/// Encodes protocol messages onto one session
#[derive(Clone)]
pub struct Outbox {
    transport: Arc<dyn SessionTransport>,
    session_id: Option<i32>,
}

impl Outbox {
    pub fn new(transport: Arc<dyn SessionTransport>) -> Self {
        Self {
            transport,
            session_id: None,
        }
    }

    pub fn session_id(&self) -> Option<i32> {
        self.session_id
    }

    pub fn bind(&mut self, session_id: i32) {
        self.session_id = Some(session_id);
    }

    /// Send a message; a missing session is a send failure
    pub fn send(&self, msg: &AuthMessage) -> DmResult<()> {
        let Some(session_id) = self.session_id else {
            warn!(
                "No session bound, cannot send message type {}",
                msg.msg_type()
            );
            return Err(peerbind_core::DmError::SessionClosed);
        };
        debug!(
            "Sending message type {} for request {} on session {}",
            msg.msg_type(),
            msg.request_id(),
            session_id
        );
        self.transport.send_bytes(session_id, &encode(msg))
    }

    /// Close the bound session, if any
    pub fn close(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            self.transport.close_session(session_id);
        }
    }
}
