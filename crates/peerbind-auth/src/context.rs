//! Per-session authentication context
//!
//! One [`AuthContext`] lives for exactly one handshake and is owned by that
//! session's driver task. States read and write it; nothing else does.

use crate::acl::{AccessControlEntry, AccessSubject, LocalDevice};
use crate::credential::EventReceiver;
use crate::listener::UiState;
use crate::manager::AuthDeps;
use crate::message::{ConfirmRequest, NegotiateInfo};
use crate::prompt::PromptReply;
use crate::state::DmAuthState;
use crate::transport::Outbox;
use peerbind_core::{AuthConfig, AuthRole, AuthType, BindLevel, DmResult, UserAction};

/// Where a session is in its life
#[derive(Debug)]
pub enum Lifecycle {
    /// Driver exists, no handshake yet
    Uninitialized,
    Active(Box<AuthContext>),
    /// Terminal outcome, kept so late inputs can be answered idempotently
    Finished(DmResult<()>),
}

impl Lifecycle {
    pub fn is_active(&self) -> bool {
        matches!(self, Lifecycle::Active(_))
    }

    pub fn reason(&self) -> Option<DmResult<()>> {
        match self {
            Lifecycle::Finished(reason) => Some(*reason),
            _ => None,
        }
    }
}

pub struct AuthContext {
    pub request_id: i64,
    pub role: AuthRole,
    pub state: DmAuthState,

    /// Package on this device
    pub pkg_name: String,
    /// Package on the peer
    pub peer_pkg_name: String,
    pub local: LocalDevice,
    /// Device id the caller asked for; the peer's udid until negotiation
    pub peer_device_id: String,
    /// Peer udid as reported by the peer
    pub remote_udid: String,
    pub peer_user_id: i32,
    pub peer_account_id: String,
    pub peer_token_id: u64,

    pub auth_type: AuthType,
    pub bind_level: BindLevel,
    pub confirm_operation: UserAction,
    pub app_name: String,
    pub custom_description: String,

    pub pin_code: Option<u32>,
    /// Code imported for `pkg_name` before the bind started
    pub import_auth_code: Option<u32>,
    pub is_auth_code_ready: bool,

    /// Peer already holds an ACL for this device
    pub is_online: bool,
    pub is_identical_account: bool,
    /// A credential for the pair exists locally
    pub have_credential: bool,
    pub peer_have_credential: bool,

    pub pin_fail_times: u32,
    pub max_pin_attempts: u32,
    /// Credential payload received from the peer, consumed by the next state
    pub transmit_data: Option<String>,
    /// Last engine error a state swallowed
    pub credential_error: Option<i32>,
    pub session_key: Option<Vec<u8>>,
    pub credential_id: Option<String>,

    pub reason: DmResult<()>,

    pub(crate) config: AuthConfig,
    pub(crate) deps: AuthDeps,
    pub(crate) events: EventReceiver,
    pub(crate) outbox: Outbox,
    pub(crate) reply: PromptReply,
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("request_id", &self.request_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer_device_id", &self.peer_device_id)
            .field("auth_type", &self.auth_type)
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl AuthContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        request_id: i64,
        role: AuthRole,
        local: LocalDevice,
        config: AuthConfig,
        deps: AuthDeps,
        events: EventReceiver,
        outbox: Outbox,
        reply: PromptReply,
    ) -> Self {
        let state = match role {
            AuthRole::Source => DmAuthState::SrcStart,
            AuthRole::Sink => DmAuthState::SinkStart,
        };
        Self {
            request_id,
            role,
            state,
            pkg_name: String::new(),
            peer_pkg_name: String::new(),
            local,
            peer_device_id: String::new(),
            remote_udid: String::new(),
            peer_user_id: 0,
            peer_account_id: String::new(),
            peer_token_id: 0,
            auth_type: AuthType::Unknown,
            bind_level: BindLevel::Invalid,
            confirm_operation: UserAction::None,
            app_name: String::new(),
            custom_description: String::new(),
            pin_code: None,
            import_auth_code: None,
            is_auth_code_ready: false,
            is_online: false,
            is_identical_account: false,
            have_credential: false,
            peer_have_credential: false,
            pin_fail_times: 0,
            max_pin_attempts: config.max_pin_attempts,
            transmit_data: None,
            credential_error: None,
            session_key: None,
            credential_id: None,
            reason: Ok(()),
            config,
            deps,
            events,
            outbox,
            reply,
        }
    }

    /// Udid to address the peer with
    pub fn peer_udid(&self) -> &str {
        if self.remote_udid.is_empty() {
            &self.peer_device_id
        } else {
            &self.remote_udid
        }
    }

    /// Identity and intent as sent in a negotiate message
    pub fn negotiate_info(&self) -> NegotiateInfo {
        NegotiateInfo {
            udid: self.local.udid.clone(),
            user_id: self.local.user_id,
            account_id: self.local.account_id.clone(),
            token_id: self.local.token_id,
            bundle_name: self.pkg_name.clone(),
            peer_bundle_name: self.peer_pkg_name.clone(),
            auth_type: self.auth_type,
            bind_level: self.bind_level,
            have_credential: self.is_online && self.have_credential,
        }
    }

    /// Record what the peer reported about itself
    pub fn apply_peer_info(&mut self, info: &NegotiateInfo) {
        self.remote_udid = info.udid.clone();
        self.peer_user_id = info.user_id;
        self.peer_account_id = info.account_id.clone();
        self.peer_token_id = info.token_id;
        self.peer_have_credential = info.have_credential;
        if !info.bundle_name.is_empty() {
            self.peer_pkg_name = info.bundle_name.clone();
        }
    }

    /// Sink side: adopt the bind parameters carried by a confirm request
    pub fn apply_confirm_request(&mut self, confirm: &ConfirmRequest) {
        if confirm.auth_type != AuthType::Unknown {
            self.auth_type = confirm.auth_type;
        }
        if confirm.bind_level != BindLevel::Invalid {
            self.bind_level = confirm.bind_level;
        }
        self.app_name = confirm.app_name.clone();
        self.custom_description = confirm.custom_description.clone();
    }

    /// Both sides already trust each other and hold a credential
    pub fn can_skip_pin(&self) -> bool {
        self.is_online && self.have_credential && self.peer_have_credential
    }

    /// The entry records this bind's bundles at this bind level
    pub fn covers(&self, entry: &AccessControlEntry) -> bool {
        entry.local.bundle_name == self.pkg_name
            && entry.remote.bundle_name == self.peer_pkg_name
            && entry.bind_level == self.bind_level
    }

    /// Entries recording exactly this bind
    pub fn matching_entries(&self) -> Vec<AccessControlEntry> {
        self.deps
            .trust_store
            .query_access_control_list(&self.local.udid, self.peer_udid())
            .into_iter()
            .filter(|e| self.covers(e))
            .collect()
    }

    /// Refresh `is_online` and `have_credential` from local stores.
    ///
    /// Only entries for this bind count as online. A credential held for
    /// another bind with the same peer is remembered so it can be reused.
    pub fn refresh_trust(&mut self) {
        let peer = self.peer_udid().to_string();
        let entries = self
            .deps
            .trust_store
            .query_access_control_list(&self.local.udid, &peer);
        self.is_online = entries.iter().any(|e| self.covers(e));
        self.have_credential = self
            .deps
            .connector
            .query_credential(self.local.user_id, &peer)
            .unwrap_or(false);
        if self.have_credential && self.credential_id.is_none() {
            self.credential_id = entries
                .iter()
                .filter(|e| self.covers(e))
                .chain(entries.iter())
                .find_map(|e| e.credential_id.clone());
        }
    }

    pub fn local_subject(&self) -> AccessSubject {
        AccessSubject {
            udid: self.local.udid.clone(),
            user_id: self.local.user_id,
            account_id: self.local.account_id.clone(),
            token_id: self.local.token_id,
            bundle_name: self.pkg_name.clone(),
        }
    }

    pub fn remote_subject(&self) -> AccessSubject {
        AccessSubject {
            udid: self.peer_udid().to_string(),
            user_id: self.peer_user_id,
            account_id: self.peer_account_id.clone(),
            token_id: self.peer_token_id,
            bundle_name: self.peer_pkg_name.clone(),
        }
    }

    pub(crate) fn notify_ui(&self, state: UiState) {
        self.deps.listener.on_ui_state(self.request_id, state);
    }
}
