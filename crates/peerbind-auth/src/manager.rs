//! Authentication manager
//!
//! Entry point for applications (start, stop, user decisions, unbind) and
//! for the session transport (session events, inbound bytes). Every
//! handshake gets its own driver task; the manager only routes inputs to
//! it through the session registry.

use crate::acl::{AccessControlEntry, CallerInfo, LocalDevice};
use crate::context::AuthContext;
use crate::credential::CredentialConnector;
use crate::listener::AuthListener;
use crate::message::{decode, encode, AuthMessage, NegotiateInfo};
use crate::pin;
use crate::prompt::{PromptReply, UserPrompt};
use crate::relationship::{RelationShipChangeMsg, RelationShipChangeType};
use crate::session::{AuthSession, SessionHandle, SessionInput, SessionRegistry};
use crate::state::DmAuthState;
use crate::storage::{StorageError, TrustStore};
use crate::transport::{Outbox, SessionTransport};
use peerbind_core::{
    AuthConfig, AuthRole, AuthType, BindLevel, DmError, DmResult, SessionSide, UserAction,
};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Collaborators the manager is built from
#[derive(Clone)]
pub struct AuthDeps {
    pub transport: Arc<dyn SessionTransport>,
    pub connector: Arc<CredentialConnector>,
    pub trust_store: Arc<dyn TrustStore>,
    pub prompt: Arc<dyn UserPrompt>,
    pub listener: Arc<dyn AuthListener>,
}

/// Optional bind parameters passed as a JSON object
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BindExtra {
    bind_level: Option<i32>,
    auth_type: Option<i32>,
    app_name: Option<String>,
    custom_description: Option<String>,
    target_pkg_name: Option<String>,
}

impl BindExtra {
    fn parse(extra: &str) -> DmResult<Self> {
        if extra.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_str(extra).map_err(|e| {
            warn!("Bind extra is not JSON: {}", e);
            DmError::InputParaInvalid
        })?;
        if !value.is_object() {
            warn!("Bind extra is not a JSON object");
            return Err(DmError::InputParaInvalid);
        }
        serde_json::from_value(value).map_err(|e| {
            warn!("Bind extra has mistyped fields: {}", e);
            DmError::InputParaInvalid
        })
    }

    fn resolve_bind_level(&self, caller: &CallerInfo) -> DmResult<BindLevel> {
        match self.bind_level {
            Some(raw) => match BindLevel::from_i32(raw) {
                Some(level) => Ok(level),
                None if caller.is_system_sa => {
                    debug!("System caller sent bind level {}, using device", raw);
                    Ok(BindLevel::Device)
                }
                None => {
                    warn!("Bind level {} out of range", raw);
                    Err(DmError::InputParaInvalid)
                }
            },
            None if caller.is_system_sa => Ok(BindLevel::Device),
            None => Ok(BindLevel::App),
        }
    }
}

fn map_storage_error(e: StorageError) -> DmError {
    match e {
        StorageError::NotFound(_) => DmError::NotFound,
        StorageError::InvalidChange => DmError::InputParaInvalid,
        _ => DmError::TrustStore,
    }
}

/// Device authentication and trust manager
pub struct AuthManager {
    local: LocalDevice,
    config: AuthConfig,
    deps: AuthDeps,
    sessions: SessionRegistry,
    /// Imported auth codes by package
    auth_codes: Mutex<HashMap<String, u32>>,
}

impl AuthManager {
    pub fn new(local: LocalDevice, config: AuthConfig, deps: AuthDeps) -> Self {
        info!("Auth manager ready on {}", local.udid);
        Self {
            local,
            config,
            deps,
            sessions: SessionRegistry::default(),
            auth_codes: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_device(&self) -> &LocalDevice {
        &self.local
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Start binding `device_id` on behalf of `pkg_name`.
    ///
    /// Must be called from within a tokio runtime. Returns the request id
    /// that identifies the handshake in callbacks and user operations.
    pub fn authenticate_device(
        &self,
        pkg_name: &str,
        auth_type: AuthType,
        device_id: &str,
        extra: &str,
    ) -> DmResult<i64> {
        self.authenticate_device_with_caller(
            &CallerInfo::default(),
            pkg_name,
            auth_type,
            device_id,
            extra,
        )
    }

    pub fn authenticate_device_with_caller(
        &self,
        caller: &CallerInfo,
        pkg_name: &str,
        auth_type: AuthType,
        device_id: &str,
        extra: &str,
    ) -> DmResult<i64> {
        if pkg_name.is_empty() || device_id.is_empty() || auth_type == AuthType::Unknown {
            warn!(
                "Rejecting bind: pkg '{}', device '{}', {:?}",
                pkg_name, device_id, auth_type
            );
            return Err(DmError::InputParaInvalid);
        }
        let extra = BindExtra::parse(extra)?;
        let bind_level = extra.resolve_bind_level(caller)?;
        if let Some(raw) = extra.auth_type {
            if AuthType::from(raw) != auth_type {
                warn!(
                    "Bind extra asks for auth type {}, keeping {:?}",
                    raw, auth_type
                );
            }
        }
        let import_auth_code = match auth_type {
            AuthType::ImportAuthCode => Some(self.auth_code(pkg_name).ok_or_else(|| {
                warn!("No auth code imported for {}", pkg_name);
                DmError::InputParaInvalid
            })?),
            _ => None,
        };

        let request_id = new_request_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions
            .try_insert(SessionHandle {
                request_id,
                role: AuthRole::Source,
                pkg_name: pkg_name.to_string(),
                peer_udid: device_id.to_string(),
                session_id: None,
                tx: tx.clone(),
            })
            .inspect_err(|_| warn!("Already authenticating with {}", device_id))?;

        let session_id = match self.deps.transport.open_session(device_id) {
            Ok(session_id) => session_id,
            Err(e) => {
                warn!("Could not open session to {}: {}", device_id, e);
                self.sessions.remove(request_id);
                return Err(DmError::AuthOpenSessionFailed);
            }
        };
        if let Some(result) = self.sessions.bind_session(request_id, session_id) {
            let _ = tx.send(SessionInput::SessionOpened { result });
        }

        let mut ctx = self.new_context(request_id, AuthRole::Source, session_id, &tx);
        ctx.pkg_name = pkg_name.to_string();
        ctx.peer_pkg_name = extra
            .target_pkg_name
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| pkg_name.to_string());
        ctx.peer_device_id = device_id.to_string();
        ctx.auth_type = auth_type;
        ctx.bind_level = bind_level;
        ctx.app_name = extra.app_name.unwrap_or_default();
        ctx.custom_description = extra.custom_description.unwrap_or_default();
        ctx.is_auth_code_ready = import_auth_code.is_some();
        ctx.import_auth_code = import_auth_code;

        info!(
            "Request {}: {} binds {} with {:?} at {:?}",
            request_id, pkg_name, device_id, auth_type, bind_level
        );
        let session = AuthSession::new(ctx, self.sessions.clone(), tx);
        tokio::spawn(session.run(DmAuthState::SrcStart, rx));
        Ok(request_id)
    }

    fn new_context(
        &self,
        request_id: i64,
        role: AuthRole,
        session_id: i32,
        tx: &mpsc::UnboundedSender<SessionInput>,
    ) -> AuthContext {
        let mut outbox = Outbox::new(self.deps.transport.clone());
        outbox.bind(session_id);
        AuthContext::new(
            request_id,
            role,
            self.local.clone(),
            self.config.clone(),
            self.deps.clone(),
            self.deps.connector.register(request_id, &self.config),
            outbox,
            PromptReply::new(request_id, tx.clone()),
        )
    }

    /// Abort the handshake started by `pkg_name` and wait until it is torn down
    pub async fn stop_authenticate_device(&self, pkg_name: &str) -> DmResult<()> {
        if pkg_name.is_empty() {
            return Err(DmError::InputParaInvalid);
        }
        let handle = self
            .sessions
            .find_by_pkg(pkg_name)
            .ok_or(DmError::AuthNotStart)?;
        info!(
            "Stopping {} request {} for {}",
            handle.role, handle.request_id, pkg_name
        );
        let (done, ack) = oneshot::channel();
        handle
            .tx
            .send(SessionInput::Stop {
                reason: DmError::StopBind,
                done: Some(done),
            })
            .map_err(|_| DmError::AuthNotStart)?;
        // A dropped sender means the driver already exited
        let _ = ack.await;
        Ok(())
    }

    /// Transport reports the outcome of opening a session
    pub fn on_session_opened(&self, session_id: i32, side: SessionSide, result: i32) {
        match side {
            SessionSide::Server => debug!("Peer opened session {}", session_id),
            SessionSide::Client => match self.sessions.open_result(session_id, result) {
                Some(handle) => {
                    let _ = handle.tx.send(SessionInput::SessionOpened { result });
                }
                None => debug!("Open result for session {} parked", session_id),
            },
        }
    }

    pub fn on_session_closed(&self, session_id: i32) {
        if let Some(handle) = self.sessions.find_by_session(session_id) {
            let _ = handle.tx.send(SessionInput::SessionClosed);
        }
    }

    /// Bytes arrived on a session
    pub fn on_data_received(&self, session_id: i32, data: &[u8]) {
        let msg = match decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping undecodable message on session {}: {}", session_id, e);
                return;
            }
        };
        if let Some(handle) = self.sessions.find_by_session(session_id) {
            let _ = handle.tx.send(SessionInput::Message(msg));
            return;
        }
        match msg {
            AuthMessage::ReqAclNegotiate { request_id, info } => {
                self.start_sink_session(session_id, request_id, info)
            }
            other => debug!(
                "Dropping message type {} on unknown session {}",
                other.msg_type(),
                session_id
            ),
        }
    }

    fn start_sink_session(&self, session_id: i32, request_id: i64, info: NegotiateInfo) {
        if info.udid.is_empty() {
            warn!("Negotiate on session {} without a udid", session_id);
            return;
        }
        let pkg_name = if info.peer_bundle_name.is_empty() {
            info.bundle_name.clone()
        } else {
            info.peer_bundle_name.clone()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let claimed = self.sessions.try_insert(SessionHandle {
            request_id,
            role: AuthRole::Sink,
            pkg_name: pkg_name.clone(),
            peer_udid: info.udid.clone(),
            session_id: Some(session_id),
            tx: tx.clone(),
        });
        if let Err(e) = claimed {
            warn!("Peer {} busy, refusing request {}", info.udid, request_id);
            let busy = AuthMessage::ReqFinish {
                request_id,
                reply: e.code(),
            };
            if let Err(e) = self.deps.transport.send_bytes(session_id, &encode(&busy)) {
                debug!("Could not send busy reply: {}", e);
            }
            return;
        }

        let mut ctx = self.new_context(request_id, AuthRole::Sink, session_id, &tx);
        ctx.pkg_name = pkg_name;
        ctx.peer_device_id = info.udid.clone();
        ctx.auth_type = info.auth_type;
        ctx.bind_level = info.bind_level;
        ctx.apply_peer_info(&info);
        ctx.import_auth_code = self.auth_code(&ctx.pkg_name);
        ctx.is_auth_code_ready = ctx.import_auth_code.is_some();

        info!(
            "Request {}: {} wants to bind {} here",
            request_id, info.udid, ctx.pkg_name
        );
        let session = AuthSession::new(ctx, self.sessions.clone(), tx);
        tokio::spawn(session.run(DmAuthState::SinkStart, rx));
    }

    /// Feed a user decision into a running handshake
    pub fn on_user_operation(
        &self,
        request_id: i64,
        action: UserAction,
        params: Option<String>,
    ) -> DmResult<()> {
        let handle = self
            .sessions
            .get(request_id)
            .ok_or(DmError::AuthNotStart)?;
        handle
            .tx
            .send(SessionInput::UserOperation { action, params })
            .map_err(|_| DmError::AuthNotStart)
    }

    /// Store a code both devices agreed on out of band
    pub fn import_auth_code(&self, pkg_name: &str, auth_code: &str) -> DmResult<()> {
        if pkg_name.is_empty() {
            return Err(DmError::InputParaInvalid);
        }
        let code = pin::parse_auth_code(auth_code).ok_or(DmError::InputParaInvalid)?;
        let mut codes = self.auth_codes.lock().unwrap_or_else(|e| e.into_inner());
        codes.insert(pkg_name.to_string(), code);
        info!("Imported auth code for {}", pkg_name);
        Ok(())
    }

    /// A fresh code suitable for `import_auth_code` on both devices
    pub fn export_auth_code(&self) -> String {
        pin::export_auth_code()
    }

    pub fn generate_pincode(&self) -> u32 {
        pin::generate_pincode()
    }

    fn auth_code(&self, pkg_name: &str) -> Option<u32> {
        let codes = self.auth_codes.lock().unwrap_or_else(|e| e.into_inner());
        codes.get(pkg_name).copied()
    }

    /// No handshake is running
    pub fn is_auth_finish(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_authenticating(&self, peer_udid: &str) -> bool {
        self.sessions.is_peer_busy(peer_udid)
    }

    /// Delete credentials of removed entries that no remaining entry uses
    fn delete_credentials(&self, removed: &[AccessControlEntry]) {
        let remaining = self.deps.trust_store.list_access_control_list();
        let mut ids: Vec<&str> = removed
            .iter()
            .filter_map(|e| e.credential_id.as_deref())
            .filter(|id| {
                !remaining
                    .iter()
                    .any(|e| e.credential_id.as_deref() == Some(*id))
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        for id in ids {
            if let Err(e) = self.deps.connector.delete_credential(self.local.user_id, id) {
                warn!("Failed to delete credential {}: {}", id, e);
            }
        }
    }

    /// Serialize `msg` for broadcast, or `None` when it can't be synced
    fn sync(&self, msg: &RelationShipChangeMsg) -> Option<String> {
        self.deps
            .trust_store
            .sync_trust_relationship(msg)
            .inspect_err(|e| warn!("Not broadcasting {:?}: {}", msg.change_type, e))
            .ok()
    }

    /// Remove trust in `peer_udid` at `bind_level`.
    ///
    /// Returns the payload to broadcast to the peer, if the change can be
    /// expressed as one.
    pub fn unbind_device(
        &self,
        pkg_name: &str,
        peer_udid: &str,
        bind_level: BindLevel,
    ) -> DmResult<Option<String>> {
        if pkg_name.is_empty() || peer_udid.is_empty() || bind_level == BindLevel::Invalid {
            return Err(DmError::InputParaInvalid);
        }
        let removed = self
            .deps
            .trust_store
            .delete_access_control_list(peer_udid, bind_level, pkg_name)
            .map_err(map_storage_error)?;
        self.delete_credentials(&removed);

        let change_type = match bind_level {
            BindLevel::Service => RelationShipChangeType::ServiceUnbind,
            BindLevel::App => RelationShipChangeType::AppUnbind,
            _ => RelationShipChangeType::DeviceUnbind,
        };
        let mut msg = RelationShipChangeMsg::new(change_type, self.local.user_id);
        msg.peer_udids = vec![peer_udid.to_string()];
        msg.token_id = removed
            .iter()
            .map(|e| e.local.token_id)
            .find(|t| *t != 0)
            .unwrap_or(self.local.token_id);
        info!(
            "Unbound {} from {} at {:?} ({} entries)",
            pkg_name,
            peer_udid,
            bind_level,
            removed.len()
        );
        Ok(self.sync(&msg))
    }

    /// Drop every relationship created under a signed-out account
    pub fn handle_account_logout(
        &self,
        user_id: i32,
        account_id: &str,
    ) -> DmResult<Option<String>> {
        if account_id.is_empty() {
            return Err(DmError::InputParaInvalid);
        }
        let removed = self
            .deps
            .trust_store
            .delete_account_access_control_list(user_id, account_id)
            .map_err(map_storage_error)?;
        self.delete_credentials(&removed);

        let mut msg = RelationShipChangeMsg::new(RelationShipChangeType::AccountLogout, user_id);
        msg.account_id = account_id.to_string();
        let mut peers: Vec<String> = removed.iter().map(|e| e.remote.udid.clone()).collect();
        peers.sort();
        peers.dedup();
        msg.peer_udids = peers;
        Ok(self.sync(&msg))
    }

    /// Apply a relationship change broadcast by `from_udid`.
    ///
    /// Returns how many local entries were removed.
    pub fn on_relationship_broadcast(&self, from_udid: &str, payload: &str) -> DmResult<usize> {
        let msg = RelationShipChangeMsg::from_broadcast_payload(payload)?;
        if from_udid.is_empty() || !msg.is_valid() {
            return Err(DmError::InputParaInvalid);
        }
        let names_us = msg.peer_udids.iter().any(|u| *u == self.local.udid);
        let affected = |e: &AccessControlEntry| -> bool {
            if e.remote.udid != from_udid {
                return false;
            }
            match msg.change_type {
                RelationShipChangeType::AccountLogout => e.remote.account_id == msg.account_id,
                RelationShipChangeType::DeviceUnbind => names_us,
                RelationShipChangeType::AppUnbind => {
                    names_us && e.bind_level == BindLevel::App && e.remote.token_id == msg.token_id
                }
                RelationShipChangeType::ServiceUnbind => {
                    names_us
                        && e.bind_level == BindLevel::Service
                        && e.remote.token_id == msg.token_id
                }
                RelationShipChangeType::AppUninstall => e.remote.token_id == msg.token_id,
                RelationShipChangeType::DelUser => {
                    e.remote.user_id == msg.user_id
                        || msg.user_id_infos.iter().any(|u| u.user_id == e.remote.user_id)
                }
            }
        };
        let ids: Vec<_> = self
            .deps
            .trust_store
            .list_access_control_list()
            .into_iter()
            .filter(|e| affected(e))
            .map(|e| e.id)
            .collect();
        if ids.is_empty() {
            debug!("{:?} from {} touches nothing here", msg.change_type, from_udid);
            return Ok(0);
        }
        let removed = self
            .deps
            .trust_store
            .delete_access_control_entries(&ids)
            .map_err(map_storage_error)?;
        self.delete_credentials(&removed);
        info!(
            "Applied {:?} from {}: removed {} entries",
            msg.change_type,
            from_udid,
            removed.len()
        );
        Ok(removed.len())
    }
}

fn new_request_id() -> i64 {
    rand::thread_rng().gen_range(1..i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AccessSubject, AclLifetime};
    use crate::testing::Fixture;
    use std::time::Duration;

    fn manager(fixture: &Fixture) -> AuthManager {
        AuthManager::new(
            fixture.local.clone(),
            fixture.config.clone(),
            fixture.deps.clone(),
        )
    }

    fn trusted(peer: &str, level: BindLevel, bundle: &str, token_id: u64) -> AccessControlEntry {
        let local = AccessSubject {
            udid: "local-udid".to_string(),
            user_id: 100,
            account_id: "acct".to_string(),
            token_id: 7,
            bundle_name: bundle.to_string(),
        };
        let remote = AccessSubject {
            udid: peer.to_string(),
            user_id: 100,
            account_id: "peer-acct".to_string(),
            token_id,
            bundle_name: bundle.to_string(),
        };
        let mut entry =
            AccessControlEntry::new(local, remote, level, AuthType::Pin, AclLifetime::Permanent);
        entry.credential_id = Some(format!("cred-{}", bundle));
        entry
    }

    #[tokio::test]
    async fn test_input_validation() {
        let fixture = Fixture::new();
        let manager = manager(&fixture);

        let invalid = Err(DmError::InputParaInvalid);
        assert_eq!(manager.authenticate_device("", AuthType::Pin, "peer", ""), invalid);
        assert_eq!(manager.authenticate_device("pkg", AuthType::Pin, "", ""), invalid);
        assert_eq!(
            manager.authenticate_device("pkg", AuthType::Unknown, "peer", ""),
            invalid
        );
        assert_eq!(
            manager.authenticate_device("pkg", AuthType::Pin, "peer", "[1]"),
            invalid
        );
        assert_eq!(
            manager.authenticate_device("pkg", AuthType::Pin, "peer", r#"{"bindLevel": 9}"#),
            invalid
        );
        assert_eq!(
            manager.authenticate_device("pkg", AuthType::ImportAuthCode, "peer", ""),
            invalid
        );
        assert!(manager.is_auth_finish());
        assert!(fixture.transport.sent().is_empty());
    }

    #[test]
    fn test_bind_level_resolution() {
        let user = CallerInfo::default();
        let system = CallerInfo::system_sa();

        let none = BindExtra::parse("").unwrap();
        assert_eq!(none.resolve_bind_level(&user), Ok(BindLevel::App));
        assert_eq!(none.resolve_bind_level(&system), Ok(BindLevel::Device));

        let bad = BindExtra::parse(r#"{"bindLevel": 0}"#).unwrap();
        assert_eq!(bad.resolve_bind_level(&user), Err(DmError::InputParaInvalid));
        assert_eq!(bad.resolve_bind_level(&system), Ok(BindLevel::Device));

        let service = BindExtra::parse(r#"{"bindLevel": 2, "appName": "Demo"}"#).unwrap();
        assert_eq!(service.resolve_bind_level(&user), Ok(BindLevel::Service));
        assert_eq!(service.app_name.as_deref(), Some("Demo"));

        assert!(BindExtra::parse(r#"{"bindLevel": "2"}"#).is_err());
    }

    #[tokio::test]
    async fn test_second_bind_to_same_peer_is_busy() {
        let fixture = Fixture::new();
        let manager = manager(&fixture);

        let request_id = manager
            .authenticate_device("pkg", AuthType::Pin, "peer", "")
            .unwrap();
        assert!(request_id > 0);
        assert!(manager.is_authenticating("peer"));
        assert_eq!(
            manager.authenticate_device("other", AuthType::Pin, "peer", ""),
            Err(DmError::AuthBusinessBusy)
        );
        assert!(manager.is_authenticating("peer"));
        assert!(!manager.is_auth_finish());
    }

    #[tokio::test]
    async fn test_stop_unknown_package() {
        let fixture = Fixture::new();
        let manager = manager(&fixture);
        assert_eq!(
            manager.stop_authenticate_device("nobody").await,
            Err(DmError::AuthNotStart)
        );
    }

    #[tokio::test]
    async fn test_stop_tears_down_session() {
        let fixture = Fixture::new();
        let manager = manager(&fixture);

        let request_id = manager
            .authenticate_device("pkg", AuthType::Pin, "peer", "")
            .unwrap();
        manager.stop_authenticate_device("pkg").await.unwrap();

        assert!(manager.is_auth_finish());
        let results = fixture.listener.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].request_id, request_id);
        assert_eq!(results[0].result_code, DmError::StopBind.code());
        assert_eq!(
            manager.on_user_operation(request_id, UserAction::Cancel, None),
            Err(DmError::AuthNotStart)
        );

        // Late open results for finished or unknown sessions are not kept
        for session_id in 1000..1100 {
            manager.on_session_opened(session_id, SessionSide::Client, 0);
        }
        assert_eq!(manager.sessions.parked_opens(), 0);
    }

    #[tokio::test]
    async fn test_inbound_negotiate_creates_sink() {
        let fixture = Fixture::new();
        let manager = manager(&fixture);
        let negotiate = AuthMessage::ReqAclNegotiate {
            request_id: 500,
            info: NegotiateInfo {
                udid: "peer-udid".to_string(),
                bundle_name: "com.example.app".to_string(),
                auth_type: AuthType::Pin,
                bind_level: BindLevel::App,
                ..Default::default()
            },
        };

        manager.on_data_received(3, b"garbage");
        manager.on_data_received(3, &encode(&AuthMessage::finish_ok(1)));
        assert!(manager.is_auth_finish());

        manager.on_data_received(3, &encode(&negotiate));
        assert!(manager.is_authenticating("peer-udid"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            fixture.transport.last_sent(),
            Some(AuthMessage::RespAclNegotiate { request_id: 500, .. })
        ));

        // Same peer again on another session
        let again = AuthMessage::ReqAclNegotiate {
            request_id: 501,
            info: NegotiateInfo {
                udid: "peer-udid".to_string(),
                ..Default::default()
            },
        };
        manager.on_data_received(4, &encode(&again));
        assert_eq!(
            fixture.transport.last_sent(),
            Some(AuthMessage::ReqFinish {
                request_id: 501,
                reply: DmError::AuthBusinessBusy.code(),
            })
        );
    }

    #[tokio::test]
    async fn test_auth_code_import() {
        let fixture = Fixture::new();
        let manager = manager(&fixture);

        assert_eq!(
            manager.import_auth_code("pkg", "12345"),
            Err(DmError::InputParaInvalid)
        );
        assert_eq!(
            manager.import_auth_code("", "123456"),
            Err(DmError::InputParaInvalid)
        );
        let code = manager.export_auth_code();
        manager.import_auth_code("pkg", &code).unwrap();
        assert!(manager
            .authenticate_device("pkg", AuthType::ImportAuthCode, "peer", "")
            .is_ok());
    }

    #[test]
    fn test_unbind_device() {
        let fixture = Fixture::new();
        let manager = manager(&fixture);
        fixture
            .store
            .put_access_control_list(trusted("peer", BindLevel::App, "com.a", 0))
            .unwrap();
        fixture
            .store
            .put_access_control_list(trusted("peer", BindLevel::App, "com.b", 0))
            .unwrap();

        let payload = manager
            .unbind_device("com.a", "peer", BindLevel::App)
            .unwrap()
            .unwrap();
        assert_eq!(fixture.store.entry_count(), 1);
        let msg = RelationShipChangeMsg::from_broadcast_payload(&payload).unwrap();
        assert_eq!(msg.change_type, RelationShipChangeType::AppUnbind);
        assert_eq!(msg.peer_udids, vec!["peer".to_string()]);
        assert_eq!(msg.token_id, 7);

        assert_eq!(
            manager.unbind_device("com.a", "peer", BindLevel::App),
            Err(DmError::NotFound)
        );
        assert_eq!(
            manager.unbind_device("com.a", "peer", BindLevel::Invalid),
            Err(DmError::InputParaInvalid)
        );
    }

    #[test]
    fn test_account_logout() {
        let fixture = Fixture::new();
        let manager = manager(&fixture);
        fixture
            .store
            .put_access_control_list(trusted("p1", BindLevel::Device, "", 0))
            .unwrap();
        fixture
            .store
            .put_access_control_list(trusted("p2", BindLevel::Device, "", 0))
            .unwrap();

        let payload = manager.handle_account_logout(100, "acct").unwrap().unwrap();
        assert_eq!(fixture.store.entry_count(), 0);
        let msg = RelationShipChangeMsg::from_broadcast_payload(&payload).unwrap();
        assert_eq!(msg.account_id, "acct");
        assert_eq!(msg.peer_udids, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[test]
    fn test_relationship_broadcast_applies_to_sender_only() {
        let fixture = Fixture::new();
        let manager = manager(&fixture);
        fixture
            .store
            .put_access_control_list(trusted("peer", BindLevel::App, "com.a", 42))
            .unwrap();
        fixture
            .store
            .put_access_control_list(trusted("peer", BindLevel::App, "com.b", 43))
            .unwrap();
        fixture
            .store
            .put_access_control_list(trusted("other", BindLevel::App, "com.a", 42))
            .unwrap();

        let mut msg = RelationShipChangeMsg::new(RelationShipChangeType::AppUnbind, 100);
        msg.peer_udids = vec!["local-udid".to_string()];
        msg.token_id = 42;
        let payload = msg.to_broadcast_payload().unwrap();

        assert_eq!(manager.on_relationship_broadcast("peer", &payload), Ok(1));
        assert_eq!(fixture.store.entry_count(), 2);
        assert_eq!(manager.on_relationship_broadcast("peer", &payload), Ok(0));

        let mut device = RelationShipChangeMsg::new(RelationShipChangeType::DeviceUnbind, 100);
        device.peer_udids = vec!["someone-else".to_string()];
        let payload = device.to_broadcast_payload().unwrap();
        assert_eq!(manager.on_relationship_broadcast("peer", &payload), Ok(0));

        assert_eq!(
            manager.on_relationship_broadcast("peer", "{}"),
            Err(DmError::InputParaInvalid)
        );
    }
}
