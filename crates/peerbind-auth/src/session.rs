//! Session driver
//!
//! Each handshake runs on its own tokio task. The task owns the session's
//! [`Lifecycle`] and handles one [`SessionInput`] at a time, so state
//! actions, timers and stop requests never interleave.

use crate::context::{AuthContext, Lifecycle};
use crate::listener::{AuthResult, UiState};
use crate::message::AuthMessage;
use crate::state::{
    action, next_state, on_credential_error, process_sink_msg, process_source_msg,
    process_user_operation, ActionOutcome, DmAuthState, Transition,
};
use peerbind_core::{
    result_code, AuthConfig, AuthRole, DmError, DmResult, TimerName, UserAction, DM_OK,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything a session driver reacts to
#[derive(Debug)]
pub enum SessionInput {
    /// Transport finished opening our session
    SessionOpened { result: i32 },
    SessionClosed,
    Message(AuthMessage),
    UserOperation {
        action: UserAction,
        params: Option<String>,
    },
    Timeout(TimerName),
    Stop {
        reason: DmError,
        done: Option<oneshot::Sender<()>>,
    },
}

/// Registry entry for a live session
#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    pub request_id: i64,
    pub role: AuthRole,
    pub pkg_name: String,
    pub peer_udid: String,
    pub session_id: Option<i32>,
    pub tx: mpsc::UnboundedSender<SessionInput>,
}

#[derive(Default)]
struct RegistryInner {
    handles: HashMap<i64, SessionHandle>,
    /// Open results that arrived before the session id was bound
    early_opens: HashMap<i32, i32>,
}

impl RegistryInner {
    fn has_unbound(&self) -> bool {
        self.handles.values().any(|h| h.session_id.is_none())
    }

    /// Parked results only matter to sessions still waiting for their id
    fn drop_unclaimed_opens(&mut self) {
        if !self.has_unbound() {
            self.early_opens.clear();
        }
    }
}

/// Live sessions, at most one per peer
#[derive(Clone, Default)]
pub(crate) struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SessionRegistry {
    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the peer for a new session
    pub fn try_insert(&self, handle: SessionHandle) -> DmResult<()> {
        let mut inner = self.lock();
        if inner.handles.contains_key(&handle.request_id)
            || inner.handles.values().any(|h| h.peer_udid == handle.peer_udid)
        {
            return Err(DmError::AuthBusinessBusy);
        }
        inner.handles.insert(handle.request_id, handle);
        Ok(())
    }

    pub fn remove(&self, request_id: i64) -> Option<SessionHandle> {
        let mut inner = self.lock();
        let handle = inner.handles.remove(&request_id)?;
        if let Some(session_id) = handle.session_id {
            inner.early_opens.remove(&session_id);
        }
        inner.drop_unclaimed_opens();
        Some(handle)
    }

    /// Attach a transport session, returning an open result that raced ahead
    pub fn bind_session(&self, request_id: i64, session_id: i32) -> Option<i32> {
        let mut inner = self.lock();
        let handle = inner.handles.get_mut(&request_id)?;
        handle.session_id = Some(session_id);
        let parked = inner.early_opens.remove(&session_id);
        inner.drop_unclaimed_opens();
        parked
    }

    /// Route an open result.
    ///
    /// A result for an unknown session id is parked only while some session
    /// is still waiting for its id; otherwise it is dropped.
    pub fn open_result(&self, session_id: i32, result: i32) -> Option<SessionHandle> {
        let mut inner = self.lock();
        let handle = inner
            .handles
            .values()
            .find(|h| h.session_id == Some(session_id))
            .cloned();
        if handle.is_none() && inner.has_unbound() {
            inner.early_opens.insert(session_id, result);
        }
        handle
    }

    #[cfg(test)]
    pub(crate) fn parked_opens(&self) -> usize {
        self.lock().early_opens.len()
    }

    pub fn get(&self, request_id: i64) -> Option<SessionHandle> {
        self.lock().handles.get(&request_id).cloned()
    }

    pub fn find_by_session(&self, session_id: i32) -> Option<SessionHandle> {
        self.lock()
            .handles
            .values()
            .find(|h| h.session_id == Some(session_id))
            .cloned()
    }

    pub fn find_by_pkg(&self, pkg_name: &str) -> Option<SessionHandle> {
        self.lock()
            .handles
            .values()
            .find(|h| h.pkg_name == pkg_name)
            .cloned()
    }

    pub fn is_peer_busy(&self, peer_udid: &str) -> bool {
        self.lock().handles.values().any(|h| h.peer_udid == peer_udid)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().handles.is_empty()
    }
}

/// Named one-shot timers feeding `Timeout` inputs back into the session
pub(crate) struct TaskTimers {
    tx: mpsc::UnboundedSender<SessionInput>,
    handles: HashMap<TimerName, JoinHandle<()>>,
}

impl TaskTimers {
    pub fn new(tx: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self {
            tx,
            handles: HashMap::new(),
        }
    }

    /// Arm `name`, replacing a running timer of the same name
    pub fn start(&mut self, name: TimerName, duration: Duration) {
        self.cancel(name);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(SessionInput::Timeout(name));
        });
        self.handles.insert(name, handle);
    }

    pub fn cancel(&mut self, name: TimerName) {
        if let Some(handle) = self.handles.remove(&name) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }

    /// Keep only the timers relevant once `state` is entered
    fn enter_state(&mut self, state: DmAuthState, config: &AuthConfig) {
        let wanted = state.wait_timer();
        let stale: Vec<TimerName> = self
            .handles
            .keys()
            .copied()
            .filter(|name| *name != TimerName::Authenticate && Some(*name) != wanted)
            .collect();
        for name in stale {
            self.cancel(name);
        }
        if let Some(name) = wanted {
            self.start(name, config.task_timeout(name));
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, name: TimerName) -> bool {
        self.handles.contains_key(&name)
    }
}

impl Drop for TaskTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Driver of one authentication session
pub struct AuthSession {
    request_id: i64,
    lifecycle: Lifecycle,
    timers: TaskTimers,
    registry: SessionRegistry,
}

impl AuthSession {
    pub(crate) fn new(
        ctx: AuthContext,
        registry: SessionRegistry,
        tx: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        Self {
            request_id: ctx.request_id,
            lifecycle: Lifecycle::Active(Box::new(ctx)),
            timers: TaskTimers::new(tx),
            registry,
        }
    }

    #[cfg(test)]
    pub(crate) fn uninitialized(
        request_id: i64,
        registry: SessionRegistry,
        tx: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        Self {
            request_id,
            lifecycle: Lifecycle::Uninitialized,
            timers: TaskTimers::new(tx),
            registry,
        }
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Drive the session from `initial` until it finishes
    pub(crate) async fn run(
        mut self,
        initial: DmAuthState,
        mut inputs: mpsc::UnboundedReceiver<SessionInput>,
    ) {
        if let Lifecycle::Active(ctx) = &self.lifecycle {
            let timeout = ctx.config.task_timeout(TimerName::Authenticate);
            self.timers.start(TimerName::Authenticate, timeout);
        }
        self.enter(initial).await;

        while self.lifecycle.is_active() {
            let Some(input) = inputs.recv().await else {
                break;
            };
            self.handle_input(input).await;
        }

        // Stop requests that raced with the finish still get their ack
        while let Ok(input) = inputs.try_recv() {
            if let SessionInput::Stop {
                done: Some(done), ..
            } = input
            {
                let _ = done.send(());
            }
        }
        debug!("Session driver for request {} exited", self.request_id);
    }

    pub(crate) async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Stop { reason, done } => {
                if self.set_reason_and_finish(reason).is_err() {
                    debug!("Stop for request {} after finish", self.request_id);
                }
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            SessionInput::Timeout(name) => self.handle_authenticate_timeout(name),
            SessionInput::SessionClosed => {
                if self.lifecycle.is_active() {
                    warn!("Session of request {} closed by peer", self.request_id);
                    let _ = self.finish(Err(DmError::SessionClosed), false);
                }
            }
            SessionInput::SessionOpened { result } => {
                let transition = match &self.lifecycle {
                    Lifecycle::Active(ctx) if ctx.state == DmAuthState::SrcStart => {
                        if result == DM_OK {
                            Transition::Enter(DmAuthState::SrcNegotiate)
                        } else {
                            warn!(
                                "Opening session for request {} failed: {}",
                                self.request_id, result
                            );
                            Transition::Finish {
                                reason: Err(DmError::AuthOpenSessionFailed),
                                notify_peer: false,
                            }
                        }
                    }
                    _ => Transition::Wait,
                };
                self.apply(transition).await;
            }
            SessionInput::Message(msg) => {
                let transition = match &mut self.lifecycle {
                    Lifecycle::Active(ctx) if msg.request_id() != ctx.request_id => {
                        warn!(
                            "Dropping message for request {} on session of request {}",
                            msg.request_id(),
                            ctx.request_id
                        );
                        Transition::Wait
                    }
                    Lifecycle::Active(ctx) => match ctx.role {
                        AuthRole::Source => process_source_msg(ctx, msg),
                        AuthRole::Sink => process_sink_msg(ctx, msg),
                    },
                    _ => Transition::Wait,
                };
                self.apply(transition).await;
            }
            SessionInput::UserOperation { action, params } => {
                let transition = match &mut self.lifecycle {
                    Lifecycle::Active(ctx) => {
                        process_user_operation(ctx, action, params.as_deref())
                    }
                    _ => Transition::Wait,
                };
                self.apply(transition).await;
            }
        }
    }

    async fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::Enter(state) => self.enter(state).await,
            Transition::Wait => {}
            Transition::Finish {
                reason,
                notify_peer,
            } => {
                let _ = self.finish(reason, notify_peer);
            }
        }
    }

    /// Enter `state` and keep following local transitions
    async fn enter(&mut self, mut state: DmAuthState) {
        loop {
            let Lifecycle::Active(ctx) = &mut self.lifecycle else {
                return;
            };
            debug!("Request {}: {} -> {}", ctx.request_id, ctx.state, state);
            ctx.state = state;
            self.timers.enter_state(state, &ctx.config);

            let transition = match action(state, ctx).await {
                Err(e) => {
                    warn!("Request {} failed in {}: {}", ctx.request_id, state, e);
                    Transition::Finish {
                        reason: Err(e),
                        notify_peer: true,
                    }
                }
                Ok(ActionOutcome::StopBind) => Transition::Finish {
                    reason: Err(DmError::StopBind),
                    notify_peer: true,
                },
                Ok(ActionOutcome::Advance) => match ctx.credential_error.take() {
                    Some(code) => on_credential_error(ctx, code),
                    None if state.is_terminal() => Transition::Finish {
                        reason: Ok(()),
                        notify_peer: false,
                    },
                    None => next_state(state, ctx).map_or(Transition::Wait, Transition::Enter),
                },
            };

            match transition {
                Transition::Enter(next) => state = next,
                Transition::Wait => return,
                Transition::Finish {
                    reason,
                    notify_peer,
                } => {
                    let _ = self.finish(reason, notify_peer);
                    return;
                }
            }
        }
    }

    /// End the session with `reason`.
    ///
    /// Returns `AuthNotStart` when the session is not active, leaving the
    /// recorded outcome untouched.
    pub fn set_reason_and_finish(&mut self, reason: DmError) -> DmResult<()> {
        self.finish(Err(reason), true)
    }

    /// A session timer fired
    pub fn handle_authenticate_timeout(&mut self, name: TimerName) {
        if !self.lifecycle.is_active() {
            debug!("{} fired for finished request {}", name, self.request_id);
            return;
        }
        warn!("{} expired for request {}", name, self.request_id);
        let _ = self.set_reason_and_finish(DmError::TimeOut);
    }

    fn finish(&mut self, reason: DmResult<()>, notify_peer: bool) -> DmResult<()> {
        let mut ctx = match std::mem::replace(&mut self.lifecycle, Lifecycle::Finished(reason)) {
            Lifecycle::Active(ctx) => ctx,
            previous => {
                self.lifecycle = previous;
                return Err(DmError::AuthNotStart);
            }
        };

        self.timers.cancel_all();
        ctx.reason = reason;
        ctx.state = DmAuthState::finish_for(ctx.role);

        if let (Err(err), true) = (reason, notify_peer) {
            let msg = AuthMessage::ReqFinish {
                request_id: ctx.request_id,
                reply: err.code(),
            };
            if let Err(e) = ctx.outbox.send(&msg) {
                debug!("Could not tell peer about {}: {}", ctx.request_id, e);
            }
        }
        ctx.deps.prompt.close_dialogs(ctx.request_id);
        ctx.deps.connector.unregister(ctx.request_id);
        ctx.outbox.close();
        self.registry.remove(ctx.request_id);

        let result = AuthResult {
            pkg_name: ctx.pkg_name.clone(),
            device_id: ctx.peer_device_id.clone(),
            request_id: ctx.request_id,
            role: ctx.role,
            result_code: result_code(&reason),
        };
        match reason {
            Ok(()) => info!(
                "Request {} ({}) with {} succeeded",
                ctx.request_id, ctx.role, ctx.peer_device_id
            ),
            Err(e) => warn!(
                "Request {} ({}) with {} failed: {}",
                ctx.request_id, ctx.role, ctx.peer_device_id, e
            ),
        }
        ctx.deps.listener.on_auth_result(&result);
        ctx.notify_ui(UiState::Finished);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    fn active_session(fixture: &Fixture, role: AuthRole) -> AuthSession {
        let (ctx, _rx) = fixture.context(role, 77);
        let (tx, _inputs) = mpsc::unbounded_channel();
        AuthSession::new(ctx, SessionRegistry::default(), tx)
    }

    #[tokio::test]
    async fn test_timeout_before_start_is_noop() {
        let (tx, _inputs) = mpsc::unbounded_channel();
        let mut session = AuthSession::uninitialized(5, SessionRegistry::default(), tx);

        session.handle_authenticate_timeout(TimerName::Authenticate);
        assert!(matches!(session.lifecycle(), Lifecycle::Uninitialized));
        assert_eq!(
            session.set_reason_and_finish(DmError::Failed),
            Err(DmError::AuthNotStart)
        );
    }

    #[tokio::test]
    async fn test_timeout_is_idempotent() {
        let fixture = Fixture::new();
        let mut session = active_session(&fixture, AuthRole::Source);

        session.handle_authenticate_timeout(TimerName::Authenticate);
        assert_eq!(session.lifecycle().reason(), Some(Err(DmError::TimeOut)));

        session.handle_authenticate_timeout(TimerName::Negotiate);
        assert_eq!(
            session.set_reason_and_finish(DmError::Failed),
            Err(DmError::AuthNotStart)
        );
        assert_eq!(session.lifecycle().reason(), Some(Err(DmError::TimeOut)));

        let results = fixture.listener.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result_code, DmError::TimeOut.code());
        assert_eq!(results[0].device_id, "peer-udid");
    }

    #[tokio::test]
    async fn test_local_failure_notifies_peer_and_closes() {
        let fixture = Fixture::new();
        let mut session = active_session(&fixture, AuthRole::Sink);

        session.set_reason_and_finish(DmError::StopBind).unwrap();
        assert_eq!(
            fixture.transport.last_sent(),
            Some(AuthMessage::ReqFinish {
                request_id: 77,
                reply: DmError::StopBind.code(),
            })
        );
        assert_eq!(fixture.transport.closed(), vec![1]);
        assert!(!fixture.deps.connector.callbacks().is_registered(77));
        assert_eq!(fixture.listener.ui_states(), vec![UiState::Finished]);
    }

    #[tokio::test]
    async fn test_peer_failure_is_not_echoed() {
        let fixture = Fixture::new();
        let mut session = active_session(&fixture, AuthRole::Source);

        session
            .handle_input(SessionInput::Message(AuthMessage::ReqFinish {
                request_id: 77,
                reply: DmError::BindUserCancel.code(),
            }))
            .await;
        assert_eq!(
            session.lifecycle().reason(),
            Some(Err(DmError::BindUserCancel))
        );
        assert!(fixture.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_request_id_dropped() {
        let fixture = Fixture::new();
        let mut session = active_session(&fixture, AuthRole::Source);

        session
            .handle_input(SessionInput::Message(AuthMessage::ReqFinish {
                request_id: 78,
                reply: DmError::Failed.code(),
            }))
            .await;
        assert!(session.lifecycle().is_active());
    }

    #[tokio::test]
    async fn test_session_open_starts_negotiation() {
        let fixture = Fixture::new();
        let mut session = active_session(&fixture, AuthRole::Source);

        session
            .handle_input(SessionInput::SessionOpened { result: DM_OK })
            .await;
        match session.lifecycle() {
            Lifecycle::Active(ctx) => assert_eq!(ctx.state, DmAuthState::SrcNegotiate),
            other => panic!("unexpected lifecycle {:?}", other),
        }
        assert!(session.timers.is_armed(TimerName::Negotiate));
        assert!(matches!(
            fixture.transport.last_sent(),
            Some(AuthMessage::ReqAclNegotiate { request_id: 77, .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_acknowledged() {
        let fixture = Fixture::new();
        let mut session = active_session(&fixture, AuthRole::Source);
        let (done, ack) = oneshot::channel();

        session
            .handle_input(SessionInput::Stop {
                reason: DmError::StopBind,
                done: Some(done),
            })
            .await;
        assert!(ack.await.is_ok());
        assert_eq!(session.lifecycle().reason(), Some(Err(DmError::StopBind)));
    }

    #[test]
    fn test_registry_rejects_second_session_per_peer() {
        let registry = SessionRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = |request_id| SessionHandle {
            request_id,
            role: AuthRole::Source,
            pkg_name: "com.example".to_string(),
            peer_udid: "peer".to_string(),
            session_id: None,
            tx: tx.clone(),
        };

        registry.try_insert(handle(1)).unwrap();
        assert_eq!(registry.try_insert(handle(2)), Err(DmError::AuthBusinessBusy));
        registry.bind_session(1, 40);
        assert_eq!(registry.find_by_session(40).map(|h| h.request_id), Some(1));
        assert!(registry.is_peer_busy("peer"));
        registry.remove(1);
        assert!(registry.is_empty());
    }

    fn waiting(request_id: i64, peer: &str) -> SessionHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        SessionHandle {
            request_id,
            role: AuthRole::Source,
            pkg_name: "com.example".to_string(),
            peer_udid: peer.to_string(),
            session_id: None,
            tx,
        }
    }

    #[test]
    fn test_registry_parks_early_open_result() {
        let registry = SessionRegistry::default();
        registry.try_insert(waiting(9, "peer")).unwrap();

        assert!(registry.open_result(12, DM_OK).is_none());
        assert_eq!(registry.bind_session(9, 12), Some(DM_OK));
        assert_eq!(registry.bind_session(9, 12), None);
        assert_eq!(registry.open_result(12, DM_OK).map(|h| h.request_id), Some(9));
        assert_eq!(registry.parked_opens(), 0);
    }

    #[test]
    fn test_registry_drops_unclaimed_open_results() {
        let registry = SessionRegistry::default();

        // Nobody is waiting for a session id
        for session_id in 1000..1100 {
            assert!(registry.open_result(session_id, DM_OK).is_none());
        }
        assert_eq!(registry.parked_opens(), 0);

        // Results parked for a waiting session go away with it
        registry.try_insert(waiting(9, "peer")).unwrap();
        assert!(registry.open_result(5, DM_OK).is_none());
        assert!(registry.open_result(6, DM_OK).is_none());
        assert_eq!(registry.parked_opens(), 2);
        registry.remove(9);
        assert_eq!(registry.parked_opens(), 0);

        // Binding the last waiting session drops results nobody claimed
        registry.try_insert(waiting(10, "peer")).unwrap();
        assert!(registry.open_result(7, DM_OK).is_none());
        assert!(registry.open_result(8, DM_OK).is_none());
        assert_eq!(registry.bind_session(10, 8), Some(DM_OK));
        assert_eq!(registry.parked_opens(), 0);
        assert!(registry.bind_session(10, 7).is_none());
    }
}
