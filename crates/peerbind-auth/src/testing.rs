//! In-process doubles for the collaborator traits

use crate::acl::LocalDevice;
use crate::context::AuthContext;
use crate::credential::{
    CredentialCallbacks, CredentialConnector, CredentialEngine, CredentialEvent,
};
use crate::listener::{AuthListener, AuthResult, UiState};
use crate::manager::AuthDeps;
use crate::message::{decode, AuthMessage};
use crate::prompt::{ConfirmParams, PromptReply, UserPrompt};
use crate::session::SessionInput;
use crate::storage::JsonTrustStore;
use crate::transport::{Outbox, SessionTransport};
use peerbind_core::{AuthConfig, AuthRole, AuthType, BindLevel, DmError, DmResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Engine that replays a prepared list of events on its next call
#[derive(Default)]
pub(crate) struct ScriptedEngine {
    callbacks: CredentialCallbacks,
    script: Mutex<VecDeque<CredentialEvent>>,
    failure: Mutex<Option<DmError>>,
    generated: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(callbacks: CredentialCallbacks) -> Self {
        Self {
            callbacks,
            ..Default::default()
        }
    }

    pub fn script(&self, events: Vec<CredentialEvent>) {
        self.script.lock().unwrap().extend(events);
    }

    pub fn fail_next(&self, err: DmError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> DmResult<()> {
        match self.failure.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn replay(&self, request_id: i64) -> DmResult<()> {
        self.take_failure()?;
        let events: Vec<_> = self.script.lock().unwrap().drain(..).collect();
        for event in events {
            match event {
                CredentialEvent::Transmit(data) => {
                    self.callbacks.on_transmit(request_id, data.as_bytes());
                }
                CredentialEvent::Request {
                    operation_code,
                    params,
                } => {
                    self.callbacks.on_request(request_id, operation_code, &params);
                }
                CredentialEvent::Finish {
                    operation_code,
                    data,
                } => self.callbacks.on_finish(request_id, operation_code, &data),
                CredentialEvent::Error {
                    operation_code,
                    error_code,
                } => self
                    .callbacks
                    .on_error(request_id, operation_code, error_code, "scripted"),
                CredentialEvent::SessionKeyReturned(key) => {
                    self.callbacks.on_session_key_returned(request_id, &key)
                }
            }
        }
        Ok(())
    }
}

impl CredentialEngine for ScriptedEngine {
    fn auth_credential_pin_code(&self, request_id: i64, _: i32, _: &str, _: u32) -> DmResult<()> {
        self.replay(request_id)
    }

    fn process_cred_data(&self, request_id: i64, _: &str) -> DmResult<()> {
        self.replay(request_id)
    }

    fn generate_credential(&self, _: i32, _: &str, _: &str) -> DmResult<String> {
        self.take_failure()?;
        let n = self.generated.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("cred-{}", n))
    }

    fn import_credential(&self, _: i32, _: &str) -> DmResult<String> {
        Ok("imported".to_string())
    }

    fn delete_credential(&self, _: i32, _: &str) -> DmResult<()> {
        Ok(())
    }

    fn query_credential(&self, _: i32, _: &str) -> DmResult<bool> {
        Ok(false)
    }

    fn get_credential(&self, _: i32, credential_id: &str) -> DmResult<String> {
        Ok(credential_id.to_string())
    }
}

/// Transport that decodes and keeps everything sent on it
#[derive(Default)]
pub(crate) struct RecordingTransport {
    next_session: AtomicI32,
    sent: Mutex<Vec<AuthMessage>>,
    closed: Mutex<Vec<i32>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<AuthMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_sent(&self) -> Option<AuthMessage> {
        self.sent.lock().unwrap().last().cloned()
    }

    pub fn closed(&self) -> Vec<i32> {
        self.closed.lock().unwrap().clone()
    }
}

impl SessionTransport for RecordingTransport {
    fn open_session(&self, _peer_udid: &str) -> DmResult<i32> {
        Ok(self.next_session.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn close_session(&self, session_id: i32) {
        self.closed.lock().unwrap().push(session_id);
    }

    fn send_bytes(&self, _session_id: i32, data: &[u8]) -> DmResult<()> {
        let msg = decode(data).map_err(|_| DmError::Failed)?;
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingPrompt {
    confirms: Mutex<Vec<ConfirmParams>>,
    pin_inputs: Mutex<Vec<i64>>,
    displayed: Mutex<Vec<u32>>,
}

impl RecordingPrompt {
    pub fn confirms(&self) -> Vec<ConfirmParams> {
        self.confirms.lock().unwrap().clone()
    }

    pub fn pin_inputs(&self) -> Vec<i64> {
        self.pin_inputs.lock().unwrap().clone()
    }

    pub fn displayed(&self) -> Vec<u32> {
        self.displayed.lock().unwrap().clone()
    }
}

impl UserPrompt for RecordingPrompt {
    fn show_confirm_dialog(&self, params: ConfirmParams, _reply: PromptReply) {
        self.confirms.lock().unwrap().push(params);
    }

    fn show_pin_input_dialog(&self, request_id: i64, _reply: PromptReply) {
        self.pin_inputs.lock().unwrap().push(request_id);
    }

    fn show_pin_display(&self, _request_id: i64, pin_code: u32) {
        self.displayed.lock().unwrap().push(pin_code);
    }
}

#[derive(Default)]
pub(crate) struct RecordingListener {
    results: Mutex<Vec<AuthResult>>,
    ui: Mutex<Vec<UiState>>,
}

impl RecordingListener {
    pub fn results(&self) -> Vec<AuthResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn ui_states(&self) -> Vec<UiState> {
        self.ui.lock().unwrap().clone()
    }
}

impl AuthListener for RecordingListener {
    fn on_auth_result(&self, result: &AuthResult) {
        self.results.lock().unwrap().push(result.clone());
    }

    fn on_ui_state(&self, _request_id: i64, state: UiState) {
        self.ui.lock().unwrap().push(state);
    }
}

/// A full set of doubles wired together
pub(crate) struct Fixture {
    pub engine: Arc<ScriptedEngine>,
    pub transport: Arc<RecordingTransport>,
    pub store: Arc<JsonTrustStore>,
    pub prompt: Arc<RecordingPrompt>,
    pub listener: Arc<RecordingListener>,
    pub deps: AuthDeps,
    pub config: AuthConfig,
    pub local: LocalDevice,
}

impl Fixture {
    pub fn new() -> Self {
        let callbacks = CredentialCallbacks::new();
        let engine = Arc::new(ScriptedEngine::new(callbacks.clone()));
        let transport = Arc::new(RecordingTransport::default());
        let store = Arc::new(JsonTrustStore::in_memory());
        let prompt = Arc::new(RecordingPrompt::default());
        let listener = Arc::new(RecordingListener::default());
        let deps = AuthDeps {
            transport: transport.clone(),
            connector: Arc::new(CredentialConnector::new(engine.clone(), callbacks)),
            trust_store: store.clone(),
            prompt: prompt.clone(),
            listener: listener.clone(),
        };
        Self {
            engine,
            transport,
            store,
            prompt,
            listener,
            deps,
            config: AuthConfig::new().with_wait_event_timeout(Duration::from_millis(50)),
            local: LocalDevice::new("local-udid").with_token_id(7),
        }
    }

    /// A context bound to session 1, talking to `peer-udid`
    pub fn context(
        &self,
        role: AuthRole,
        request_id: i64,
    ) -> (AuthContext, mpsc::UnboundedReceiver<SessionInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = self.deps.connector.register(request_id, &self.config);
        let mut outbox = Outbox::new(self.deps.transport.clone());
        outbox.bind(1);
        let mut ctx = AuthContext::new(
            request_id,
            role,
            self.local.clone(),
            self.config.clone(),
            self.deps.clone(),
            events,
            outbox,
            PromptReply::new(request_id, tx),
        );
        ctx.pkg_name = "com.example.app".to_string();
        ctx.peer_pkg_name = "com.example.app".to_string();
        ctx.peer_device_id = "peer-udid".to_string();
        ctx.auth_type = AuthType::Pin;
        ctx.bind_level = BindLevel::App;
        (ctx, rx)
    }
}
