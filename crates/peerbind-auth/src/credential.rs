//! Adapter between the state machine and the credential engine
//!
//! Engine calls only report whether a request was accepted. The actual
//! results arrive later through [`CredentialCallbacks`], which queues them
//! per request id. States consume them with
//! [`EventReceiver::wait_expect_event`].

use peerbind_core::{AuthConfig, DmError, DmResult};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Engine answer accepting a request
pub const REQUEST_ACCEPTED: i64 = 0x8000_0006;
/// Operation code of a PIN authentication
pub const OP_PIN_AUTH: i32 = 2;
/// Error code reported when no event arrives in time
pub const ERR_WAIT_EVENT_TIMEOUT: i32 = -1;
/// Error code reported when the event queue is gone
pub const ERR_EVENT_QUEUE_CLOSED: i32 = -2;

/// Credential / key-agreement engine
///
/// Every call returns once the engine has accepted or refused the request;
/// results are delivered through [`CredentialCallbacks`].
pub trait CredentialEngine: Send + Sync {
    /// Start a PIN-based key agreement as the initiator
    fn auth_credential_pin_code(
        &self,
        request_id: i64,
        os_account_id: i32,
        udid: &str,
        pin_code: u32,
    ) -> DmResult<()>;

    /// Feed data relayed from the peer into the engine
    fn process_cred_data(&self, request_id: i64, data: &str) -> DmResult<()>;

    /// Create a credential for the pair, returning its id
    fn generate_credential(&self, os_account_id: i32, udid: &str, peer_udid: &str)
        -> DmResult<String>;

    /// Import a credential issued elsewhere, returning its id
    fn import_credential(&self, os_account_id: i32, credential: &str) -> DmResult<String>;

    fn delete_credential(&self, os_account_id: i32, credential_id: &str) -> DmResult<()>;

    /// Whether a credential for the peer exists
    fn query_credential(&self, os_account_id: i32, peer_udid: &str) -> DmResult<bool>;

    /// Credential body by id
    fn get_credential(&self, os_account_id: i32, credential_id: &str) -> DmResult<String>;
}

/// Event delivered by the engine for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialEvent {
    /// Data that must be relayed to the peer
    Transmit(String),
    /// Engine needs parameters the router could not supply
    Request { operation_code: i32, params: String },
    /// Operation completed
    Finish { operation_code: i32, data: String },
    /// Operation failed
    Error { operation_code: i32, error_code: i32 },
    /// Session key established
    SessionKeyReturned(Vec<u8>),
}

/// Kind of a [`CredentialEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OnTransmit,
    OnRequest,
    OnFinish,
    OnError,
    OnSessionKeyReturned,
}

impl CredentialEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CredentialEvent::Transmit(_) => EventKind::OnTransmit,
            CredentialEvent::Request { .. } => EventKind::OnRequest,
            CredentialEvent::Finish { .. } => EventKind::OnFinish,
            CredentialEvent::Error { .. } => EventKind::OnError,
            CredentialEvent::SessionKeyReturned(_) => EventKind::OnSessionKeyReturned,
        }
    }
}

struct RequestSlot {
    tx: mpsc::Sender<CredentialEvent>,
    pin_code: Option<u32>,
}

/// Callback surface handed to the engine
///
/// Cloning is cheap; all clones route into the same per-request queues.
#[derive(Clone, Default)]
pub struct CredentialCallbacks {
    slots: Arc<Mutex<HashMap<i64, RequestSlot>>>,
}

impl CredentialCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    fn post(&self, request_id: i64, event: CredentialEvent) -> bool {
        let tx = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.get(&request_id).map(|slot| slot.tx.clone())
        };
        let Some(tx) = tx else {
            debug!(
                "Dropping {:?} for stale request {}",
                event.kind(),
                request_id
            );
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    "Event queue full for request {}, dropping {:?}",
                    request_id,
                    event.kind()
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Engine produced data for the peer
    pub fn on_transmit(&self, request_id: i64, data: &[u8]) -> bool {
        match String::from_utf8(data.to_vec()) {
            Ok(data) => self.post(request_id, CredentialEvent::Transmit(data)),
            Err(_) => {
                warn!("Transmit data for request {} is not UTF-8", request_id);
                false
            }
        }
    }

    /// Engine asks for request parameters.
    ///
    /// PIN requests are answered here when a PIN is registered for the
    /// request. Anything else is queued as an `OnRequest` event.
    pub fn on_request(&self, request_id: i64, operation_code: i32, params: &str) -> Option<String> {
        let pin_code = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.get(&request_id).and_then(|slot| slot.pin_code)
        };
        match pin_code {
            Some(pin) if operation_code == OP_PIN_AUTH => {
                debug!("Answering PIN request for {}", request_id);
                Some(
                    json!({
                        "confirmation": REQUEST_ACCEPTED,
                        "pinCode": pin.to_string(),
                    })
                    .to_string(),
                )
            }
            _ => {
                self.post(
                    request_id,
                    CredentialEvent::Request {
                        operation_code,
                        params: params.to_string(),
                    },
                );
                None
            }
        }
    }

    pub fn on_finish(&self, request_id: i64, operation_code: i32, data: &str) {
        self.post(
            request_id,
            CredentialEvent::Finish {
                operation_code,
                data: data.to_string(),
            },
        );
    }

    pub fn on_error(
        &self,
        request_id: i64,
        operation_code: i32,
        error_code: i32,
        error_return: &str,
    ) {
        info!(
            "Credential engine error {} for request {}: {}",
            error_code, request_id, error_return
        );
        self.post(
            request_id,
            CredentialEvent::Error {
                operation_code,
                error_code,
            },
        );
    }

    pub fn on_session_key_returned(&self, request_id: i64, key: &[u8]) {
        self.post(request_id, CredentialEvent::SessionKeyReturned(key.to_vec()));
    }

    fn register(&self, request_id: i64, capacity: usize, wait_timeout: Duration) -> EventReceiver {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(request_id, RequestSlot { tx, pin_code: None });
        EventReceiver {
            request_id,
            rx,
            wait_timeout,
        }
    }

    fn unregister(&self, request_id: i64) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(&request_id);
    }

    fn set_pin_code(&self, request_id: i64, pin_code: Option<u32>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(&request_id) {
            slot.pin_code = pin_code;
        }
    }

    /// Whether events for the request are still accepted
    pub fn is_registered(&self, request_id: i64) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.contains_key(&request_id)
    }
}

/// Receiving end of one request's event queue
pub struct EventReceiver {
    request_id: i64,
    rx: mpsc::Receiver<CredentialEvent>,
    wait_timeout: Duration,
}

impl EventReceiver {
    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Wait for the next engine event.
    ///
    /// Never blocks longer than the configured bound; a timeout or a closed
    /// queue is reported as an `OnError` event.
    pub async fn wait_expect_event(&mut self) -> CredentialEvent {
        match tokio::time::timeout(self.wait_timeout, self.rx.recv()).await {
            Ok(Some(event)) => {
                debug!("Request {} got {:?}", self.request_id, event.kind());
                event
            }
            Ok(None) => CredentialEvent::Error {
                operation_code: 0,
                error_code: ERR_EVENT_QUEUE_CLOSED,
            },
            Err(_) => {
                warn!("Request {} timed out waiting for engine", self.request_id);
                CredentialEvent::Error {
                    operation_code: 0,
                    error_code: ERR_WAIT_EVENT_TIMEOUT,
                }
            }
        }
    }

    /// Discard events left over from an abandoned attempt
    pub fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Credential engine plus the callback router feeding the state machine
pub struct CredentialConnector {
    engine: Arc<dyn CredentialEngine>,
    callbacks: CredentialCallbacks,
}

impl CredentialConnector {
    pub fn new(engine: Arc<dyn CredentialEngine>, callbacks: CredentialCallbacks) -> Self {
        Self { engine, callbacks }
    }

    pub fn callbacks(&self) -> &CredentialCallbacks {
        &self.callbacks
    }

    /// Open the event queue for a request
    pub fn register(&self, request_id: i64, config: &AuthConfig) -> EventReceiver {
        self.callbacks.register(
            request_id,
            config.event_queue_capacity,
            config.wait_event_timeout(),
        )
    }

    /// Close the event queue; later events for the request are dropped
    pub fn unregister(&self, request_id: i64) {
        self.callbacks.unregister(request_id);
    }

    /// PIN handed to the engine when it asks during this request
    pub fn set_pin_code(&self, request_id: i64, pin_code: Option<u32>) {
        self.callbacks.set_pin_code(request_id, pin_code);
    }

    pub fn auth_credential_pin_code(
        &self,
        request_id: i64,
        os_account_id: i32,
        udid: &str,
        pin_code: u32,
    ) -> DmResult<()> {
        self.callbacks.set_pin_code(request_id, Some(pin_code));
        self.engine
            .auth_credential_pin_code(request_id, os_account_id, udid, pin_code)
            .inspect_err(|e| warn!("AuthCredentialPinCode failed for {}: {}", request_id, e))
    }

    pub fn process_cred_data(&self, request_id: i64, data: &str) -> DmResult<()> {
        self.engine
            .process_cred_data(request_id, data)
            .inspect_err(|e| warn!("ProcessCredData failed for {}: {}", request_id, e))
    }

    pub fn generate_credential(
        &self,
        os_account_id: i32,
        udid: &str,
        peer_udid: &str,
    ) -> DmResult<String> {
        self.engine.generate_credential(os_account_id, udid, peer_udid)
    }

    pub fn import_credential(&self, os_account_id: i32, credential: &str) -> DmResult<String> {
        if credential.is_empty() {
            return Err(DmError::InputParaInvalid);
        }
        self.engine.import_credential(os_account_id, credential)
    }

    pub fn delete_credential(&self, os_account_id: i32, credential_id: &str) -> DmResult<()> {
        self.engine.delete_credential(os_account_id, credential_id)
    }

    pub fn query_credential(&self, os_account_id: i32, peer_udid: &str) -> DmResult<bool> {
        self.engine.query_credential(os_account_id, peer_udid)
    }

    pub fn get_credential(&self, os_account_id: i32, credential_id: &str) -> DmResult<String> {
        self.engine.get_credential(os_account_id, credential_id)
    }
}
