//! Simulated PIN key agreement
//!
//! A small three-round exchange in the shape of a PAKE: both sides mix the
//! PIN into SHA-256 proofs over fresh nonces, so a wrong PIN is detected
//! by the initiator when it checks the responder's proof. It is a stand-in
//! for a real credential engine, not a secure protocol.
//!
//! Rounds, as relayed by the state machine:
//!
//! 1. client `start {nonceC}`
//! 2. server `challenge {nonceS, proofS}` (PIN fetched through `on_request`)
//! 3. client `confirm {proofC}`
//! 4. server `ack`, session key, finish; the client does the same on `ack`

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use peerbind_auth::{CredentialCallbacks, CredentialEngine, OP_PIN_AUTH};
use peerbind_core::{DmError, DmResult};
use rand::Rng;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// The responder has no PIN for the request
pub const ERR_NO_PIN: i32 = 0x1001;
/// A proof did not match, the PINs differ
pub const ERR_PIN_MISMATCH: i32 = 0x1002;
/// A message arrived for an exchange in the wrong round
pub const ERR_UNEXPECTED_STEP: i32 = 0x1003;

#[derive(Debug, Clone)]
enum Exchange {
    ClientStarted { pin: u32, nonce_c: String },
    ClientConfirmed { pin: u32, nonce_c: String, nonce_s: String },
    ServerChallenged { pin: u32, nonce_c: String, nonce_s: String },
}

/// Credential engine that runs entirely in memory
pub struct SimulatedCredentialEngine {
    callbacks: CredentialCallbacks,
    exchanges: Mutex<HashMap<i64, Exchange>>,
    /// Credential id to peer udid
    credentials: Mutex<HashMap<String, String>>,
}

fn nonce() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    BASE64.encode(bytes)
}

fn proof(label: &str, pin: u32, nonce_c: &str, nonce_s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(label.as_bytes());
    hasher.update(pin.to_string().as_bytes());
    hasher.update(nonce_c.as_bytes());
    hasher.update(nonce_s.as_bytes());
    BASE64.encode(hasher.finalize())
}

fn session_key(pin: u32, nonce_c: &str, nonce_s: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"session-key");
    hasher.update(pin.to_string().as_bytes());
    hasher.update(nonce_c.as_bytes());
    hasher.update(nonce_s.as_bytes());
    hasher.finalize().to_vec()
}

fn field<'a>(value: &'a Value, name: &str) -> Option<&'a str> {
    value.get(name).and_then(Value::as_str)
}

impl SimulatedCredentialEngine {
    pub fn new(callbacks: CredentialCallbacks) -> Self {
        Self {
            callbacks,
            exchanges: Mutex::new(HashMap::new()),
            credentials: Mutex::new(HashMap::new()),
        }
    }

    pub fn credential_count(&self) -> usize {
        let credentials = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
        credentials.len()
    }

    fn set_exchange(&self, request_id: i64, exchange: Option<Exchange>) -> Option<Exchange> {
        let mut exchanges = self.exchanges.lock().unwrap_or_else(|e| e.into_inner());
        match exchange {
            Some(exchange) => exchanges.insert(request_id, exchange),
            None => exchanges.remove(&request_id),
        }
    }

    fn fail(&self, request_id: i64, error_code: i32, reason: &str) {
        self.set_exchange(request_id, None);
        self.callbacks
            .on_error(request_id, OP_PIN_AUTH, error_code, reason);
    }

    fn transmit(&self, request_id: i64, payload: Value) {
        self.callbacks
            .on_transmit(request_id, payload.to_string().as_bytes());
    }

    fn complete(&self, request_id: i64, pin: u32, nonce_c: &str, nonce_s: &str) {
        self.set_exchange(request_id, None);
        let key = session_key(pin, nonce_c, nonce_s);
        self.callbacks.on_session_key_returned(request_id, &key);
        self.callbacks
            .on_finish(request_id, OP_PIN_AUTH, &json!({"keyLen": key.len()}).to_string());
        info!("Key agreement for request {} complete", request_id);
    }

    /// Responder: first round
    fn on_start(&self, request_id: i64, msg: &Value) {
        let Some(nonce_c) = field(msg, "nonceC") else {
            return self.fail(request_id, ERR_UNEXPECTED_STEP, "start without nonce");
        };
        let pin = self
            .callbacks
            .on_request(request_id, OP_PIN_AUTH, "{}")
            .and_then(|reply| serde_json::from_str::<Value>(&reply).ok())
            .and_then(|reply| field(&reply, "pinCode").and_then(|p| p.parse::<u32>().ok()));
        let Some(pin) = pin else {
            return self.fail(request_id, ERR_NO_PIN, "no pin registered");
        };
        let nonce_s = nonce();
        let proof_s = proof("server", pin, nonce_c, &nonce_s);
        self.set_exchange(
            request_id,
            Some(Exchange::ServerChallenged {
                pin,
                nonce_c: nonce_c.to_string(),
                nonce_s: nonce_s.clone(),
            }),
        );
        self.transmit(
            request_id,
            json!({"step": "challenge", "nonceS": nonce_s, "proofS": proof_s}),
        );
    }

    /// Initiator: check the responder knows the PIN, prove we do
    fn on_challenge(&self, request_id: i64, msg: &Value) {
        let Some(Exchange::ClientStarted { pin, nonce_c }) = self.set_exchange(request_id, None)
        else {
            return self.fail(request_id, ERR_UNEXPECTED_STEP, "challenge out of order");
        };
        let (Some(nonce_s), Some(proof_s)) = (field(msg, "nonceS"), field(msg, "proofS")) else {
            return self.fail(request_id, ERR_UNEXPECTED_STEP, "malformed challenge");
        };
        if proof("server", pin, &nonce_c, nonce_s) != proof_s {
            warn!("PIN mismatch for request {}", request_id);
            return self.fail(request_id, ERR_PIN_MISMATCH, "server proof mismatch");
        }
        let proof_c = proof("client", pin, &nonce_c, nonce_s);
        self.set_exchange(
            request_id,
            Some(Exchange::ClientConfirmed {
                pin,
                nonce_c,
                nonce_s: nonce_s.to_string(),
            }),
        );
        self.transmit(request_id, json!({"step": "confirm", "proofC": proof_c}));
    }

    /// Responder: verify the initiator and finish
    fn on_confirm(&self, request_id: i64, msg: &Value) {
        let Some(Exchange::ServerChallenged {
            pin,
            nonce_c,
            nonce_s,
        }) = self.set_exchange(request_id, None)
        else {
            return self.fail(request_id, ERR_UNEXPECTED_STEP, "confirm out of order");
        };
        if field(msg, "proofC") != Some(proof("client", pin, &nonce_c, &nonce_s).as_str()) {
            warn!("Client proof mismatch for request {}", request_id);
            return self.fail(request_id, ERR_PIN_MISMATCH, "client proof mismatch");
        }
        self.transmit(request_id, json!({"step": "ack"}));
        self.complete(request_id, pin, &nonce_c, &nonce_s);
    }

    /// Initiator: final round
    fn on_ack(&self, request_id: i64) {
        match self.set_exchange(request_id, None) {
            Some(Exchange::ClientConfirmed {
                pin,
                nonce_c,
                nonce_s,
            }) => self.complete(request_id, pin, &nonce_c, &nonce_s),
            _ => self.fail(request_id, ERR_UNEXPECTED_STEP, "ack out of order"),
        }
    }
}

impl CredentialEngine for SimulatedCredentialEngine {
    fn auth_credential_pin_code(
        &self,
        request_id: i64,
        _os_account_id: i32,
        udid: &str,
        pin_code: u32,
    ) -> DmResult<()> {
        debug!("Starting key agreement with {} for request {}", udid, request_id);
        let nonce_c = nonce();
        self.set_exchange(
            request_id,
            Some(Exchange::ClientStarted {
                pin: pin_code,
                nonce_c: nonce_c.clone(),
            }),
        );
        self.transmit(request_id, json!({"step": "start", "nonceC": nonce_c}));
        Ok(())
    }

    fn process_cred_data(&self, request_id: i64, data: &str) -> DmResult<()> {
        let msg: Value = serde_json::from_str(data).map_err(|e| {
            warn!("Credential data for request {} is not JSON: {}", request_id, e);
            DmError::CredentialEngine(ERR_UNEXPECTED_STEP)
        })?;
        match field(&msg, "step") {
            Some("start") => self.on_start(request_id, &msg),
            Some("challenge") => self.on_challenge(request_id, &msg),
            Some("confirm") => self.on_confirm(request_id, &msg),
            Some("ack") => self.on_ack(request_id),
            other => {
                warn!("Unknown step {:?} for request {}", other, request_id);
                return Err(DmError::CredentialEngine(ERR_UNEXPECTED_STEP));
            }
        }
        Ok(())
    }

    fn generate_credential(
        &self,
        _os_account_id: i32,
        udid: &str,
        peer_udid: &str,
    ) -> DmResult<String> {
        let id = format!("{}:{}:{}", udid, peer_udid, nonce());
        let mut credentials = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
        credentials.insert(id.clone(), peer_udid.to_string());
        Ok(id)
    }

    fn import_credential(&self, _os_account_id: i32, credential: &str) -> DmResult<String> {
        let value: Value =
            serde_json::from_str(credential).map_err(|_| DmError::InputParaInvalid)?;
        let peer = field(&value, "peerUdid").ok_or(DmError::InputParaInvalid)?;
        let id = format!("imported:{}:{}", peer, nonce());
        let mut credentials = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
        credentials.insert(id.clone(), peer.to_string());
        Ok(id)
    }

    fn delete_credential(&self, _os_account_id: i32, credential_id: &str) -> DmResult<()> {
        let mut credentials = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
        credentials
            .remove(credential_id)
            .map(|_| ())
            .ok_or(DmError::NotFound)
    }

    fn query_credential(&self, _os_account_id: i32, peer_udid: &str) -> DmResult<bool> {
        let credentials = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
        Ok(credentials.values().any(|p| p == peer_udid))
    }

    fn get_credential(&self, _os_account_id: i32, credential_id: &str) -> DmResult<String> {
        let credentials = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
        let peer = credentials.get(credential_id).ok_or(DmError::NotFound)?;
        Ok(json!({"credentialId": credential_id, "peerUdid": peer}).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerbind_auth::{CredentialConnector, CredentialEvent};
    use peerbind_core::AuthConfig;
    use std::sync::Arc;
    use std::time::Duration;

    struct Side {
        connector: CredentialConnector,
        engine: Arc<SimulatedCredentialEngine>,
    }

    fn side() -> Side {
        let callbacks = CredentialCallbacks::new();
        let engine = Arc::new(SimulatedCredentialEngine::new(callbacks.clone()));
        Side {
            connector: CredentialConnector::new(engine.clone(), callbacks),
            engine,
        }
    }

    fn config() -> AuthConfig {
        AuthConfig::new().with_wait_event_timeout(Duration::from_millis(100))
    }

    async fn transmitted(events: &mut peerbind_auth::EventReceiver) -> String {
        match events.wait_expect_event().await {
            CredentialEvent::Transmit(data) => data,
            other => panic!("expected transmit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_matching_pins_agree_on_key() {
        let (client, server) = (side(), side());
        let mut client_events = client.connector.register(1, &config());
        let mut server_events = server.connector.register(1, &config());
        server.connector.set_pin_code(1, Some(123456));

        client
            .connector
            .auth_credential_pin_code(1, 100, "server", 123456)
            .unwrap();
        let start = transmitted(&mut client_events).await;
        server.connector.process_cred_data(1, &start).unwrap();
        let challenge = transmitted(&mut server_events).await;
        client.connector.process_cred_data(1, &challenge).unwrap();
        let confirm = transmitted(&mut client_events).await;
        server.connector.process_cred_data(1, &confirm).unwrap();
        let ack = transmitted(&mut server_events).await;
        client.connector.process_cred_data(1, &ack).unwrap();

        let CredentialEvent::SessionKeyReturned(server_key) =
            server_events.wait_expect_event().await
        else {
            panic!("server key missing");
        };
        let CredentialEvent::SessionKeyReturned(client_key) =
            client_events.wait_expect_event().await
        else {
            panic!("client key missing");
        };
        assert_eq!(server_key, client_key);
        assert!(matches!(
            client_events.wait_expect_event().await,
            CredentialEvent::Finish { .. }
        ));
    }

    #[tokio::test]
    async fn test_wrong_pin_detected_by_initiator() {
        let (client, server) = (side(), side());
        let mut client_events = client.connector.register(2, &config());
        let mut server_events = server.connector.register(2, &config());
        server.connector.set_pin_code(2, Some(654321));

        client
            .connector
            .auth_credential_pin_code(2, 100, "server", 111111)
            .unwrap();
        let start = transmitted(&mut client_events).await;
        server.connector.process_cred_data(2, &start).unwrap();
        let challenge = transmitted(&mut server_events).await;
        client.connector.process_cred_data(2, &challenge).unwrap();

        assert_eq!(
            client_events.wait_expect_event().await,
            CredentialEvent::Error {
                operation_code: OP_PIN_AUTH,
                error_code: ERR_PIN_MISMATCH,
            }
        );
    }

    #[tokio::test]
    async fn test_responder_without_pin_errors() {
        let server = side();
        let mut events = server.connector.register(3, &config());
        server
            .connector
            .process_cred_data(3, r#"{"step":"start","nonceC":"abc"}"#)
            .unwrap();
        // The unanswered PIN request is queued ahead of the failure
        assert!(matches!(
            events.wait_expect_event().await,
            CredentialEvent::Request {
                operation_code: OP_PIN_AUTH,
                ..
            }
        ));
        assert!(matches!(
            events.wait_expect_event().await,
            CredentialEvent::Error {
                error_code: ERR_NO_PIN,
                ..
            }
        ));
        assert!(server.connector.process_cred_data(3, "nope").is_err());
    }

    #[test]
    fn test_credential_bookkeeping() {
        let engine = SimulatedCredentialEngine::new(CredentialCallbacks::new());
        assert_eq!(engine.query_credential(100, "peer"), Ok(false));

        let id = engine.generate_credential(100, "local", "peer").unwrap();
        assert_eq!(engine.query_credential(100, "peer"), Ok(true));
        assert!(engine.get_credential(100, &id).unwrap().contains("peer"));

        engine.delete_credential(100, &id).unwrap();
        assert_eq!(engine.query_credential(100, "peer"), Ok(false));
        assert_eq!(engine.delete_credential(100, &id), Err(DmError::NotFound));

        let imported = engine
            .import_credential(100, r#"{"peerUdid":"other"}"#)
            .unwrap();
        assert!(imported.starts_with("imported:"));
        assert_eq!(engine.credential_count(), 1);
    }
}
