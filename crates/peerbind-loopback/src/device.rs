//! A complete simulated device
//!
//! Wires an [`AuthManager`] to the loopback transport, the simulated
//! engine, a scripted prompt and a broadcast listener.

use crate::engine::SimulatedCredentialEngine;
use crate::network::LoopbackNetwork;
use crate::prompt::ScriptedPrompt;
use peerbind_auth::{
    AuthDeps, AuthEvent, AuthManager, AuthResult, BroadcastListener, CredentialCallbacks,
    CredentialConnector, JsonTrustStore, LocalDevice,
};
use peerbind_core::AuthConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

pub struct SimulatedDevice {
    pub manager: Arc<AuthManager>,
    pub store: Arc<JsonTrustStore>,
    pub engine: Arc<SimulatedCredentialEngine>,
    pub prompt: Arc<ScriptedPrompt>,
    pub listener: Arc<BroadcastListener>,
}

impl SimulatedDevice {
    /// Build a device with an in-memory trust store and attach it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        network: &LoopbackNetwork,
        local: LocalDevice,
        config: AuthConfig,
        prompt: ScriptedPrompt,
    ) -> Self {
        Self::spawn_with_store(network, local, config, prompt, JsonTrustStore::in_memory())
    }

    pub fn spawn_with_store(
        network: &LoopbackNetwork,
        local: LocalDevice,
        config: AuthConfig,
        prompt: ScriptedPrompt,
        store: JsonTrustStore,
    ) -> Self {
        let udid = local.udid.clone();
        let callbacks = CredentialCallbacks::new();
        let engine = Arc::new(SimulatedCredentialEngine::new(callbacks.clone()));
        let store = Arc::new(store);
        let prompt = Arc::new(prompt);
        let listener = Arc::new(BroadcastListener::default());
        let deps = AuthDeps {
            transport: network.transport(&udid),
            connector: Arc::new(CredentialConnector::new(engine.clone(), callbacks)),
            trust_store: store.clone(),
            prompt: prompt.clone(),
            listener: listener.clone(),
        };
        let manager = Arc::new(AuthManager::new(local, config, deps));
        network.attach(&udid, &manager);
        Self {
            manager,
            store,
            engine,
            prompt,
            listener,
        }
    }

    pub fn udid(&self) -> &str {
        &self.manager.local_device().udid
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.listener.subscribe()
    }
}

/// Wait for the terminal result of `request_id`, skipping other events
pub async fn wait_for_result(
    events: &mut broadcast::Receiver<AuthEvent>,
    request_id: i64,
    timeout: Duration,
) -> Option<AuthResult> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(AuthEvent::Result(result)) if result.request_id == request_id => {
                    return Some(result)
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Listener lagged by {} events", n)
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.ok().flatten()
}

/// Wait for the next terminal result of any request
pub async fn next_result(
    events: &mut broadcast::Receiver<AuthEvent>,
    timeout: Duration,
) -> Option<AuthResult> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(AuthEvent::Result(result)) => return Some(result),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.ok().flatten()
}
