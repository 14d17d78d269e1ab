#![allow(dead_code)]

use peerbind_auth::{AuthEvent, AuthResult, LocalDevice};
use peerbind_core::AuthConfig;
use peerbind_loopback::{
    wait_for_result, LoopbackNetwork, PinBoard, ScriptedPrompt, SimulatedDevice,
};
use std::time::Duration;
use tokio::sync::broadcast;

pub const PKG: &str = "com.example.app";
pub const RESULT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn config() -> AuthConfig {
    AuthConfig::new()
        .with_authenticate_timeout(Duration::from_secs(5))
        .with_negotiate_timeout(Duration::from_millis(300))
        .with_confirm_timeout(Duration::from_secs(2))
        .with_input_timeout(Duration::from_secs(2))
        .with_pin_auth_timeout(Duration::from_secs(2))
        .with_wait_event_timeout(Duration::from_secs(1))
}

pub fn local(udid: &str, account: &str, token_id: u64) -> LocalDevice {
    LocalDevice::new(udid)
        .with_account(100, account)
        .with_token_id(token_id)
}

/// A device together with a subscription taken before any bind starts
pub struct Peer {
    pub device: SimulatedDevice,
    pub events: broadcast::Receiver<AuthEvent>,
}

impl Peer {
    pub fn spawn(network: &LoopbackNetwork, local: LocalDevice, prompt: ScriptedPrompt) -> Self {
        let device = SimulatedDevice::spawn(network, local, config(), prompt);
        let events = device.subscribe();
        Self { device, events }
    }

    pub async fn result(&mut self, request_id: i64) -> AuthResult {
        match wait_for_result(&mut self.events, request_id, RESULT_TIMEOUT).await {
            Some(result) => result,
            None => panic!(
                "{} got no result for request {}",
                self.device.udid(),
                request_id
            ),
        }
    }
}

/// Source "dev-a" and sink "dev-b" on a fresh network, sharing one PIN board
pub fn pair(
    source_prompt: impl FnOnce(PinBoard) -> ScriptedPrompt,
    sink_prompt: impl FnOnce(PinBoard) -> ScriptedPrompt,
) -> (LoopbackNetwork, Peer, Peer) {
    let network = LoopbackNetwork::new();
    let board = PinBoard::new();
    let a = Peer::spawn(&network, local("dev-a", "alice", 11), source_prompt(board.clone()));
    let b = Peer::spawn(&network, local("dev-b", "bob", 22), sink_prompt(board));
    (network, a, b)
}

pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RESULT_TIMEOUT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
