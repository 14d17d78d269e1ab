//! peerbind Loopback - Simulated collaborators
//!
//! Runs whole bind handshakes inside one process: devices talk over an
//! in-memory network, a simulated engine performs the PIN key agreement
//! and scripted prompts play the users.

pub mod device;
pub mod engine;
pub mod network;
pub mod prompt;

pub use device::{next_result, wait_for_result, SimulatedDevice};
pub use engine::{SimulatedCredentialEngine, ERR_NO_PIN, ERR_PIN_MISMATCH, ERR_UNEXPECTED_STEP};
pub use network::{LoopbackNetwork, LoopbackTransport};
pub use prompt::{ConfirmPolicy, PinBoard, PinPolicy, ScriptedPrompt};
