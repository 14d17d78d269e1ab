//! peerbind Auth - Device trust establishment and access control
//!
//! Runs the PIN handshake that binds two devices, persists the resulting
//! access control entries and propagates trust changes to peers.
//!
//! # Bind Flow
//!
//! 1. The source calls `AuthManager::authenticate_device()` and opens a session
//! 2. Both sides exchange identities (`ReqAclNegotiate` / `RespAclNegotiate`)
//! 3. The sink user confirms, a PIN is shown on the sink and typed on the source
//! 4. The credential engine runs its key agreement over relayed messages
//! 5. Both sides write an ACL entry and report one `AuthResult`
//!
//! # Example
//!
//! ```no_run
//! use peerbind_auth::{AuthDeps, AuthManager, LocalDevice};
//! use peerbind_core::{AuthConfig, AuthType};
//!
//! fn example(deps: AuthDeps) {
//!     let manager = AuthManager::new(LocalDevice::new("my-udid"), AuthConfig::new(), deps);
//!     let request_id = manager
//!         .authenticate_device("com.example.app", AuthType::Pin, "peer-udid", "")
//!         .unwrap();
//!     println!("Binding as request {}", request_id);
//! }
//! ```

pub mod acl;
pub mod context;
pub mod credential;
pub mod listener;
pub mod manager;
pub mod message;
pub mod pin;
pub mod prompt;
pub mod relationship;
pub mod session;
pub mod state;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod testing;

pub use acl::{AccessControlEntry, AccessSubject, AclId, AclLifetime, CallerInfo, LocalDevice};
pub use context::{AuthContext, Lifecycle};
pub use credential::{
    CredentialCallbacks, CredentialConnector, CredentialEngine, CredentialEvent, EventReceiver,
    OP_PIN_AUTH, REQUEST_ACCEPTED,
};
pub use listener::{AuthEvent, AuthListener, AuthResult, BroadcastListener, UiState};
pub use manager::{AuthDeps, AuthManager};
pub use message::{decode, encode, AuthMessage, ConfirmRequest, DecodeError, NegotiateInfo};
pub use prompt::{ConfirmParams, PromptReply, UserPrompt};
pub use relationship::{RelationShipChangeMsg, RelationShipChangeType, UserIdInfo};
pub use session::{AuthSession, SessionInput};
pub use state::{ActionOutcome, DmAuthState, FinishDecision, Transition};
pub use storage::{JsonTrustStore, StorageError, StorageResult, TrustStore};
pub use transport::{Outbox, SessionTransport};
