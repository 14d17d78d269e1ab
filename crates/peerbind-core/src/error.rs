//! Error types for peerbind
//!
//! Every variant carries a stable numeric result code. The codes travel in
//! finish messages and terminal callbacks, so they must not be renumbered.

use thiserror::Error;

/// Result code reported for a successful operation
pub const DM_OK: i32 = 0;

/// Main error type for authentication and trust operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmError {
    #[error("operation failed")]
    Failed,

    #[error("authentication timed out")]
    TimeOut,

    #[error("invalid input parameter")]
    InputParaInvalid,

    #[error("an authentication with this peer is already in progress")]
    AuthBusinessBusy,

    #[error("no authentication in progress")]
    AuthNotStart,

    #[error("authentication failed")]
    AuthFailed,

    #[error("bind stopped")]
    StopBind,

    #[error("bind cancelled by user")]
    BindUserCancel,

    #[error("bind rejected by peer")]
    BindPeerRejected,

    #[error("failed to open auth session")]
    AuthOpenSessionFailed,

    #[error("auth session closed")]
    SessionClosed,

    #[error("auth code incorrect or missing")]
    AuthCodeIncorrect,

    #[error("credential engine error: {0}")]
    CredentialEngine(i32),

    #[error("trust store error")]
    TrustStore,

    #[error("resource not found")]
    NotFound,
}

/// Result type alias using peerbind's error
pub type DmResult<T> = std::result::Result<T, DmError>;

const ERR_DM_FAILED: i32 = 96_929_744;
const ERR_DM_TIME_OUT: i32 = 96_929_745;
const ERR_DM_INPUT_PARA_INVALID: i32 = 96_929_749;
const ERR_DM_AUTH_BUSINESS_BUSY: i32 = 96_929_758;
const ERR_DM_AUTH_FAILED: i32 = 96_929_760;
const ERR_DM_AUTH_OPEN_SESSION_FAILED: i32 = 96_929_761;
const ERR_DM_SESSION_CLOSED: i32 = 96_929_762;
const ERR_DM_AUTH_NOT_START: i32 = 96_929_763;
const ERR_DM_CREDENTIAL_ENGINE: i32 = 96_929_770;
const ERR_DM_BIND_USER_CANCEL: i32 = 96_929_780;
const ERR_DM_BIND_PEER_REJECTED: i32 = 96_929_781;
const ERR_DM_AUTH_CODE_INCORRECT: i32 = 96_929_790;
const ERR_DM_TRUST_STORE: i32 = 96_929_795;
const ERR_DM_NOT_FOUND: i32 = 96_929_796;
const ERR_DM_STOP_BIND: i32 = 96_929_802;

impl DmError {
    /// Stable result code for this error
    pub fn code(&self) -> i32 {
        match self {
            DmError::Failed => ERR_DM_FAILED,
            DmError::TimeOut => ERR_DM_TIME_OUT,
            DmError::InputParaInvalid => ERR_DM_INPUT_PARA_INVALID,
            DmError::AuthBusinessBusy => ERR_DM_AUTH_BUSINESS_BUSY,
            DmError::AuthNotStart => ERR_DM_AUTH_NOT_START,
            DmError::AuthFailed => ERR_DM_AUTH_FAILED,
            DmError::StopBind => ERR_DM_STOP_BIND,
            DmError::BindUserCancel => ERR_DM_BIND_USER_CANCEL,
            DmError::BindPeerRejected => ERR_DM_BIND_PEER_REJECTED,
            DmError::AuthOpenSessionFailed => ERR_DM_AUTH_OPEN_SESSION_FAILED,
            DmError::SessionClosed => ERR_DM_SESSION_CLOSED,
            DmError::AuthCodeIncorrect => ERR_DM_AUTH_CODE_INCORRECT,
            DmError::CredentialEngine(_) => ERR_DM_CREDENTIAL_ENGINE,
            DmError::TrustStore => ERR_DM_TRUST_STORE,
            DmError::NotFound => ERR_DM_NOT_FOUND,
        }
    }

    /// Map a result code received from a peer back to an error.
    ///
    /// Unknown codes collapse to `Failed`. `DM_OK` has no error and yields `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            DM_OK => return None,
            ERR_DM_TIME_OUT => DmError::TimeOut,
            ERR_DM_INPUT_PARA_INVALID => DmError::InputParaInvalid,
            ERR_DM_AUTH_BUSINESS_BUSY => DmError::AuthBusinessBusy,
            ERR_DM_AUTH_NOT_START => DmError::AuthNotStart,
            ERR_DM_AUTH_FAILED => DmError::AuthFailed,
            ERR_DM_STOP_BIND => DmError::StopBind,
            ERR_DM_BIND_USER_CANCEL => DmError::BindUserCancel,
            ERR_DM_BIND_PEER_REJECTED => DmError::BindPeerRejected,
            ERR_DM_AUTH_OPEN_SESSION_FAILED => DmError::AuthOpenSessionFailed,
            ERR_DM_SESSION_CLOSED => DmError::SessionClosed,
            ERR_DM_AUTH_CODE_INCORRECT => DmError::AuthCodeIncorrect,
            ERR_DM_CREDENTIAL_ENGINE => DmError::CredentialEngine(0),
            ERR_DM_TRUST_STORE => DmError::TrustStore,
            ERR_DM_NOT_FOUND => DmError::NotFound,
            _ => DmError::Failed,
        };
        Some(err)
    }
}

/// Result code for an operation outcome, `DM_OK` on success
pub fn result_code(result: &DmResult<()>) -> i32 {
    match result {
        Ok(()) => DM_OK,
        Err(e) => e.code(),
    }
}
