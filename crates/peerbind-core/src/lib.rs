//! peerbind Core - Shared types and protocol definitions
//!
//! This crate provides the error codes, tunables and protocol enums used
//! across all peerbind components.

pub mod config;
pub mod error;
pub mod protocol;

pub use config::{AuthConfig, TimerName};
pub use error::{result_code, DmError, DmResult, DM_OK};
pub use protocol::{AuthRole, AuthType, BindLevel, SessionSide, UserAction};
