//! Protocol enums shared by the manager, the codec and the collaborators

use serde::{Deserialize, Serialize};

/// Mechanism used to establish trust with a peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    /// PIN shown on the sink and typed on the source
    Pin,
    /// Six-digit code imported on both devices ahead of time
    ImportAuthCode,
    /// Both devices are signed into the same account
    IdenticalAccount,
    /// An existing credential is reused
    Credential,
    /// Code exchanged over NFC
    Nfc,
    #[default]
    Unknown,
}

impl AuthType {
    pub fn as_i32(&self) -> i32 {
        match self {
            AuthType::Pin => 1,
            AuthType::Nfc => 3,
            AuthType::ImportAuthCode => 5,
            AuthType::IdenticalAccount => 6,
            AuthType::Credential => 7,
            AuthType::Unknown => -1,
        }
    }

    /// Whether the bind needs a PIN-style credential exchange
    pub fn uses_pin_code(&self) -> bool {
        matches!(self, AuthType::Pin | AuthType::ImportAuthCode | AuthType::Nfc)
    }
}

impl From<i32> for AuthType {
    fn from(value: i32) -> Self {
        match value {
            1 => AuthType::Pin,
            3 => AuthType::Nfc,
            5 => AuthType::ImportAuthCode,
            6 => AuthType::IdenticalAccount,
            7 => AuthType::Credential,
            _ => AuthType::Unknown,
        }
    }
}

impl std::str::FromStr for AuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pin" => Ok(AuthType::Pin),
            "import" | "import-auth-code" | "auth-code" => Ok(AuthType::ImportAuthCode),
            "account" | "identical-account" => Ok(AuthType::IdenticalAccount),
            "credential" => Ok(AuthType::Credential),
            "nfc" => Ok(AuthType::Nfc),
            _ => Err(format!(
                "Invalid auth type: {}. Use: pin, import, account, credential, nfc",
                s
            )),
        }
    }
}

/// Scope of a trust relationship
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindLevel {
    #[default]
    Invalid,
    Device,
    Service,
    App,
}

impl BindLevel {
    pub fn as_i32(&self) -> i32 {
        match self {
            BindLevel::Invalid => 0,
            BindLevel::Device => 1,
            BindLevel::Service => 2,
            BindLevel::App => 3,
        }
    }

    /// Parse a wire value, `None` when out of range
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(BindLevel::Device),
            2 => Some(BindLevel::Service),
            3 => Some(BindLevel::App),
            _ => None,
        }
    }
}

/// Decision produced by the user prompt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserAction {
    /// Allow this bind once
    AllowAuth,
    /// Allow and remember the peer
    AllowAuthAlways,
    Reject,
    Cancel,
    /// Confirmation dialog timed out
    ConfirmTimeout,
    /// PIN display dismissed on the sink
    CancelPinDisplay,
    /// PIN input dismissed on the source
    CancelPinInput,
    /// PIN typed on the source; the PIN travels as the operation parameter
    PinInputDone,
    #[default]
    None,
}

impl UserAction {
    pub fn as_i32(&self) -> i32 {
        match self {
            UserAction::AllowAuth => 0,
            UserAction::Cancel => 1,
            UserAction::ConfirmTimeout => 2,
            UserAction::CancelPinDisplay => 3,
            UserAction::CancelPinInput => 4,
            UserAction::PinInputDone => 5,
            UserAction::AllowAuthAlways => 6,
            UserAction::Reject => 7,
            UserAction::None => -1,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, UserAction::AllowAuth | UserAction::AllowAuthAlways)
    }
}

impl From<i32> for UserAction {
    fn from(value: i32) -> Self {
        match value {
            0 => UserAction::AllowAuth,
            1 => UserAction::Cancel,
            2 => UserAction::ConfirmTimeout,
            3 => UserAction::CancelPinDisplay,
            4 => UserAction::CancelPinInput,
            5 => UserAction::PinInputDone,
            6 => UserAction::AllowAuthAlways,
            7 => UserAction::Reject,
            _ => UserAction::None,
        }
    }
}

/// Role a device plays in one handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthRole {
    /// Initiator
    Source,
    /// Responder
    Sink,
}

impl std::fmt::Display for AuthRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthRole::Source => f.write_str("source"),
            AuthRole::Sink => f.write_str("sink"),
        }
    }
}

/// Which end of a transport session this device holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionSide {
    /// We opened the session
    Client,
    /// The peer opened the session
    Server,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_type_parsing() {
        assert_eq!("pin".parse::<AuthType>().unwrap(), AuthType::Pin);
        assert_eq!(
            "import".parse::<AuthType>().unwrap(),
            AuthType::ImportAuthCode
        );
        assert!("qr".parse::<AuthType>().is_err());
        assert_eq!(AuthType::from(AuthType::Nfc.as_i32()), AuthType::Nfc);
        assert_eq!(AuthType::from(42), AuthType::Unknown);
    }

    #[test]
    fn test_bind_level_range() {
        assert_eq!(BindLevel::from_i32(1), Some(BindLevel::Device));
        assert_eq!(BindLevel::from_i32(3), Some(BindLevel::App));
        assert_eq!(BindLevel::from_i32(0), None);
        assert_eq!(BindLevel::from_i32(4), None);
    }

    #[test]
    fn test_user_action_codes() {
        for action in [
            UserAction::AllowAuth,
            UserAction::AllowAuthAlways,
            UserAction::Reject,
            UserAction::PinInputDone,
        ] {
            assert_eq!(UserAction::from(action.as_i32()), action);
        }
        assert!(UserAction::AllowAuthAlways.is_allow());
        assert!(!UserAction::Cancel.is_allow());
    }
}
