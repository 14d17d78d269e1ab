//! Access-control entries and device identities
//!
//! An ACL entry records that a local (app, account, device) subject trusts a
//! remote one, at which bind level and for how long.

use chrono::{DateTime, Utc};
use peerbind_core::{AuthType, BindLevel};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an ACL entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AclId(pub Uuid);

impl AclId {
    /// Generate a new random entry ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID string
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for AclId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AclId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of this device, fixed at process start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDevice {
    /// Unique device identifier
    pub udid: String,
    /// Foreground OS account
    pub user_id: i32,
    /// Signed-in account, empty when signed out
    pub account_id: String,
    /// Access token of the device manager service
    pub token_id: u64,
}

impl LocalDevice {
    pub fn new(udid: impl Into<String>) -> Self {
        Self {
            udid: udid.into(),
            user_id: 100,
            account_id: String::new(),
            token_id: 0,
        }
    }

    /// Builder pattern: set the signed-in account
    pub fn with_account(mut self, user_id: i32, account_id: impl Into<String>) -> Self {
        self.user_id = user_id;
        self.account_id = account_id.into();
        self
    }

    /// Builder pattern: set the token id
    pub fn with_token_id(mut self, token_id: u64) -> Self {
        self.token_id = token_id;
        self
    }
}

/// Privileges of the process calling into the manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallerInfo {
    /// System service callers may bind at device level
    pub is_system_sa: bool,
    pub token_id: u64,
}

impl CallerInfo {
    pub fn system_sa() -> Self {
        Self {
            is_system_sa: true,
            token_id: 0,
        }
    }
}

/// One side of a trust relationship
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessSubject {
    pub udid: String,
    pub user_id: i32,
    pub account_id: String,
    pub token_id: u64,
    pub bundle_name: String,
}

/// How long an ACL entry stays valid
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclLifetime {
    /// Survives the session ("allow always")
    Permanent,
    /// Dropped when the session ends ("allow once")
    #[default]
    Session,
}

impl std::str::FromStr for AclLifetime {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "permanent" | "always" => Ok(Self::Permanent),
            _ => Ok(Self::Session),
        }
    }
}

/// A persisted trust relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessControlEntry {
    /// Unique entry identifier
    pub id: AclId,
    pub local: AccessSubject,
    pub remote: AccessSubject,
    pub bind_level: BindLevel,
    pub auth_type: AuthType,
    pub lifetime: AclLifetime,
    pub is_identical_account: bool,
    /// Credential created for this relationship, if any
    #[serde(default)]
    pub credential_id: Option<String>,
    /// When the relationship was established
    pub created_at: DateTime<Utc>,
    /// Last time the relationship was used
    pub last_seen: DateTime<Utc>,
}

impl AccessControlEntry {
    pub fn new(
        local: AccessSubject,
        remote: AccessSubject,
        bind_level: BindLevel,
        auth_type: AuthType,
        lifetime: AclLifetime,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AclId::new(),
            local,
            remote,
            bind_level,
            auth_type,
            lifetime,
            is_identical_account: false,
            credential_id: None,
            created_at: now,
            last_seen: now,
        }
    }

    /// Update the last seen timestamp
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Whether this entry links the two devices
    pub fn links(&self, local_udid: &str, peer_udid: &str) -> bool {
        self.local.udid == local_udid && self.remote.udid == peer_udid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(udid: &str) -> AccessSubject {
        AccessSubject {
            udid: udid.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_acl_id_generation() {
        let id1 = AclId::new();
        let id2 = AclId::new();
        assert_ne!(id1, id2);
        assert_eq!(AclId::parse(&id1.to_string()).unwrap(), id1);
    }

    #[test]
    fn test_entry_links() {
        let entry = AccessControlEntry::new(
            subject("local"),
            subject("peer"),
            BindLevel::App,
            AuthType::Pin,
            AclLifetime::Permanent,
        );
        assert!(entry.links("local", "peer"));
        assert!(!entry.links("peer", "local"));
        assert_eq!(entry.created_at, entry.last_seen);
    }

    #[test]
    fn test_lifetime_parsing() {
        assert_eq!(
            "always".parse::<AclLifetime>().unwrap(),
            AclLifetime::Permanent
        );
        assert_eq!("once".parse::<AclLifetime>().unwrap(), AclLifetime::Session);
    }
}
