//! Trust-relationship change notifications
//!
//! Produced once per completed unbind or logout and handed to the trust
//! store, which broadcasts the payload to the affected peers.

use peerbind_core::{DmError, DmResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

const TAG_TYPE: &str = "TYPE";
const TAG_VALUE: &str = "VALUE";
const TAG_PEER_UDIDS: &str = "PEERUDIDS";

/// Kind of relationship change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationShipChangeType {
    AccountLogout,
    DeviceUnbind,
    AppUnbind,
    ServiceUnbind,
    DelUser,
    AppUninstall,
}

impl RelationShipChangeType {
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::AccountLogout => 0,
            Self::DeviceUnbind => 1,
            Self::AppUnbind => 2,
            Self::ServiceUnbind => 3,
            Self::DelUser => 4,
            Self::AppUninstall => 5,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::AccountLogout),
            1 => Some(Self::DeviceUnbind),
            2 => Some(Self::AppUnbind),
            3 => Some(Self::ServiceUnbind),
            4 => Some(Self::DelUser),
            5 => Some(Self::AppUninstall),
            _ => None,
        }
    }
}

/// Foreground/background state of one OS account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdInfo {
    pub is_foreground: bool,
    pub user_id: i32,
}

/// A relationship change to replicate to peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationShipChangeMsg {
    pub change_type: RelationShipChangeType,
    pub user_id: i32,
    pub account_id: String,
    pub token_id: u64,
    pub peer_udids: Vec<String>,
    pub user_id_infos: Vec<UserIdInfo>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeValue {
    #[serde(default)]
    user_id: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    account_id: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    token_id: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    user_id_infos: Vec<UserIdInfo>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl RelationShipChangeMsg {
    pub fn new(change_type: RelationShipChangeType, user_id: i32) -> Self {
        Self {
            change_type,
            user_id,
            account_id: String::new(),
            token_id: 0,
            peer_udids: Vec::new(),
            user_id_infos: Vec::new(),
        }
    }

    /// Check that the fields required by the change type are present
    pub fn is_valid(&self) -> bool {
        match self.change_type {
            RelationShipChangeType::AccountLogout => !self.account_id.is_empty(),
            RelationShipChangeType::DeviceUnbind => !self.peer_udids.is_empty(),
            RelationShipChangeType::AppUnbind
            | RelationShipChangeType::ServiceUnbind
            | RelationShipChangeType::AppUninstall => {
                !self.peer_udids.is_empty() && self.token_id != 0
            }
            RelationShipChangeType::DelUser => !self.user_id_infos.is_empty() || self.user_id != 0,
        }
    }

    /// Serialize to the broadcast payload
    pub fn to_broadcast_payload(&self) -> DmResult<String> {
        if !self.is_valid() {
            warn!("Refusing to serialize invalid {:?} change", self.change_type);
            return Err(DmError::InputParaInvalid);
        }
        let value = ChangeValue {
            user_id: self.user_id,
            account_id: self.account_id.clone(),
            token_id: self.token_id,
            user_id_infos: self.user_id_infos.clone(),
        };
        let payload = json!({
            TAG_TYPE: self.change_type.as_i32(),
            TAG_VALUE: value,
            TAG_PEER_UDIDS: self.peer_udids,
        });
        Ok(payload.to_string())
    }

    /// Parse a broadcast payload received from a peer
    pub fn from_broadcast_payload(payload: &str) -> DmResult<Self> {
        let root: Value = serde_json::from_str(payload).map_err(|e| {
            warn!("Relationship payload is not JSON: {}", e);
            DmError::InputParaInvalid
        })?;
        let change_type = root
            .get(TAG_TYPE)
            .and_then(Value::as_i64)
            .and_then(|t| RelationShipChangeType::from_i32(t as i32))
            .ok_or(DmError::InputParaInvalid)?;
        let value: ChangeValue = match root.get(TAG_VALUE) {
            Some(v) => {
                serde_json::from_value(v.clone()).map_err(|_| DmError::InputParaInvalid)?
            }
            None => ChangeValue::default(),
        };
        let peer_udids = match root.get(TAG_PEER_UDIDS) {
            Some(v) => {
                serde_json::from_value(v.clone()).map_err(|_| DmError::InputParaInvalid)?
            }
            None => Vec::new(),
        };
        let msg = Self {
            change_type,
            user_id: value.user_id,
            account_id: value.account_id,
            token_id: value.token_id,
            peer_udids,
            user_id_infos: value.user_id_infos,
        };
        if !msg.is_valid() {
            return Err(DmError::InputParaInvalid);
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_unbind_payload() {
        let mut msg = RelationShipChangeMsg::new(RelationShipChangeType::AppUnbind, 100);
        msg.token_id = 42;
        msg.peer_udids = vec!["peer-a".to_string()];

        let payload = msg.to_broadcast_payload().unwrap();
        let root: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(root["TYPE"], 2);
        assert_eq!(root["PEERUDIDS"][0], "peer-a");

        let parsed = RelationShipChangeMsg::from_broadcast_payload(&payload).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_logout_requires_account() {
        let msg = RelationShipChangeMsg::new(RelationShipChangeType::AccountLogout, 100);
        assert_eq!(msg.to_broadcast_payload(), Err(DmError::InputParaInvalid));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let result = RelationShipChangeMsg::from_broadcast_payload(r#"{"TYPE": 9}"#);
        assert_eq!(result, Err(DmError::InputParaInvalid));
        assert!(RelationShipChangeMsg::from_broadcast_payload("[1,2").is_err());
    }
}
