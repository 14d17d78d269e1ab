//! Authentication protocol messages
//!
//! Messages travel as flat JSON objects. `MSG_TYPE` and `REQUEST_ID` are
//! required; every other field is optional on decode and falls back to a
//! default, so older peers that omit fields still interoperate.

use peerbind_core::{AuthType, BindLevel, UserAction, DM_OK};
use serde_json::{Map, Value};
use thiserror::Error;

pub const MSG_TYPE_REQ_ACL_NEGOTIATE: i32 = 80;
pub const MSG_TYPE_RESP_ACL_NEGOTIATE: i32 = 90;
pub const MSG_TYPE_REQ_USER_CONFIRM: i32 = 100;
pub const MSG_TYPE_RESP_USER_CONFIRM: i32 = 110;
pub const MSG_TYPE_REQ_PIN_AUTH_START: i32 = 120;
pub const MSG_TYPE_REQ_PIN_AUTH_MSG_NEGOTIATE: i32 = 121;
pub const MSG_TYPE_RESP_PIN_AUTH_START: i32 = 130;
pub const MSG_TYPE_RESP_PIN_AUTH_MSG_NEGOTIATE: i32 = 131;
pub const MSG_TYPE_REQ_FINISH: i32 = 200;
pub const MSG_TYPE_RESP_FINISH: i32 = 201;

pub const TAG_MSG_TYPE: &str = "MSG_TYPE";
pub const TAG_REQUEST_ID: &str = "REQUEST_ID";
pub const TAG_DATA: &str = "DATA";
pub const TAG_DATA_LEN: &str = "DATA_LEN";
pub const TAG_REPLY: &str = "REPLY";
pub const TAG_UDID: &str = "UDID";
pub const TAG_USER_ID: &str = "USER_ID";
pub const TAG_ACCOUNT_ID: &str = "ACCOUNT_ID";
pub const TAG_TOKEN_ID: &str = "TOKEN_ID";
pub const TAG_BUNDLE_NAME: &str = "BUNDLE_NAME";
pub const TAG_PEER_BUNDLE_NAME: &str = "PEER_BUNDLE_NAME";
pub const TAG_AUTH_TYPE: &str = "AUTH_TYPE";
pub const TAG_BIND_LEVEL: &str = "BIND_LEVEL";
pub const TAG_HAVE_CREDENTIAL: &str = "HAVE_CREDENTIAL";
pub const TAG_IS_IDENTICAL_ACCOUNT: &str = "IS_IDENTICAL_ACCOUNT";
pub const TAG_APP_NAME: &str = "APP_NAME";
pub const TAG_CUSTOM_DESCRIPTION: &str = "CUSTOM_DESCRIPTION";
pub const TAG_CONFIRM_OPERATION: &str = "CONFIRM_OPERATION";

/// Why an inbound message could not be decoded
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotObject,
    #[error("required field {0} missing or mistyped")]
    MissingField(&'static str),
    #[error("unknown message type {0}")]
    UnknownType(i32),
    #[error("DATA_LEN does not match DATA")]
    DataLenMismatch,
}

/// Identity and intent exchanged during negotiation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiateInfo {
    pub udid: String,
    pub user_id: i32,
    pub account_id: String,
    pub token_id: u64,
    /// Package on the sending device
    pub bundle_name: String,
    /// Package the sender wants to reach on the receiving device
    pub peer_bundle_name: String,
    pub auth_type: AuthType,
    pub bind_level: BindLevel,
    /// Sender already holds a credential and ACL for this pair
    pub have_credential: bool,
}

/// Parameters of the confirmation request shown on the sink
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub auth_type: AuthType,
    pub bind_level: BindLevel,
    pub bundle_name: String,
    pub app_name: String,
    pub custom_description: String,
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMessage {
    ReqAclNegotiate {
        request_id: i64,
        info: NegotiateInfo,
    },
    RespAclNegotiate {
        request_id: i64,
        reply: i32,
        info: NegotiateInfo,
        is_identical_account: bool,
    },
    ReqUserConfirm {
        request_id: i64,
        confirm: ConfirmRequest,
    },
    RespUserConfirm {
        request_id: i64,
        confirm_operation: UserAction,
    },
    ReqPinAuthStart {
        request_id: i64,
        data: String,
    },
    RespPinAuthStart {
        request_id: i64,
        data: String,
    },
    ReqPinAuthMsgNegotiate {
        request_id: i64,
        data: String,
    },
    RespPinAuthMsgNegotiate {
        request_id: i64,
        data: String,
    },
    ReqFinish {
        request_id: i64,
        reply: i32,
    },
    RespFinish {
        request_id: i64,
        reply: i32,
    },
}

impl AuthMessage {
    pub fn request_id(&self) -> i64 {
        match self {
            AuthMessage::ReqAclNegotiate { request_id, .. }
            | AuthMessage::RespAclNegotiate { request_id, .. }
            | AuthMessage::ReqUserConfirm { request_id, .. }
            | AuthMessage::RespUserConfirm { request_id, .. }
            | AuthMessage::ReqPinAuthStart { request_id, .. }
            | AuthMessage::RespPinAuthStart { request_id, .. }
            | AuthMessage::ReqPinAuthMsgNegotiate { request_id, .. }
            | AuthMessage::RespPinAuthMsgNegotiate { request_id, .. }
            | AuthMessage::ReqFinish { request_id, .. }
            | AuthMessage::RespFinish { request_id, .. } => *request_id,
        }
    }

    pub fn msg_type(&self) -> i32 {
        match self {
            AuthMessage::ReqAclNegotiate { .. } => MSG_TYPE_REQ_ACL_NEGOTIATE,
            AuthMessage::RespAclNegotiate { .. } => MSG_TYPE_RESP_ACL_NEGOTIATE,
            AuthMessage::ReqUserConfirm { .. } => MSG_TYPE_REQ_USER_CONFIRM,
            AuthMessage::RespUserConfirm { .. } => MSG_TYPE_RESP_USER_CONFIRM,
            AuthMessage::ReqPinAuthStart { .. } => MSG_TYPE_REQ_PIN_AUTH_START,
            AuthMessage::RespPinAuthStart { .. } => MSG_TYPE_RESP_PIN_AUTH_START,
            AuthMessage::ReqPinAuthMsgNegotiate { .. } => MSG_TYPE_REQ_PIN_AUTH_MSG_NEGOTIATE,
            AuthMessage::RespPinAuthMsgNegotiate { .. } => MSG_TYPE_RESP_PIN_AUTH_MSG_NEGOTIATE,
            AuthMessage::ReqFinish { .. } => MSG_TYPE_REQ_FINISH,
            AuthMessage::RespFinish { .. } => MSG_TYPE_RESP_FINISH,
        }
    }

    /// A success finish message
    pub fn finish_ok(request_id: i64) -> Self {
        AuthMessage::ReqFinish {
            request_id,
            reply: DM_OK,
        }
    }
}

fn put_negotiate_info(obj: &mut Map<String, Value>, info: &NegotiateInfo) {
    obj.insert(TAG_UDID.into(), info.udid.clone().into());
    obj.insert(TAG_USER_ID.into(), info.user_id.into());
    obj.insert(TAG_ACCOUNT_ID.into(), info.account_id.clone().into());
    obj.insert(TAG_TOKEN_ID.into(), info.token_id.into());
    obj.insert(TAG_BUNDLE_NAME.into(), info.bundle_name.clone().into());
    obj.insert(TAG_PEER_BUNDLE_NAME.into(), info.peer_bundle_name.clone().into());
    obj.insert(TAG_AUTH_TYPE.into(), info.auth_type.as_i32().into());
    obj.insert(TAG_BIND_LEVEL.into(), info.bind_level.as_i32().into());
    obj.insert(TAG_HAVE_CREDENTIAL.into(), info.have_credential.into());
}

fn put_data(obj: &mut Map<String, Value>, data: &str) {
    obj.insert(TAG_DATA.into(), data.into());
    obj.insert(TAG_DATA_LEN.into(), data.len().into());
}

/// Encode a message for the session transport
pub fn encode(msg: &AuthMessage) -> Vec<u8> {
    let mut obj = Map::new();
    obj.insert(TAG_MSG_TYPE.into(), msg.msg_type().into());
    obj.insert(TAG_REQUEST_ID.into(), msg.request_id().into());
    match msg {
        AuthMessage::ReqAclNegotiate { info, .. } => put_negotiate_info(&mut obj, info),
        AuthMessage::RespAclNegotiate {
            reply,
            info,
            is_identical_account,
            ..
        } => {
            obj.insert(TAG_REPLY.into(), (*reply).into());
            obj.insert(TAG_IS_IDENTICAL_ACCOUNT.into(), (*is_identical_account).into());
            put_negotiate_info(&mut obj, info);
        }
        AuthMessage::ReqUserConfirm { confirm, .. } => {
            obj.insert(TAG_AUTH_TYPE.into(), confirm.auth_type.as_i32().into());
            obj.insert(TAG_BIND_LEVEL.into(), confirm.bind_level.as_i32().into());
            obj.insert(TAG_BUNDLE_NAME.into(), confirm.bundle_name.clone().into());
            obj.insert(TAG_APP_NAME.into(), confirm.app_name.clone().into());
            obj.insert(
                TAG_CUSTOM_DESCRIPTION.into(),
                confirm.custom_description.clone().into(),
            );
        }
        AuthMessage::RespUserConfirm {
            confirm_operation, ..
        } => {
            obj.insert(TAG_CONFIRM_OPERATION.into(), confirm_operation.as_i32().into());
        }
        AuthMessage::ReqPinAuthStart { data, .. }
        | AuthMessage::RespPinAuthStart { data, .. }
        | AuthMessage::ReqPinAuthMsgNegotiate { data, .. }
        | AuthMessage::RespPinAuthMsgNegotiate { data, .. } => put_data(&mut obj, data),
        AuthMessage::ReqFinish { reply, .. } | AuthMessage::RespFinish { reply, .. } => {
            obj.insert(TAG_REPLY.into(), (*reply).into());
        }
    }
    Value::Object(obj).to_string().into_bytes()
}

fn required_i64(obj: &Map<String, Value>, key: &'static str) -> Result<i64, DecodeError> {
    obj.get(key)
        .and_then(Value::as_i64)
        .ok_or(DecodeError::MissingField(key))
}

fn opt_i64(obj: &Map<String, Value>, key: &str) -> i64 {
    obj.get(key).and_then(Value::as_i64).unwrap_or_default()
}

fn opt_i32(obj: &Map<String, Value>, key: &str) -> i32 {
    i32::try_from(opt_i64(obj, key)).unwrap_or_default()
}

fn opt_str(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}

fn opt_bool(obj: &Map<String, Value>, key: &str) -> bool {
    obj.get(key).and_then(Value::as_bool).unwrap_or_default()
}

fn get_negotiate_info(obj: &Map<String, Value>) -> NegotiateInfo {
    NegotiateInfo {
        udid: opt_str(obj, TAG_UDID),
        user_id: opt_i32(obj, TAG_USER_ID),
        account_id: opt_str(obj, TAG_ACCOUNT_ID),
        token_id: obj.get(TAG_TOKEN_ID).and_then(Value::as_u64).unwrap_or_default(),
        bundle_name: opt_str(obj, TAG_BUNDLE_NAME),
        peer_bundle_name: opt_str(obj, TAG_PEER_BUNDLE_NAME),
        auth_type: AuthType::from(opt_i32(obj, TAG_AUTH_TYPE)),
        bind_level: BindLevel::from_i32(opt_i32(obj, TAG_BIND_LEVEL)).unwrap_or_default(),
        have_credential: opt_bool(obj, TAG_HAVE_CREDENTIAL),
    }
}

fn get_data(obj: &Map<String, Value>) -> Result<String, DecodeError> {
    let data = opt_str(obj, TAG_DATA);
    if let Some(len) = obj.get(TAG_DATA_LEN).and_then(Value::as_u64) {
        if len as usize != data.len() {
            return Err(DecodeError::DataLenMismatch);
        }
    }
    Ok(data)
}

/// Decode a message received from the session transport
pub fn decode(bytes: &[u8]) -> Result<AuthMessage, DecodeError> {
    let root: Value = serde_json::from_slice(bytes)?;
    let obj = root.as_object().ok_or(DecodeError::NotObject)?;
    let msg_type = i32::try_from(required_i64(obj, TAG_MSG_TYPE)?)
        .map_err(|_| DecodeError::MissingField(TAG_MSG_TYPE))?;
    let request_id = required_i64(obj, TAG_REQUEST_ID)?;

    let msg = match msg_type {
        MSG_TYPE_REQ_ACL_NEGOTIATE => AuthMessage::ReqAclNegotiate {
            request_id,
            info: get_negotiate_info(obj),
        },
        MSG_TYPE_RESP_ACL_NEGOTIATE => AuthMessage::RespAclNegotiate {
            request_id,
            reply: opt_i32(obj, TAG_REPLY),
            info: get_negotiate_info(obj),
            is_identical_account: opt_bool(obj, TAG_IS_IDENTICAL_ACCOUNT),
        },
        MSG_TYPE_REQ_USER_CONFIRM => AuthMessage::ReqUserConfirm {
            request_id,
            confirm: ConfirmRequest {
                auth_type: AuthType::from(opt_i32(obj, TAG_AUTH_TYPE)),
                bind_level: BindLevel::from_i32(opt_i32(obj, TAG_BIND_LEVEL)).unwrap_or_default(),
                bundle_name: opt_str(obj, TAG_BUNDLE_NAME),
                app_name: opt_str(obj, TAG_APP_NAME),
                custom_description: opt_str(obj, TAG_CUSTOM_DESCRIPTION),
            },
        },
        MSG_TYPE_RESP_USER_CONFIRM => {
            // A missing or out-of-range decision must never read as "allow"
            let confirm_operation = obj
                .get(TAG_CONFIRM_OPERATION)
                .and_then(Value::as_i64)
                .and_then(|v| i32::try_from(v).ok())
                .map(UserAction::from)
                .unwrap_or(UserAction::Reject);
            AuthMessage::RespUserConfirm {
                request_id,
                confirm_operation,
            }
        }
        MSG_TYPE_REQ_PIN_AUTH_START => AuthMessage::ReqPinAuthStart {
            request_id,
            data: get_data(obj)?,
        },
        MSG_TYPE_RESP_PIN_AUTH_START => AuthMessage::RespPinAuthStart {
            request_id,
            data: get_data(obj)?,
        },
        MSG_TYPE_REQ_PIN_AUTH_MSG_NEGOTIATE => AuthMessage::ReqPinAuthMsgNegotiate {
            request_id,
            data: get_data(obj)?,
        },
        MSG_TYPE_RESP_PIN_AUTH_MSG_NEGOTIATE => AuthMessage::RespPinAuthMsgNegotiate {
            request_id,
            data: get_data(obj)?,
        },
        MSG_TYPE_REQ_FINISH => AuthMessage::ReqFinish {
            request_id,
            reply: opt_i32(obj, TAG_REPLY),
        },
        MSG_TYPE_RESP_FINISH => AuthMessage::RespFinish {
            request_id,
            reply: opt_i32(obj, TAG_REPLY),
        },
        other => return Err(DecodeError::UnknownType(other)),
    };
    Ok(msg)
}
