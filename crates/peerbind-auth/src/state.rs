//! Authentication state machine
//!
//! Both halves of the handshake share one flat enum. A session only ever
//! visits the variants of its own role.
//!
//! ```text
//! source                              sink
//! SrcStart
//!   ↓ session opened
//! SrcNegotiate      ── REQ_ACL_NEGOTIATE ──▶    SinkStart → SinkNegotiate
//!   ↓ RESP_ACL_NEGOTIATE ◀──────────────────────┘
//! SrcConfirm        ── REQ_USER_CONFIRM ──▶     SinkConfirm (dialog)
//!   ↓ RESP_USER_CONFIRM ◀──────────────────     SinkPinDisplay
//! SrcPinInput (dialog)
//! SrcPinAuthStart   ── REQ_PIN_AUTH_START ──▶   SinkPinAuthStart
//! SrcPinAuthMsgNegotiate ── REQ_..._NEGOTIATE ▶ SinkPinAuthMsgNegotiate
//! SrcPinAuthDone                                SinkPinAuthDone
//! SrcFinish         ── REQ_FINISH ──▶           SinkFinish
//! ```
//!
//! [`action`] runs a state once per entry. Where the session goes next is
//! decided by [`next_state`] for local steps and by the `process_*`
//! functions for peer messages and user decisions.

use crate::acl::{AccessControlEntry, AclLifetime};
use crate::context::AuthContext;
use crate::credential::CredentialEvent;
use crate::listener::UiState;
use crate::message::{AuthMessage, ConfirmRequest};
use crate::pin::{generate_pincode, parse_auth_code};
use crate::prompt::ConfirmParams;
use peerbind_core::{
    AuthRole, AuthType, BindLevel, DmError, DmResult, TimerName, UserAction, DM_OK,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmAuthState {
    SrcStart,
    SrcNegotiate,
    SrcConfirm,
    SrcPinInput,
    SrcPinAuthStart,
    SrcPinAuthMsgNegotiate,
    SrcPinAuthDone,
    SrcFinish,
    SinkStart,
    SinkNegotiate,
    SinkConfirm,
    SinkPinDisplay,
    SinkPinAuthStart,
    SinkPinAuthMsgNegotiate,
    SinkPinAuthDone,
    SinkFinish,
}

impl DmAuthState {
    pub fn role(&self) -> AuthRole {
        match self {
            DmAuthState::SrcStart
            | DmAuthState::SrcNegotiate
            | DmAuthState::SrcConfirm
            | DmAuthState::SrcPinInput
            | DmAuthState::SrcPinAuthStart
            | DmAuthState::SrcPinAuthMsgNegotiate
            | DmAuthState::SrcPinAuthDone
            | DmAuthState::SrcFinish => AuthRole::Source,
            _ => AuthRole::Sink,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DmAuthState::SrcFinish | DmAuthState::SinkFinish)
    }

    /// Terminal state of a role
    pub fn finish_for(role: AuthRole) -> Self {
        match role {
            AuthRole::Source => DmAuthState::SrcFinish,
            AuthRole::Sink => DmAuthState::SinkFinish,
        }
    }

    /// Timer guarding the wait that follows this state
    pub fn wait_timer(&self) -> Option<TimerName> {
        match self {
            DmAuthState::SrcNegotiate | DmAuthState::SinkNegotiate => Some(TimerName::Negotiate),
            DmAuthState::SrcConfirm | DmAuthState::SinkConfirm => Some(TimerName::Confirm),
            DmAuthState::SrcPinInput | DmAuthState::SinkPinDisplay => Some(TimerName::Input),
            DmAuthState::SrcPinAuthStart
            | DmAuthState::SrcPinAuthMsgNegotiate
            | DmAuthState::SrcPinAuthDone
            | DmAuthState::SinkPinAuthStart
            | DmAuthState::SinkPinAuthMsgNegotiate
            | DmAuthState::SinkPinAuthDone => Some(TimerName::PinAuth),
            _ => None,
        }
    }
}

impl std::fmt::Display for DmAuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Successful result of running a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Continue with the normal flow
    Advance,
    /// The engine produced something the state cannot handle; end the bind
    StopBind,
}

/// What the driver should do after an input was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Enter(DmAuthState),
    /// Stay put until the next input
    Wait,
    Finish {
        reason: DmResult<()>,
        notify_peer: bool,
    },
}

impl Transition {
    fn fail(reason: DmError) -> Self {
        Transition::Finish {
            reason: Err(reason),
            notify_peer: true,
        }
    }

    /// The peer already knows, don't echo a finish back
    fn peer_failed(reason: DmError) -> Self {
        Transition::Finish {
            reason: Err(reason),
            notify_peer: false,
        }
    }
}

/// Run `state` once against the context
pub async fn action(state: DmAuthState, ctx: &mut AuthContext) -> DmResult<ActionOutcome> {
    match state {
        DmAuthState::SrcStart | DmAuthState::SinkStart => Ok(ActionOutcome::Advance),
        DmAuthState::SrcNegotiate => src_negotiate(ctx),
        DmAuthState::SinkNegotiate => sink_negotiate(ctx),
        DmAuthState::SrcConfirm => src_confirm(ctx),
        DmAuthState::SinkConfirm => sink_confirm(ctx),
        DmAuthState::SinkPinDisplay => sink_pin_display(ctx),
        DmAuthState::SrcPinInput => src_pin_input(ctx),
        DmAuthState::SrcPinAuthStart => src_pin_auth_start(ctx).await,
        DmAuthState::SrcPinAuthMsgNegotiate => src_pin_auth_msg_negotiate(ctx).await,
        DmAuthState::SrcPinAuthDone => src_pin_auth_done(ctx).await,
        DmAuthState::SinkPinAuthStart => sink_pin_auth_start(ctx).await,
        DmAuthState::SinkPinAuthMsgNegotiate => sink_pin_auth_msg_negotiate(ctx).await,
        DmAuthState::SinkPinAuthDone => Ok(ActionOutcome::Advance),
        DmAuthState::SrcFinish => src_auth_device_finish(ctx),
        DmAuthState::SinkFinish => sink_auth_device_finish(ctx),
    }
}

/// Local transition taken right after `state` advanced, if any
pub fn next_state(state: DmAuthState, ctx: &AuthContext) -> Option<DmAuthState> {
    match state {
        DmAuthState::SinkStart => Some(DmAuthState::SinkNegotiate),
        DmAuthState::SinkConfirm if ctx.confirm_operation.is_allow() => {
            Some(DmAuthState::SinkPinDisplay)
        }
        DmAuthState::SrcPinInput if ctx.pin_code.is_some() => Some(DmAuthState::SrcPinAuthStart),
        DmAuthState::SrcPinAuthDone => Some(DmAuthState::SrcFinish),
        DmAuthState::SinkPinAuthMsgNegotiate => Some(DmAuthState::SinkPinAuthDone),
        _ => None,
    }
}

fn src_negotiate(ctx: &mut AuthContext) -> DmResult<ActionOutcome> {
    ctx.refresh_trust();
    let msg = AuthMessage::ReqAclNegotiate {
        request_id: ctx.request_id,
        info: ctx.negotiate_info(),
    };
    ctx.outbox.send(&msg)?;
    Ok(ActionOutcome::Advance)
}

fn sink_negotiate(ctx: &mut AuthContext) -> DmResult<ActionOutcome> {
    if ctx.auth_type == AuthType::Unknown || ctx.bind_level == BindLevel::Invalid {
        warn!(
            "Request {} negotiates {:?} at {:?}",
            ctx.request_id, ctx.auth_type, ctx.bind_level
        );
        return Err(DmError::InputParaInvalid);
    }
    ctx.refresh_trust();
    ctx.is_identical_account =
        !ctx.local.account_id.is_empty() && ctx.local.account_id == ctx.peer_account_id;
    let msg = AuthMessage::RespAclNegotiate {
        request_id: ctx.request_id,
        reply: DM_OK,
        info: ctx.negotiate_info(),
        is_identical_account: ctx.is_identical_account,
    };
    ctx.outbox.send(&msg)?;
    Ok(ActionOutcome::Advance)
}

fn src_confirm(ctx: &mut AuthContext) -> DmResult<ActionOutcome> {
    let msg = AuthMessage::ReqUserConfirm {
        request_id: ctx.request_id,
        confirm: ConfirmRequest {
            auth_type: ctx.auth_type,
            bind_level: ctx.bind_level,
            bundle_name: ctx.pkg_name.clone(),
            app_name: ctx.app_name.clone(),
            custom_description: ctx.custom_description.clone(),
        },
    };
    ctx.outbox.send(&msg)?;
    Ok(ActionOutcome::Advance)
}

fn sink_confirm(ctx: &mut AuthContext) -> DmResult<ActionOutcome> {
    if ctx.auth_type == AuthType::ImportAuthCode {
        let Some(code) = ctx.import_auth_code else {
            warn!("No auth code imported for {}", ctx.pkg_name);
            return Err(DmError::AuthCodeIncorrect);
        };
        debug!("Request {} confirmed by imported auth code", ctx.request_id);
        ctx.pin_code = Some(code);
        ctx.confirm_operation = UserAction::AllowAuth;
        return Ok(ActionOutcome::Advance);
    }

    let params = ConfirmParams {
        request_id: ctx.request_id,
        peer_udid: ctx.peer_udid().to_string(),
        bundle_name: ctx.peer_pkg_name.clone(),
        app_name: ctx.app_name.clone(),
        custom_description: ctx.custom_description.clone(),
        auth_type: ctx.auth_type,
        bind_level: ctx.bind_level,
    };
    ctx.deps.prompt.show_confirm_dialog(params, ctx.reply.clone());
    ctx.notify_ui(UiState::ConfirmShown);
    Ok(ActionOutcome::Advance)
}

fn sink_pin_display(ctx: &mut AuthContext) -> DmResult<ActionOutcome> {
    let pin_code = match ctx.pin_code {
        Some(pin) => pin,
        None => {
            let pin = generate_pincode();
            ctx.pin_code = Some(pin);
            ctx.deps.prompt.show_pin_display(ctx.request_id, pin);
            ctx.notify_ui(UiState::PinDisplayShown);
            pin
        }
    };
    ctx.deps
        .connector
        .set_pin_code(ctx.request_id, Some(pin_code));
    let msg = AuthMessage::RespUserConfirm {
        request_id: ctx.request_id,
        confirm_operation: ctx.confirm_operation,
    };
    ctx.outbox.send(&msg)?;
    Ok(ActionOutcome::Advance)
}

fn src_pin_input(ctx: &mut AuthContext) -> DmResult<ActionOutcome> {
    if ctx.auth_type == AuthType::ImportAuthCode {
        ctx.pin_code = Some(ctx.import_auth_code.ok_or(DmError::AuthCodeIncorrect)?);
        return Ok(ActionOutcome::Advance);
    }
    ctx.pin_code = None;
    ctx.deps
        .prompt
        .show_pin_input_dialog(ctx.request_id, ctx.reply.clone());
    ctx.notify_ui(UiState::PinInputShown);
    Ok(ActionOutcome::Advance)
}

/// Wait for the engine's answer and relay it to the peer wrapped by `wrap`
async fn relay_transmit(
    ctx: &mut AuthContext,
    wrap: fn(i64, String) -> AuthMessage,
) -> DmResult<ActionOutcome> {
    match ctx.events.wait_expect_event().await {
        CredentialEvent::Transmit(data) => {
            ctx.outbox.send(&wrap(ctx.request_id, data))?;
            Ok(ActionOutcome::Advance)
        }
        CredentialEvent::Error { error_code, .. } => {
            ctx.credential_error = Some(error_code);
            Ok(ActionOutcome::Advance)
        }
        other => {
            warn!(
                "Request {} got {:?} in {}, stopping bind",
                ctx.request_id,
                other.kind(),
                ctx.state
            );
            Ok(ActionOutcome::StopBind)
        }
    }
}

async fn src_pin_auth_start(ctx: &mut AuthContext) -> DmResult<ActionOutcome> {
    let Some(pin_code) = ctx.pin_code else {
        warn!("Request {} reached credential exchange without a PIN", ctx.request_id);
        return Err(DmError::InputParaInvalid);
    };
    ctx.deps.connector.auth_credential_pin_code(
        ctx.request_id,
        ctx.local.user_id,
        ctx.peer_udid(),
        pin_code,
    )?;
    relay_transmit(ctx, |request_id, data| AuthMessage::ReqPinAuthStart {
        request_id,
        data,
    })
    .await
}

async fn src_pin_auth_msg_negotiate(ctx: &mut AuthContext) -> DmResult<ActionOutcome> {
    let data = ctx.transmit_data.take().unwrap_or_default();
    ctx.deps.connector.process_cred_data(ctx.request_id, &data)?;
    relay_transmit(ctx, |request_id, data| AuthMessage::ReqPinAuthMsgNegotiate {
        request_id,
        data,
    })
    .await
}

async fn src_pin_auth_done(ctx: &mut AuthContext) -> DmResult<ActionOutcome> {
    let data = ctx.transmit_data.take().unwrap_or_default();
    ctx.deps.connector.process_cred_data(ctx.request_id, &data)?;
    match ctx.events.wait_expect_event().await {
        CredentialEvent::SessionKeyReturned(key) => {
            ctx.session_key = Some(key);
            match ctx.events.wait_expect_event().await {
                CredentialEvent::Finish { .. } => Ok(ActionOutcome::Advance),
                CredentialEvent::Error { error_code, .. } => {
                    ctx.credential_error = Some(error_code);
                    Ok(ActionOutcome::Advance)
                }
                other => {
                    warn!("Request {} got {:?} after session key", ctx.request_id, other.kind());
                    Err(DmError::Failed)
                }
            }
        }
        CredentialEvent::Error { error_code, .. } => {
            ctx.credential_error = Some(error_code);
            Ok(ActionOutcome::Advance)
        }
        other => {
            warn!("Request {} expected session key, got {:?}", ctx.request_id, other.kind());
            Err(DmError::Failed)
        }
    }
}

async fn sink_pin_auth_start(ctx: &mut AuthContext) -> DmResult<ActionOutcome> {
    let data = ctx.transmit_data.take().unwrap_or_default();
    ctx.deps.connector.process_cred_data(ctx.request_id, &data)?;
    relay_transmit(ctx, |request_id, data| AuthMessage::RespPinAuthStart {
        request_id,
        data,
    })
    .await
}

async fn sink_pin_auth_msg_negotiate(ctx: &mut AuthContext) -> DmResult<ActionOutcome> {
    let data = ctx.transmit_data.take().unwrap_or_default();
    ctx.deps.connector.process_cred_data(ctx.request_id, &data)?;
    relay_transmit(ctx, |request_id, data| AuthMessage::RespPinAuthMsgNegotiate {
        request_id,
        data,
    })
    .await
}

/// How a finished bind was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishDecision {
    /// Same account on both devices, nothing to store
    IdenticalAccount,
    /// An existing relationship was reused
    Reused,
    Written {
        lifetime: AclLifetime,
        credential_created: bool,
    },
}

/// Record the trust relationship a successful handshake established
pub fn commit_trust_relationship(ctx: &mut AuthContext) -> DmResult<FinishDecision> {
    if ctx.is_identical_account {
        return Ok(FinishDecision::IdenticalAccount);
    }

    let peer = ctx.peer_udid().to_string();
    if ctx.is_online && ctx.have_credential {
        let entries = ctx.matching_entries();
        if !entries.is_empty() {
            for mut entry in entries {
                entry.touch();
                if let Err(e) = ctx.deps.trust_store.put_access_control_list(entry) {
                    warn!("Failed to refresh ACL for {}: {}", peer, e);
                }
            }
            return Ok(FinishDecision::Reused);
        }
        debug!("Request {} has no entry to reuse", ctx.request_id);
    }

    let mut credential_created = false;
    if !ctx.have_credential {
        let credential_id = ctx
            .deps
            .connector
            .generate_credential(ctx.local.user_id, &ctx.local.udid, &peer)
            .inspect_err(|e| warn!("Credential creation for {} failed: {}", peer, e))?;
        ctx.credential_id = Some(credential_id);
        ctx.have_credential = true;
        credential_created = true;
    }

    let lifetime = if ctx.confirm_operation == UserAction::AllowAuthAlways {
        AclLifetime::Permanent
    } else {
        AclLifetime::Session
    };
    let mut entry = AccessControlEntry::new(
        ctx.local_subject(),
        ctx.remote_subject(),
        ctx.bind_level,
        ctx.auth_type,
        lifetime,
    );
    entry.credential_id = ctx.credential_id.clone();
    if let Err(e) = ctx.deps.trust_store.put_access_control_list(entry) {
        // The handshake itself succeeded; the peer keeps its half.
        warn!("Failed to persist ACL for request {}: {}", ctx.request_id, e);
    }
    Ok(FinishDecision::Written {
        lifetime,
        credential_created,
    })
}

fn src_auth_device_finish(ctx: &mut AuthContext) -> DmResult<ActionOutcome> {
    let decision = commit_trust_relationship(ctx)?;
    info!("Request {} finished as source: {:?}", ctx.request_id, decision);
    ctx.outbox.send(&AuthMessage::finish_ok(ctx.request_id))?;
    Ok(ActionOutcome::Advance)
}

fn sink_auth_device_finish(ctx: &mut AuthContext) -> DmResult<ActionOutcome> {
    let decision = commit_trust_relationship(ctx)?;
    info!("Request {} finished as sink: {:?}", ctx.request_id, decision);
    Ok(ActionOutcome::Advance)
}

fn unexpected(ctx: &AuthContext, msg: &AuthMessage) -> Transition {
    warn!(
        "Dropping message type {} in state {} for request {}",
        msg.msg_type(),
        ctx.state,
        ctx.request_id
    );
    Transition::Wait
}

/// Route a peer message received by a source session
pub fn process_source_msg(ctx: &mut AuthContext, msg: AuthMessage) -> Transition {
    match (&msg, ctx.state) {
        (AuthMessage::ReqFinish { reply, .. } | AuthMessage::RespFinish { reply, .. }, _) => {
            match DmError::from_code(*reply) {
                Some(reason) => Transition::peer_failed(reason),
                None => unexpected(ctx, &msg),
            }
        }
        (
            AuthMessage::RespAclNegotiate {
                reply,
                info,
                is_identical_account,
                ..
            },
            DmAuthState::SrcNegotiate,
        ) => {
            if let Some(reason) = DmError::from_code(*reply) {
                return Transition::peer_failed(reason);
            }
            ctx.apply_peer_info(info);
            ctx.is_identical_account = *is_identical_account
                && !ctx.local.account_id.is_empty()
                && ctx.local.account_id == ctx.peer_account_id;
            if ctx.is_identical_account || ctx.can_skip_pin() {
                return Transition::Enter(DmAuthState::SrcFinish);
            }
            match ctx.auth_type {
                AuthType::IdenticalAccount | AuthType::Credential => {
                    warn!(
                        "Request {} wanted {:?} but the peer cannot provide it",
                        ctx.request_id, ctx.auth_type
                    );
                    Transition::fail(DmError::AuthFailed)
                }
                _ => Transition::Enter(DmAuthState::SrcConfirm),
            }
        }
        (
            AuthMessage::RespUserConfirm {
                confirm_operation, ..
            },
            DmAuthState::SrcConfirm,
        ) => {
            ctx.confirm_operation = *confirm_operation;
            if confirm_operation.is_allow() {
                Transition::Enter(DmAuthState::SrcPinInput)
            } else {
                info!("Request {} rejected by peer", ctx.request_id);
                Transition::peer_failed(DmError::BindPeerRejected)
            }
        }
        (AuthMessage::RespPinAuthStart { data, .. }, DmAuthState::SrcPinAuthStart) => {
            ctx.transmit_data = Some(data.clone());
            Transition::Enter(DmAuthState::SrcPinAuthMsgNegotiate)
        }
        (
            AuthMessage::RespPinAuthMsgNegotiate { data, .. },
            DmAuthState::SrcPinAuthMsgNegotiate,
        ) => {
            ctx.transmit_data = Some(data.clone());
            Transition::Enter(DmAuthState::SrcPinAuthDone)
        }
        _ => unexpected(ctx, &msg),
    }
}

/// Route a peer message received by a sink session
pub fn process_sink_msg(ctx: &mut AuthContext, msg: AuthMessage) -> Transition {
    match (&msg, ctx.state) {
        (AuthMessage::ReqFinish { reply, .. }, state) => match DmError::from_code(*reply) {
            Some(reason) => Transition::peer_failed(reason),
            None if state == DmAuthState::SinkPinAuthDone => {
                Transition::Enter(DmAuthState::SinkFinish)
            }
            None if state == DmAuthState::SinkNegotiate
                && (ctx.is_identical_account || ctx.can_skip_pin()) =>
            {
                Transition::Enter(DmAuthState::SinkFinish)
            }
            None => {
                warn!(
                    "Request {} got finish in {} before authenticating",
                    ctx.request_id, state
                );
                Transition::fail(DmError::Failed)
            }
        },
        (AuthMessage::ReqUserConfirm { confirm, .. }, DmAuthState::SinkNegotiate) => {
            ctx.apply_confirm_request(confirm);
            Transition::Enter(DmAuthState::SinkConfirm)
        }
        (
            AuthMessage::ReqPinAuthStart { data, .. },
            DmAuthState::SinkPinDisplay
            | DmAuthState::SinkPinAuthStart
            | DmAuthState::SinkPinAuthMsgNegotiate,
        ) => {
            if ctx.state != DmAuthState::SinkPinDisplay {
                ctx.pin_fail_times += 1;
                if ctx.pin_fail_times >= ctx.max_pin_attempts {
                    warn!("Request {} exhausted PIN attempts", ctx.request_id);
                    return Transition::fail(DmError::AuthFailed);
                }
                let dropped = ctx.events.drain();
                info!(
                    "Request {} restarting PIN auth, attempt {} ({} stale events)",
                    ctx.request_id,
                    ctx.pin_fail_times + 1,
                    dropped
                );
            }
            ctx.transmit_data = Some(data.clone());
            Transition::Enter(DmAuthState::SinkPinAuthStart)
        }
        (AuthMessage::ReqPinAuthMsgNegotiate { data, .. }, DmAuthState::SinkPinAuthStart) => {
            ctx.transmit_data = Some(data.clone());
            Transition::Enter(DmAuthState::SinkPinAuthMsgNegotiate)
        }
        _ => unexpected(ctx, &msg),
    }
}

/// Route a user decision into the session
pub fn process_user_operation(
    ctx: &mut AuthContext,
    action: UserAction,
    params: Option<&str>,
) -> Transition {
    match (ctx.state, action) {
        (DmAuthState::SinkConfirm, action) if action.is_allow() => {
            ctx.confirm_operation = action;
            Transition::Enter(DmAuthState::SinkPinDisplay)
        }
        (
            DmAuthState::SinkConfirm,
            UserAction::Reject | UserAction::Cancel | UserAction::ConfirmTimeout,
        ) => {
            ctx.confirm_operation = action;
            let msg = AuthMessage::RespUserConfirm {
                request_id: ctx.request_id,
                confirm_operation: UserAction::Reject,
            };
            if let Err(e) = ctx.outbox.send(&msg) {
                debug!("Could not deliver rejection for {}: {}", ctx.request_id, e);
            }
            let reason = if action == UserAction::ConfirmTimeout {
                DmError::TimeOut
            } else {
                DmError::BindUserCancel
            };
            Transition::peer_failed(reason)
        }
        (DmAuthState::SrcPinInput, UserAction::PinInputDone) => {
            match params.and_then(parse_auth_code) {
                Some(pin) => {
                    ctx.pin_code = Some(pin);
                    Transition::Enter(DmAuthState::SrcPinAuthStart)
                }
                None => {
                    warn!("Request {} got a malformed PIN, asking again", ctx.request_id);
                    Transition::Enter(DmAuthState::SrcPinInput)
                }
            }
        }
        (
            state,
            UserAction::Cancel | UserAction::CancelPinInput | UserAction::CancelPinDisplay,
        ) if !state.is_terminal() => {
            info!("Request {} cancelled by user in {}", ctx.request_id, state);
            Transition::fail(DmError::BindUserCancel)
        }
        (state, action) => {
            warn!(
                "Ignoring {:?} in state {} for request {}",
                action, state, ctx.request_id
            );
            Transition::Wait
        }
    }
}

/// Decide how to continue after a state swallowed an engine error
pub fn on_credential_error(ctx: &mut AuthContext, error_code: i32) -> Transition {
    match ctx.state {
        DmAuthState::SrcPinAuthStart | DmAuthState::SrcPinAuthMsgNegotiate => {
            ctx.pin_fail_times += 1;
            let can_retry =
                ctx.auth_type == AuthType::Pin && ctx.pin_fail_times < ctx.max_pin_attempts;
            if !can_retry {
                warn!(
                    "Request {} failed PIN auth {} time(s), last error {}",
                    ctx.request_id, ctx.pin_fail_times, error_code
                );
                return Transition::fail(DmError::AuthFailed);
            }
            info!(
                "Request {} PIN rejected (error {}), retry {} of {}",
                ctx.request_id,
                error_code,
                ctx.pin_fail_times,
                ctx.max_pin_attempts - 1
            );
            ctx.pin_code = None;
            ctx.transmit_data = None;
            ctx.events.drain();
            ctx.notify_ui(UiState::PinRetry);
            Transition::Enter(DmAuthState::SrcPinInput)
        }
        // The source decides whether to retry
        DmAuthState::SinkPinAuthStart | DmAuthState::SinkPinAuthMsgNegotiate => {
            debug!(
                "Request {} engine error {} in {}, waiting for source",
                ctx.request_id, error_code, ctx.state
            );
            Transition::Wait
        }
        state => {
            warn!(
                "Request {} engine error {} in {}",
                ctx.request_id, error_code, state
            );
            Transition::fail(DmError::AuthFailed)
        }
    }
}
