//! Scripted user decisions
//!
//! Stands in for the people in front of both devices. PINs shown on one
//! device are pinned to a shared [`PinBoard`] so the other device can
//! "read" and type them.

use peerbind_auth::{ConfirmParams, PromptReply, UserPrompt};
use peerbind_core::UserAction;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// PINs currently on screen, by request id
#[derive(Clone, Default)]
pub struct PinBoard {
    pins: Arc<Mutex<HashMap<i64, u32>>>,
}

impl PinBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn show(&self, request_id: i64, pin_code: u32) {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        pins.insert(request_id, pin_code);
    }

    pub fn read(&self, request_id: i64) -> Option<u32> {
        let pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        pins.get(&request_id).copied()
    }
}

/// Answer given to the confirmation dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmPolicy {
    Allow,
    AllowAlways,
    Reject,
    /// Leave the dialog open until it times out
    Ignore,
}

/// Behaviour at the PIN input dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinPolicy {
    /// Type the PIN shown on the peer
    TypeDisplayed,
    /// Type a wrong PIN this many times, then the right one
    TypeWrong(u32),
    Cancel,
    Ignore,
}

/// [`UserPrompt`] that answers every dialog according to fixed policies
pub struct ScriptedPrompt {
    board: PinBoard,
    confirm: ConfirmPolicy,
    pin: PinPolicy,
    wrong_typed: AtomicU32,
    confirms_shown: AtomicUsize,
    pin_inputs_shown: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn new(board: PinBoard) -> Self {
        Self {
            board,
            confirm: ConfirmPolicy::Allow,
            pin: PinPolicy::TypeDisplayed,
            wrong_typed: AtomicU32::new(0),
            confirms_shown: AtomicUsize::new(0),
            pin_inputs_shown: AtomicUsize::new(0),
        }
    }

    pub fn with_confirm(mut self, policy: ConfirmPolicy) -> Self {
        self.confirm = policy;
        self
    }

    pub fn with_pin(mut self, policy: PinPolicy) -> Self {
        self.pin = policy;
        self
    }

    pub fn confirms_shown(&self) -> usize {
        self.confirms_shown.load(Ordering::SeqCst)
    }

    pub fn pin_inputs_shown(&self) -> usize {
        self.pin_inputs_shown.load(Ordering::SeqCst)
    }

    fn pin_to_type(&self, displayed: u32) -> u32 {
        match self.pin {
            PinPolicy::TypeWrong(times) if self.wrong_typed.load(Ordering::SeqCst) < times => {
                self.wrong_typed.fetch_add(1, Ordering::SeqCst);
                if displayed == peerbind_auth::pin::MAX_PIN_CODE {
                    peerbind_auth::pin::MIN_PIN_CODE
                } else {
                    displayed + 1
                }
            }
            _ => displayed,
        }
    }
}

impl UserPrompt for ScriptedPrompt {
    fn show_confirm_dialog(&self, params: ConfirmParams, reply: PromptReply) {
        self.confirms_shown.fetch_add(1, Ordering::SeqCst);
        info!(
            "{} on {} asks to bind at {:?}: {:?}",
            params.bundle_name, params.peer_udid, params.bind_level, self.confirm
        );
        let action = match self.confirm {
            ConfirmPolicy::Allow => UserAction::AllowAuth,
            ConfirmPolicy::AllowAlways => UserAction::AllowAuthAlways,
            ConfirmPolicy::Reject => UserAction::Reject,
            ConfirmPolicy::Ignore => return,
        };
        reply.send(action, None);
    }

    fn show_pin_input_dialog(&self, request_id: i64, reply: PromptReply) {
        self.pin_inputs_shown.fetch_add(1, Ordering::SeqCst);
        match self.pin {
            PinPolicy::Cancel => {
                reply.send(UserAction::CancelPinInput, None);
            }
            PinPolicy::Ignore => {}
            PinPolicy::TypeDisplayed | PinPolicy::TypeWrong(_) => {
                let Some(displayed) = self.board.read(request_id) else {
                    debug!("No PIN on screen for request {}", request_id);
                    return;
                };
                let typed = self.pin_to_type(displayed);
                reply.send(UserAction::PinInputDone, Some(format!("{:06}", typed)));
            }
        }
    }

    fn show_pin_display(&self, request_id: i64, pin_code: u32) {
        debug!("Showing PIN for request {}", request_id);
        self.board.show(request_id, pin_code);
    }
}
