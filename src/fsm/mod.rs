//! Per-line call state machines with timed auto-reset.
//!
//! One machine per physical line. Event-driven transitions are applied by
//! the engine's processing task; terminal states arm a single-shot timer
//! whose firing returns the line to idle and reports the transition over
//! the manager's notice channel, so downstream work never runs under a lock.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::{CallEvent, CallStatus, CallType};

mod machine;
mod manager;

pub use machine::{next_state, RESET_AFTER};
pub use manager::{LineManager, TransitionReceiver, TransitionSender};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionReason {
    Event,
    Timeout,
    Reset,
}

/// Report of one executed transition. `event` is `None` iff the transition
/// was driven by the reset timer or an explicit reset.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionNotice {
    pub line: u32,
    pub old_state: CallStatus,
    pub new_state: CallStatus,
    pub reason: TransitionReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_state: Option<CallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<CallEvent>,
}

/// Point-in-time view of one line's machine, published on the FSM debug
/// topic.
#[derive(Debug, Clone, Serialize)]
pub struct FsmSnapshot {
    pub line: u32,
    pub status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_state: Option<CallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub valid_transitions: Vec<CallType>,
    pub is_timeout_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_type: Option<CallType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_timestamp: Option<DateTime<Utc>>,
}
