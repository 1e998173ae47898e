use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::{CallDirection, CallEvent, CallStatus};
use crate::fsm::{TransitionNotice, TransitionReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityState {
    Online,
    Offline,
}

/// Retained birth/last-will payload on the availability topic.
#[derive(Debug, Clone, Serialize)]
pub struct AvailabilityMessage {
    pub state: AvailabilityState,
    pub last_changed: DateTime<Utc>,
}

impl AvailabilityMessage {
    pub fn online() -> Self {
        Self {
            state: AvailabilityState::Online,
            last_changed: Utc::now(),
        }
    }

    pub fn offline() -> Self {
        Self {
            state: AvailabilityState::Offline,
            last_changed: Utc::now(),
        }
    }
}

/// Retained per-line status document: the line's machine state plus the
/// participants and raw record of the latest event seen for that line.
#[derive(Debug, Clone, Serialize)]
pub struct LineStatusMessage {
    pub line: u32,
    pub status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_state: Option<CallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<CallDirection>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub caller: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub called: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub caller_msn: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub called_msn: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub trunk: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub extension: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_event: String,
    pub timestamp: DateTime<Utc>,
}

/// Ephemeral FSM debug payload for one executed transition.
#[derive(Debug, Clone, Serialize)]
pub struct StatusChangeMessage {
    pub line: u32,
    pub old_status: CallStatus,
    pub new_status: CallStatus,
    pub reason: TransitionReason,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<CallEvent>,
}

impl From<&TransitionNotice> for StatusChangeMessage {
    fn from(notice: &TransitionNotice) -> Self {
        Self {
            line: notice.line,
            old_status: notice.old_state,
            new_status: notice.new_state,
            reason: notice.reason,
            timestamp: Utc::now(),
            event: notice.event.clone(),
        }
    }
}

/// Retained bounded history of the most recent call events, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct CallHistoryMessage {
    pub calls: Vec<CallEvent>,
    pub max_size: usize,
    pub updated_at: DateTime<Utc>,
}
