use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{FsmSnapshot, TransitionNotice, TransitionReason};
use crate::event::{CallEvent, CallStatus, CallType};

/// Terminal states return to idle this long after entry.
pub const RESET_AFTER: Duration = Duration::from_secs(1);

/// The transition table. Every (state, event) pair not listed here leaves
/// the state unchanged.
pub fn next_state(current: CallStatus, event: CallType) -> CallStatus {
    use CallStatus::*;
    use CallType::*;

    match (current, event) {
        (Idle, Ring) => Ringing,
        (Idle, Call) => Calling,
        (Ringing, Connect) => Talking,
        (Ringing, Disconnect) => MissedCall,
        (Calling, Connect) => Talking,
        (Calling, Disconnect) => NotReached,
        (Talking, Disconnect) => Finished,
        _ => current,
    }
}

/// State machine for one physical line. All access goes through the per-line
/// mutex held by [`super::LineManager`].
pub(super) struct LineFsm {
    line: u32,
    state: CallStatus,
    finish_state: Option<CallStatus>,
    call_id: Option<String>,
    timer: Option<CancellationToken>,
    last_event_type: Option<CallType>,
    last_event_at: Option<DateTime<Utc>>,
}

impl LineFsm {
    pub(super) fn new(line: u32) -> Self {
        Self {
            line,
            state: CallStatus::Idle,
            finish_state: None,
            call_id: None,
            timer: None,
            last_event_type: None,
            last_event_at: None,
        }
    }

    pub(super) fn state(&self) -> CallStatus {
        self.state
    }

    pub(super) fn finish_state(&self) -> Option<CallStatus> {
        self.finish_state
    }

    pub(super) fn call_id(&self) -> Option<String> {
        self.call_id.clone()
    }

    pub(super) fn set_timer(&mut self, timer: CancellationToken) {
        self.timer = Some(timer);
    }

    /// Applies an event. Stamps the resulting status, finish state and the
    /// lifecycle call id onto the event and returns a notice when the state
    /// actually changed.
    pub(super) fn apply_event(&mut self, event: &mut CallEvent) -> Option<TransitionNotice> {
        let old = self.state;
        let new = next_state(old, event.event_type);

        self.last_event_type = Some(event.event_type);
        self.last_event_at = Some(Utc::now());

        if new == old {
            // No-op transition; the event still reflects the line's view.
            event.status = old;
            event.finish_state = self.finish_state;
            if event.id.is_empty() {
                if let Some(id) = &self.call_id {
                    event.id = id.clone();
                }
            }
            return None;
        }

        self.cancel_timer();

        if old == CallStatus::Idle {
            self.finish_state = None;
            self.call_id = Some(if event.id.is_empty() {
                Uuid::now_v7().to_string()
            } else {
                event.id.clone()
            });
        }
        if new.is_terminal() {
            self.finish_state = Some(new);
        }
        self.state = new;

        if let Some(id) = &self.call_id {
            event.id = id.clone();
        }
        event.status = new;
        event.finish_state = self.finish_state;

        Some(TransitionNotice {
            line: self.line,
            old_state: old,
            new_state: new,
            reason: TransitionReason::Event,
            call_id: self.call_id.clone(),
            finish_state: self.finish_state,
            event: Some(event.clone()),
        })
    }

    /// Timer-driven return to idle. The current state is re-checked here so
    /// a transition that raced the timer wins; the finish state survives as
    /// the record of how the call ended, the call id does not.
    pub(super) fn complete_reset(&mut self) -> Option<TransitionNotice> {
        if !self.state.is_terminal() {
            return None;
        }

        let old = self.state;
        let call_id = self.call_id.take();
        self.timer = None;
        self.state = CallStatus::Idle;

        Some(TransitionNotice {
            line: self.line,
            old_state: old,
            new_state: CallStatus::Idle,
            reason: TransitionReason::Timeout,
            call_id,
            finish_state: self.finish_state,
            event: None,
        })
    }

    /// Forces the machine back to idle, dropping timer, finish state and
    /// call id.
    pub(super) fn force_reset(&mut self) -> Option<TransitionNotice> {
        let old = self.state;
        self.cancel_timer();
        self.state = CallStatus::Idle;
        self.finish_state = None;
        let call_id = self.call_id.take();

        if old == CallStatus::Idle {
            return None;
        }

        Some(TransitionNotice {
            line: self.line,
            old_state: old,
            new_state: CallStatus::Idle,
            reason: TransitionReason::Reset,
            call_id,
            finish_state: None,
            event: None,
        })
    }

    pub(super) fn is_valid_transition(&self, event_type: CallType) -> bool {
        next_state(self.state, event_type) != self.state
    }

    pub(super) fn valid_transitions(&self) -> Vec<CallType> {
        CallType::ALL
            .into_iter()
            .filter(|event_type| self.is_valid_transition(*event_type))
            .collect()
    }

    pub(super) fn snapshot(&self) -> FsmSnapshot {
        FsmSnapshot {
            line: self.line,
            status: self.state,
            finish_state: self.finish_state,
            call_id: self.call_id.clone(),
            valid_transitions: self.valid_transitions(),
            is_timeout_active: self.timer.is_some(),
            last_event_type: self.last_event_type,
            last_event_timestamp: self.last_event_at,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}
