use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::machine::{LineFsm, RESET_AFTER};
use super::{FsmSnapshot, TransitionNotice};
use crate::event::{CallEvent, CallStatus, CallType};

pub type TransitionSender = mpsc::UnboundedSender<TransitionNotice>;
pub type TransitionReceiver = mpsc::UnboundedReceiver<TransitionNotice>;

/// Owns the per-line state machines. The map lock only guards map mutation;
/// each machine carries its own mutex, and timer tasks re-enter through that
/// mutex alone.
pub struct LineManager {
    machines: RwLock<HashMap<u32, Arc<Mutex<LineFsm>>>>,
    notices: TransitionSender,
    token: CancellationToken,
}

impl LineManager {
    /// `notices` receives timer- and reset-driven transitions; event-driven
    /// transitions are returned synchronously from [`Self::process_event`].
    /// Cancelling `token` stops all pending reset timers.
    pub fn new(notices: TransitionSender, token: CancellationToken) -> Self {
        Self {
            machines: RwLock::new(HashMap::new()),
            notices,
            token,
        }
    }

    /// Runs one event through its line's machine. The event comes back
    /// stamped with status, finish state and the lifecycle call id.
    pub fn process_event(&self, event: &mut CallEvent) -> Option<TransitionNotice> {
        let machine = self.machine(event.line);
        let mut fsm = match machine.lock() {
            Ok(fsm) => fsm,
            Err(_) => return None,
        };

        let notice = fsm.apply_event(event);
        if let Some(notice) = &notice {
            debug!(
                line = notice.line,
                old = %notice.old_state,
                new = %notice.new_state,
                "line state changed"
            );
            if notice.new_state.is_terminal() {
                let timer = arm_reset_timer(machine.clone(), self.notices.clone(), &self.token);
                fsm.set_timer(timer);
            }
        }
        notice
    }

    pub fn line_state(&self, line: u32) -> CallStatus {
        self.with_machine(line, |fsm| fsm.state())
            .unwrap_or(CallStatus::Idle)
    }

    pub fn finish_state(&self, line: u32) -> Option<CallStatus> {
        self.with_machine(line, |fsm| fsm.finish_state()).flatten()
    }

    pub fn call_id(&self, line: u32) -> Option<String> {
        self.with_machine(line, |fsm| fsm.call_id()).flatten()
    }

    pub fn is_valid_transition(&self, line: u32, event_type: CallType) -> bool {
        self.with_machine(line, |fsm| fsm.is_valid_transition(event_type))
            // Lines without a machine yet are idle.
            .unwrap_or(matches!(event_type, CallType::Ring | CallType::Call))
    }

    pub fn valid_transitions(&self, line: u32) -> Vec<CallType> {
        self.with_machine(line, |fsm| fsm.valid_transitions())
            .unwrap_or_else(|| vec![CallType::Ring, CallType::Call])
    }

    pub fn snapshot(&self, line: u32) -> Option<FsmSnapshot> {
        self.with_machine(line, |fsm| fsm.snapshot())
    }

    pub fn snapshots(&self) -> Vec<FsmSnapshot> {
        let mut lines = self.active_lines();
        lines.sort_unstable();
        lines
            .into_iter()
            .filter_map(|line| self.snapshot(line))
            .collect()
    }

    pub fn active_lines(&self) -> Vec<u32> {
        match self.machines.read() {
            Ok(machines) => machines.keys().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn line_count(&self) -> usize {
        match self.machines.read() {
            Ok(machines) => machines.len(),
            Err(_) => 0,
        }
    }

    /// Forces one line back to idle; the transition is reported over the
    /// notice channel.
    pub fn reset_line(&self, line: u32) {
        if let Some(Some(notice)) = self.with_machine(line, |fsm| fsm.force_reset()) {
            let _ = self.notices.send(notice);
        }
    }

    pub fn reset_all(&self) {
        for line in self.active_lines() {
            self.reset_line(line);
        }
    }

    /// Cancels every pending reset timer. Machines stay around so a later
    /// restart of the engine sees the same line set.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    fn machine(&self, line: u32) -> Arc<Mutex<LineFsm>> {
        if let Ok(machines) = self.machines.read() {
            if let Some(machine) = machines.get(&line) {
                return machine.clone();
            }
        }
        match self.machines.write() {
            Ok(mut machines) => machines
                .entry(line)
                .or_insert_with(|| Arc::new(Mutex::new(LineFsm::new(line))))
                .clone(),
            // Poisoned map: hand out a detached machine.
            Err(_) => Arc::new(Mutex::new(LineFsm::new(line))),
        }
    }

    fn with_machine<T>(&self, line: u32, f: impl FnOnce(&mut LineFsm) -> T) -> Option<T> {
        let machine = match self.machines.read() {
            Ok(machines) => machines.get(&line).cloned()?,
            Err(_) => return None,
        };
        let result = match machine.lock() {
            Ok(mut fsm) => Some(f(&mut fsm)),
            Err(_) => None,
        };
        result
    }
}

/// Spawns the single-shot reset timer for a terminal state. The returned
/// token cancels it; the fire handler re-checks the machine state under its
/// lock, so a stale fire is a no-op.
fn arm_reset_timer(
    machine: Arc<Mutex<LineFsm>>,
    notices: TransitionSender,
    parent: &CancellationToken,
) -> CancellationToken {
    let token = parent.child_token();
    let guard = token.clone();
    tokio::spawn(async move {
        select! {
            _ = guard.cancelled() => {}
            _ = tokio::time::sleep(RESET_AFTER) => {
                let notice = match machine.lock() {
                    Ok(mut fsm) => fsm.complete_reset(),
                    Err(_) => None,
                };
                if let Some(notice) = notice {
                    let _ = notices.send(notice);
                }
            }
        }
    });
    token
}
