//! The call lifecycle engine: one task that takes parsed events in arrival
//! order, advances the per-line machine, persists the transition and fans
//! the derived state out to the broker. Sink order is fixed (machine, then
//! store, then broker) and a later sink failing never unwinds an earlier
//! one. Timer-driven resets arrive over the manager's notice channel and
//! are serialized with the event stream.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::event::{CallEvent, CallStatus};
use crate::fsm::{LineManager, TransitionNotice, TransitionReason, TransitionReceiver};
use crate::monitor::CallEventReceiver;
use crate::mqtt::{CallHistoryMessage, LineStatusMessage, StatusChangeMessage, StatusPublisher};
use crate::store::CallStore;

pub struct CallEngine {
    manager: Arc<LineManager>,
    store: CallStore,
    publisher: Arc<dyn StatusPublisher>,
    history: CallHistory,
    last_events: HashMap<u32, CallEvent>,
    debug_topics: bool,
    notices: TransitionReceiver,
}

impl CallEngine {
    pub fn new(
        store: CallStore,
        publisher: Arc<dyn StatusPublisher>,
        token: CancellationToken,
        history_size: usize,
        debug_topics: bool,
    ) -> Self {
        let (notice_tx, notice_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            manager: Arc::new(LineManager::new(notice_tx, token)),
            store,
            publisher,
            history: CallHistory::new(history_size),
            last_events: HashMap::new(),
            debug_topics,
            notices: notice_rx,
        }
    }

    pub fn manager(&self) -> Arc<LineManager> {
        self.manager.clone()
    }

    /// Drains events and timer notices until the event channel closes or the
    /// token fires. Event N is fully applied (machine, store, broker) before
    /// event N+1 is taken off the channel.
    pub async fn run(
        &mut self,
        events: &mut CallEventReceiver,
        token: CancellationToken,
    ) -> Result<()> {
        loop {
            select! {
                _ = token.cancelled() => break,
                Some(notice) = self.notices.recv() => self.apply_notice(notice).await,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        self.manager.shutdown();
        info!("call engine stopped");
        Ok(())
    }

    /// Applies one parsed event. Public so scenario tests can drive the
    /// engine without a socket.
    pub async fn handle_event(&mut self, mut event: CallEvent) {
        let notice = self.manager.process_event(&mut event);

        match &notice {
            Some(notice) => self.persist_transition(notice, &event).await,
            // Not in the transition table for the current state: no store
            // write, but the event is still audited below.
            None => warn!(
                line = event.line,
                event_type = event.event_type.as_str(),
                status = %event.status,
                "event does not advance line state, ignoring"
            ),
        }

        self.history.add(event.clone());

        if let Err(e) = self.publisher.publish_last_event(&event).await {
            warn!(error = %e, line = event.line, "failed to publish last event");
        }

        let message = self.line_status_message(event.line, Some(&event));
        if let Err(e) = self.publisher.publish_line_status(&message).await {
            warn!(error = %e, line = event.line, "failed to publish line status");
        }

        let call_id = notice
            .as_ref()
            .and_then(|notice| notice.call_id.clone())
            .or_else(|| self.manager.call_id(event.line));
        if let Some(call_id) = call_id {
            if let Err(e) = self.publisher.publish_call_status(&call_id, &message).await {
                warn!(error = %e, call_id = %call_id, "failed to publish call status");
            }
        }

        if let Err(e) = self.publisher.publish_history(&self.history.message()).await {
            warn!(error = %e, "failed to publish call history");
        }

        if let Some(notice) = &notice {
            self.publish_debug(notice).await;
        }

        self.last_events.insert(event.line, event);
    }

    /// Applies a timer- or reset-driven transition reported by the manager.
    async fn apply_notice(&mut self, notice: TransitionNotice) {
        if matches!(notice.reason, TransitionReason::Timeout) {
            if let (Some(call_id), Some(finish)) = (&notice.call_id, notice.finish_state) {
                if let Err(e) = self.store.record_finish_state(call_id, finish).await {
                    warn!(error = %e, call_id = %call_id, "failed to persist finish state");
                }
            }
        }

        let message = self.line_status_message(notice.line, None);
        if let Err(e) = self.publisher.publish_line_status(&message).await {
            warn!(error = %e, line = notice.line, "failed to publish line status");
        }
        if let Some(call_id) = &notice.call_id {
            if let Err(e) = self.publisher.publish_call_status(call_id, &message).await {
                warn!(error = %e, call_id = %call_id, "failed to publish call status");
            }
        }

        self.publish_debug(&notice).await;
    }

    async fn persist_transition(&self, notice: &TransitionNotice, event: &CallEvent) {
        let Some(call_id) = &notice.call_id else {
            return;
        };

        let result = if notice.old_state == CallStatus::Idle {
            self.store
                .insert_call(call_id, notice.line, notice.new_state, event)
                .await
        } else {
            self.store
                .update_on_transition(call_id, notice.new_state, event)
                .await
        };

        if let Err(e) = result {
            // The machine state stands; the next successful write converges.
            warn!(error = %e, call_id = %call_id, "failed to persist call transition");
        }
    }

    async fn publish_debug(&self, notice: &TransitionNotice) {
        if !self.debug_topics {
            return;
        }

        let change = StatusChangeMessage::from(notice);
        if let Err(e) = self.publisher.publish_status_change(&change).await {
            warn!(error = %e, line = notice.line, "failed to publish fsm status change");
        }
        if let Some(snapshot) = self.manager.snapshot(notice.line) {
            if let Err(e) = self.publisher.publish_fsm_status(&snapshot).await {
                warn!(error = %e, line = notice.line, "failed to publish fsm status");
            }
        }
    }

    fn line_status_message(&self, line: u32, event: Option<&CallEvent>) -> LineStatusMessage {
        let source = event.or_else(|| self.last_events.get(&line));
        LineStatusMessage {
            line,
            status: self.manager.line_state(line),
            finish_state: self.manager.finish_state(line),
            call_id: self.manager.call_id(line),
            direction: source.map(|event| event.direction),
            caller: source.map(|event| event.caller.clone()).unwrap_or_default(),
            called: source.map(|event| event.called.clone()).unwrap_or_default(),
            caller_msn: source
                .map(|event| event.caller_msn.clone())
                .unwrap_or_default(),
            called_msn: source
                .map(|event| event.called_msn.clone())
                .unwrap_or_default(),
            trunk: source.map(|event| event.trunk.clone()).unwrap_or_default(),
            extension: source
                .map(|event| event.extension.clone())
                .unwrap_or_default(),
            last_event: source
                .map(|event| event.raw_message.clone())
                .unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }
}

/// Bounded in-memory history of recent events, newest first.
struct CallHistory {
    calls: VecDeque<CallEvent>,
    max_size: usize,
}

impl CallHistory {
    fn new(max_size: usize) -> Self {
        Self {
            calls: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    fn add(&mut self, event: CallEvent) {
        self.calls.push_front(event);
        self.calls.truncate(self.max_size);
    }

    fn message(&self) -> CallHistoryMessage {
        CallHistoryMessage {
            calls: self.calls.iter().cloned().collect(),
            max_size: self.max_size,
            updated_at: Utc::now(),
        }
    }
}
