//! End-to-end scenarios: call-monitor records through parser, engine,
//! in-memory database and a recording publisher standing in for the broker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fritz2mqtt::engine::CallEngine;
use fritz2mqtt::event::CallEvent;
use fritz2mqtt::fsm::FsmSnapshot;
use fritz2mqtt::monitor::RecordParser;
use fritz2mqtt::mqtt::{
    self, AvailabilityState, CallHistoryMessage, LineStatusMessage, StatusChangeMessage,
    StatusPublisher,
};
use fritz2mqtt::store::CallStore;

const PREFIX: &str = "fritz/callmonitor";

/// Captures every publish; retained topics keep only the latest payload,
/// mirroring broker retention.
#[derive(Default)]
struct RecordingPublisher {
    retained: Mutex<HashMap<String, serde_json::Value>>,
    log: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingPublisher {
    fn record<T: serde::Serialize>(&self, topic: String, retain: bool, payload: &T) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        if retain {
            self.retained
                .lock()
                .unwrap()
                .insert(topic.clone(), value.clone());
        }
        self.log.lock().unwrap().push((topic, value));
        Ok(())
    }

    fn retained(&self, topic: &str) -> Option<serde_json::Value> {
        self.retained.lock().unwrap().get(topic).cloned()
    }

    /// (old, new) pairs seen on the FSM debug topic for one line.
    fn transitions(&self, line: u32) -> Vec<(String, String)> {
        let topic = mqtt::topic_fsm_status_change(PREFIX, line);
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == topic)
            .map(|(_, value)| {
                (
                    value["old_status"].as_str().unwrap_or_default().to_string(),
                    value["new_status"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

#[async_trait]
impl StatusPublisher for RecordingPublisher {
    async fn publish_availability(&self, state: AvailabilityState) -> Result<()> {
        let payload = serde_json::json!({
            "state": match state {
                AvailabilityState::Online => "online",
                AvailabilityState::Offline => "offline",
            },
        });
        self.record(mqtt::topic_status(PREFIX), true, &payload)
    }

    async fn publish_line_status(&self, message: &LineStatusMessage) -> Result<()> {
        self.record(mqtt::topic_line_status(PREFIX, message.line), true, message)
    }

    async fn publish_last_event(&self, event: &CallEvent) -> Result<()> {
        self.record(mqtt::topic_line_last_event(PREFIX, event.line), true, event)
    }

    async fn publish_call_status(&self, call_id: &str, message: &LineStatusMessage) -> Result<()> {
        self.record(mqtt::topic_call(PREFIX, call_id), true, message)
    }

    async fn publish_history(&self, message: &CallHistoryMessage) -> Result<()> {
        self.record(mqtt::topic_history(PREFIX), true, message)
    }

    async fn publish_status_change(&self, message: &StatusChangeMessage) -> Result<()> {
        self.record(
            mqtt::topic_fsm_status_change(PREFIX, message.line),
            false,
            message,
        )
    }

    async fn publish_fsm_status(&self, snapshot: &FsmSnapshot) -> Result<()> {
        self.record(mqtt::topic_fsm_status(PREFIX, snapshot.line), false, snapshot)
    }

    async fn shutdown(&self) -> Result<()> {
        self.publish_availability(AvailabilityState::Offline).await
    }
}

struct Harness {
    parser: RecordParser,
    events: mpsc::UnboundedSender<CallEvent>,
    store: CallStore,
    publisher: Arc<RecordingPublisher>,
    token: CancellationToken,
    engine_task: tokio::task::JoinHandle<Result<()>>,
}

impl Harness {
    async fn start() -> Self {
        let store = CallStore::connect("sqlite::memory:").await.unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let token = CancellationToken::new();

        let mut engine = CallEngine::new(
            store.clone(),
            publisher.clone(),
            token.child_token(),
            50,
            true,
        );
        let (events, mut event_rx) = mpsc::unbounded_channel();
        let engine_token = token.child_token();
        let engine_task =
            tokio::spawn(async move { engine.run(&mut event_rx, engine_token).await });

        let parser = RecordParser::new(
            chrono_tz::Europe::Berlin,
            "49".to_string(),
            "30".to_string(),
            vec![
                "990133".to_string(),
                "990134".to_string(),
                "3698237".to_string(),
            ],
        );

        Self {
            parser,
            events,
            store,
            publisher,
            token,
            engine_task,
        }
    }

    /// Parses a record and hands it to the engine, returning the parsed
    /// event for its call id.
    fn feed(&mut self, record: &str) -> CallEvent {
        let event = self.parser.parse(record).unwrap();
        self.events.send(event.clone()).unwrap();
        event
    }

    /// Waits out the 1 s terminal-state auto reset plus scheduling slack.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(1400)).await;
    }

    async fn stop(self) {
        self.token.cancel();
        let _ = self.engine_task.await;
    }
}

#[tokio::test]
async fn test_incoming_answered_call() {
    let mut h = Harness::start().await;

    let ring = h.feed("21.09.25 15:30:45;RING;0;01784567890;990134;SIP1;");
    h.feed("21.09.25 15:30:50;CONNECT;0;23;01784567890");
    h.feed("21.09.25 15:31:50;DISCONNECT;0;60;");
    h.settle().await;

    let call = h.store.get_call(&ring.id).await.unwrap().unwrap();
    assert_eq!(call.status, "finished");
    assert_eq!(call.finish_state.as_deref(), Some("finished"));
    assert_eq!(call.caller.as_deref(), Some("+491784567890"));
    assert_eq!(call.called.as_deref(), Some("+4930990134"));
    assert_eq!(call.called_msn.as_deref(), Some("990134"));
    assert_eq!(call.trunk.as_deref(), Some("SIP1"));
    assert_eq!(call.duration, Some(60));
    let start = call.start_timestamp.unwrap();
    let connected = call.connect_timestamp.unwrap();
    let ended = call.end_timestamp.unwrap();
    assert!(start <= connected && connected <= ended);

    // Full traversal, including the timer-driven return to idle.
    assert_eq!(
        h.publisher.transitions(0),
        vec![
            ("idle".to_string(), "ringing".to_string()),
            ("ringing".to_string(), "talking".to_string()),
            ("talking".to_string(), "finished".to_string()),
            ("finished".to_string(), "idle".to_string()),
        ]
    );

    // The retained line status reflects the final state.
    let status = h
        .publisher
        .retained(&mqtt::topic_line_status(PREFIX, 0))
        .unwrap();
    assert_eq!(status["status"], "idle");
    assert_eq!(status["finish_state"], "finished");

    // The retained call document survives under the stable id.
    let call_doc = h
        .publisher
        .retained(&mqtt::topic_call(PREFIX, &ring.id))
        .unwrap();
    assert_eq!(call_doc["line"], 0);

    h.stop().await;
}

#[tokio::test]
async fn test_missed_call() {
    let mut h = Harness::start().await;

    let ring = h.feed("09.09.25 13:50:00;RING;0;123456789;987654321;SIP0");
    h.feed("09.09.25 13:50:05;DISCONNECT;0;0;");
    h.settle().await;

    let call = h.store.get_call(&ring.id).await.unwrap().unwrap();
    assert_eq!(call.status, "missedCall");
    assert_eq!(call.finish_state.as_deref(), Some("missedCall"));
    // A zero duration is not recorded.
    assert_eq!(call.duration, None);

    assert_eq!(
        h.publisher.transitions(0),
        vec![
            ("idle".to_string(), "ringing".to_string()),
            ("ringing".to_string(), "missedCall".to_string()),
            ("missedCall".to_string(), "idle".to_string()),
        ]
    );

    h.stop().await;
}

#[tokio::test]
async fn test_outgoing_not_reached_call() {
    let mut h = Harness::start().await;

    let call_event = h.feed("21.09.25 15:00:00;CALL;1;2;987654321;123456789;SIP1");
    h.feed("21.09.25 15:00:10;DISCONNECT;1;0;");
    h.settle().await;

    let call = h.store.get_call(&call_event.id).await.unwrap().unwrap();
    assert_eq!(call.line, 1);
    assert_eq!(call.status, "notReached");
    assert_eq!(call.finish_state.as_deref(), Some("notReached"));

    let status = h
        .publisher
        .retained(&mqtt::topic_line_status(PREFIX, 1))
        .unwrap();
    assert_eq!(status["direction"], "outbound");

    assert_eq!(
        h.publisher.transitions(1),
        vec![
            ("idle".to_string(), "calling".to_string()),
            ("calling".to_string(), "notReached".to_string()),
            ("notReached".to_string(), "idle".to_string()),
        ]
    );

    h.stop().await;
}

#[tokio::test]
async fn test_disconnect_without_prior_lifecycle() {
    let mut h = Harness::start().await;

    h.feed("09.09.25 13:51:39;DISCONNECT;0;7;");
    tokio::time::sleep(Duration::from_millis(200)).await;

    // No lifecycle, no row, no transition; the event is still audited.
    assert!(h.publisher.transitions(0).is_empty());
    assert_eq!(h.store.get_calls_by_line(0, 10).await.unwrap().len(), 0);

    let last_event = h
        .publisher
        .retained(&mqtt::topic_line_last_event(PREFIX, 0))
        .unwrap();
    assert_eq!(last_event["type"], "disconnect");
    assert_eq!(last_event["duration"], 7);

    let status = h
        .publisher
        .retained(&mqtt::topic_line_status(PREFIX, 0))
        .unwrap();
    assert_eq!(status["status"], "idle");

    h.stop().await;
}

#[tokio::test]
async fn test_concurrent_lifecycles_on_distinct_lines() {
    let mut h = Harness::start().await;

    let ring = h.feed("21.09.25 15:30:45;RING;0;123456789;987654321;SIP0");
    let outgoing = h.feed("21.09.25 15:30:46;CALL;1;2;987654321;123456789;SIP1");
    h.feed("21.09.25 15:30:50;DISCONNECT;1;0;");
    h.feed("21.09.25 15:30:55;DISCONNECT;0;0;");
    h.settle().await;

    assert_ne!(ring.id, outgoing.id);

    let call0 = h.store.get_call(&ring.id).await.unwrap().unwrap();
    assert_eq!(call0.line, 0);
    assert_eq!(call0.finish_state.as_deref(), Some("missedCall"));

    let call1 = h.store.get_call(&outgoing.id).await.unwrap().unwrap();
    assert_eq!(call1.line, 1);
    assert_eq!(call1.finish_state.as_deref(), Some("notReached"));

    assert_eq!(h.store.get_calls_by_line(0, 10).await.unwrap().len(), 1);
    assert_eq!(h.store.get_calls_by_line(1, 10).await.unwrap().len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_history_accumulates_newest_first() {
    let mut h = Harness::start().await;

    h.feed("21.09.25 15:30:45;RING;0;123456789;987654321;SIP0");
    h.feed("21.09.25 15:30:50;DISCONNECT;0;0;");
    h.settle().await;
    h.feed("21.09.25 15:40:00;CALL;1;2;987654321;123456789;SIP1");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let history = h.publisher.retained(&mqtt::topic_history(PREFIX)).unwrap();
    let calls = history["calls"].as_array().unwrap();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0]["type"], "call");
    assert_eq!(history["max_size"], 50);

    h.stop().await;
}

#[tokio::test]
async fn test_shutdown_converges_availability_to_offline() {
    let h = Harness::start().await;

    h.publisher
        .publish_availability(AvailabilityState::Online)
        .await
        .unwrap();
    let status = h.publisher.retained(&mqtt::topic_status(PREFIX)).unwrap();
    assert_eq!(status["state"], "online");

    h.publisher.shutdown().await.unwrap();
    let status = h.publisher.retained(&mqtt::topic_status(PREFIX)).unwrap();
    assert_eq!(status["state"], "offline");

    h.stop().await;
}
