use super::*;
use crate::config::BrokerConfig;
use crate::event::{CallDirection, CallStatus, CallType};
use crate::fsm::{TransitionNotice, TransitionReason};

#[test]
fn test_topic_tree() {
    let prefix = "fritz/callmonitor";
    assert_eq!(topic_status(prefix), "fritz/callmonitor/status");
    assert_eq!(topic_line_status(prefix, 0), "fritz/callmonitor/line/0/status");
    assert_eq!(
        topic_line_last_event(prefix, 3),
        "fritz/callmonitor/line/3/last_event"
    );
    assert_eq!(
        topic_call(prefix, "0198-abc"),
        "fritz/callmonitor/call/0198-abc"
    );
    assert_eq!(topic_history(prefix), "fritz/callmonitor/history");
    assert_eq!(
        topic_fsm_status_change(prefix, 1),
        "fritz/callmonitor/fsm/line/1/status_change"
    );
    assert_eq!(topic_fsm_status(prefix, 1), "fritz/callmonitor/fsm/line/1/status");
}

#[test]
fn test_availability_payload() {
    let online: serde_json::Value =
        serde_json::to_value(AvailabilityMessage::online()).unwrap();
    assert_eq!(online["state"], "online");
    assert!(online["last_changed"].is_string());

    let offline: serde_json::Value =
        serde_json::to_value(AvailabilityMessage::offline()).unwrap();
    assert_eq!(offline["state"], "offline");
}

#[test]
fn test_status_change_message_from_notice() {
    let notice = TransitionNotice {
        line: 2,
        old_state: CallStatus::Ringing,
        new_state: CallStatus::MissedCall,
        reason: TransitionReason::Event,
        call_id: Some("call-1".to_string()),
        finish_state: Some(CallStatus::MissedCall),
        event: None,
    };
    let message = StatusChangeMessage::from(&notice);
    let value: serde_json::Value = serde_json::to_value(&message).unwrap();
    assert_eq!(value["line"], 2);
    assert_eq!(value["old_status"], "ringing");
    assert_eq!(value["new_status"], "missedCall");
    assert_eq!(value["reason"], "event");
}

#[test]
fn test_timeout_reason_serializes_with_null_event() {
    let notice = TransitionNotice {
        line: 0,
        old_state: CallStatus::Finished,
        new_state: CallStatus::Idle,
        reason: TransitionReason::Timeout,
        call_id: Some("call-1".to_string()),
        finish_state: Some(CallStatus::Finished),
        event: None,
    };
    let value: serde_json::Value =
        serde_json::to_value(StatusChangeMessage::from(&notice)).unwrap();
    assert_eq!(value["reason"], "timeout");
    assert!(value.get("event").is_none());
}

#[test]
fn test_line_status_message_omits_empty_participants() {
    let message = LineStatusMessage {
        line: 0,
        status: CallStatus::Idle,
        finish_state: Some(CallStatus::MissedCall),
        call_id: None,
        direction: Some(CallDirection::Inbound),
        caller: String::new(),
        called: String::new(),
        caller_msn: String::new(),
        called_msn: String::new(),
        trunk: String::new(),
        extension: String::new(),
        last_event: String::new(),
        timestamp: chrono::Utc::now(),
    };
    let value: serde_json::Value = serde_json::to_value(&message).unwrap();
    assert_eq!(value["status"], "idle");
    assert_eq!(value["finish_state"], "missedCall");
    assert!(value.get("caller").is_none());
    assert!(value.get("call_id").is_none());
}

#[tokio::test]
async fn test_publisher_queues_without_broker() {
    // The session object is usable before the broker connection exists;
    // publishes queue into the client channel.
    let config = BrokerConfig::default();
    let publisher = MqttPublisher::connect(&config).unwrap();

    publisher
        .publish_availability(AvailabilityState::Online)
        .await
        .unwrap();

    let event = crate::event::CallEvent {
        id: "call-1".to_string(),
        timestamp: chrono::Utc::now().fixed_offset(),
        event_type: CallType::Ring,
        direction: CallDirection::Inbound,
        line: 0,
        trunk: String::new(),
        extension: String::new(),
        caller: String::new(),
        called: String::new(),
        caller_msn: String::new(),
        called_msn: String::new(),
        duration: 0,
        status: CallStatus::Ringing,
        finish_state: None,
        raw_message: "raw".to_string(),
    };
    publisher.publish_last_event(&event).await.unwrap();

    publisher.shutdown().await.unwrap();
}

#[test]
fn test_qos_mapping() {
    assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
    assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
    assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
}
