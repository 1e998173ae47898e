use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Record type emitted by the router's call-monitor service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Ring,
    Call,
    Connect,
    Disconnect,
}

impl CallType {
    pub const ALL: [CallType; 4] = [
        CallType::Ring,
        CallType::Call,
        CallType::Connect,
        CallType::Disconnect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Ring => "ring",
            CallType::Call => "call",
            CallType::Connect => "connect",
            CallType::Disconnect => "disconnect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Status of a phone line as tracked by the per-line state machine.
///
/// `MessageBox` is part of the alphabet the router can report but no
/// transition produces it; it is carried for wire compatibility only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallStatus {
    Idle,
    Ringing,
    Calling,
    Talking,
    NotReached,
    MissedCall,
    Finished,
    MessageBox,
}

impl CallStatus {
    pub const ALL: [CallStatus; 8] = [
        CallStatus::Idle,
        CallStatus::Ringing,
        CallStatus::Calling,
        CallStatus::Talking,
        CallStatus::NotReached,
        CallStatus::MissedCall,
        CallStatus::Finished,
        CallStatus::MessageBox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Ringing => "ringing",
            CallStatus::Calling => "calling",
            CallStatus::Talking => "talking",
            CallStatus::NotReached => "notReached",
            CallStatus::MissedCall => "missedCall",
            CallStatus::Finished => "finished",
            CallStatus::MessageBox => "messageBox",
        }
    }

    /// Terminal states auto-reset to idle after the reset timeout.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::NotReached | CallStatus::MissedCall | CallStatus::Finished
        )
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CallStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CallStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown call status: {}", s))
    }
}

/// A single call-monitor record after parsing and enrichment.
///
/// Empty strings stand for absent optional fields; the store maps them to
/// NULL columns and the JSON payloads omit them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    /// Stable call identifier, allocated at the first record of a lifecycle.
    pub id: String,
    pub timestamp: DateTime<FixedOffset>,
    #[serde(rename = "type")]
    pub event_type: CallType,
    pub direction: CallDirection,
    pub line: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trunk: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extension: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub caller: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub called: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub caller_msn: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub called_msn: String,
    /// Call duration in seconds, meaningful on disconnect records only.
    #[serde(default)]
    pub duration: u64,
    /// Line status after this event went through the state machine.
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_state: Option<CallStatus>,
    /// Verbatim record for audit.
    pub raw_message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_round_trip() {
        for status in CallStatus::ALL {
            let parsed: CallStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<CallStatus>().is_err());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&CallStatus::MissedCall).unwrap(),
            "\"missedCall\""
        );
        assert_eq!(
            serde_json::to_string(&CallStatus::NotReached).unwrap(),
            "\"notReached\""
        );
        assert_eq!(serde_json::to_string(&CallStatus::Idle).unwrap(), "\"idle\"");
    }

    #[test]
    fn test_event_json_omits_empty_fields() {
        let event = CallEvent {
            id: "0198c0de-0000-7000-8000-000000000001".to_string(),
            timestamp: chrono::FixedOffset::east_opt(3600)
                .unwrap()
                .with_ymd_and_hms(2025, 9, 21, 15, 30, 45)
                .unwrap(),
            event_type: CallType::Ring,
            direction: CallDirection::Inbound,
            line: 0,
            trunk: "SIP0".to_string(),
            extension: String::new(),
            caller: "+4930123456789".to_string(),
            called: "+4930987654321".to_string(),
            caller_msn: String::new(),
            called_msn: String::new(),
            duration: 0,
            status: CallStatus::Ringing,
            finish_state: None,
            raw_message: "raw".to_string(),
        };

        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "ring");
        assert_eq!(value["status"], "ringing");
        assert!(value.get("extension").is_none());
        assert!(value.get("caller_msn").is_none());
        assert!(value.get("finish_state").is_none());
    }
}
