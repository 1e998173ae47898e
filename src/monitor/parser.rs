use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, FixedOffset};
use chrono_tz::Tz;
use uuid::Uuid;

use crate::event::{CallDirection, CallEvent, CallStatus, CallType};
use crate::normalize::{detect_msn, normalize_number, parse_timestamp};

/// Per-line lifecycle context carried between records.
///
/// CONNECT and DISCONNECT records omit trunk, direction and participants;
/// they are spliced back in from the context recorded at RING/CALL time.
#[derive(Debug, Clone)]
struct LineContext {
    call_id: String,
    direction: CallDirection,
    trunk: String,
    caller: String,
    called: String,
}

/// Stateful parser for the router's semicolon-delimited records.
///
/// One instance per connection; records must be fed in arrival order so the
/// per-line context maps stay consistent with the router's view.
pub struct RecordParser {
    tz: Tz,
    country_code: String,
    area_code: String,
    msns: Vec<String>,
    contexts: HashMap<u32, LineContext>,
}

impl RecordParser {
    pub fn new(tz: Tz, country_code: String, area_code: String, msns: Vec<String>) -> Self {
        Self {
            tz,
            country_code,
            area_code,
            msns,
            contexts: HashMap::new(),
        }
    }

    /// Parses one record into a fully enriched event.
    pub fn parse(&mut self, record: &str) -> Result<CallEvent> {
        let raw = record.trim();
        let fields: Vec<&str> = raw.split(';').map(str::trim).collect();
        if fields.len() < 3 {
            bail!("record has {} fields, need at least 3: {:?}", fields.len(), raw);
        }

        let timestamp = parse_timestamp(fields[0], self.tz);
        let event_type = match fields[1].to_ascii_uppercase().as_str() {
            "RING" => CallType::Ring,
            "CALL" => CallType::Call,
            "CONNECT" => CallType::Connect,
            "DISCONNECT" => CallType::Disconnect,
            other => bail!("unknown record type {:?}: {:?}", other, raw),
        };
        let line: u32 = fields[2]
            .parse()
            .with_context(|| format!("invalid line number {:?}: {:?}", fields[2], raw))?;

        match event_type {
            CallType::Ring => self.build_ring(raw, timestamp, line, &fields),
            CallType::Call => self.build_call(raw, timestamp, line, &fields),
            CallType::Connect => self.build_connect(raw, timestamp, line, &fields),
            CallType::Disconnect => self.build_disconnect(raw, timestamp, line, &fields),
        }
    }

    /// Number of lines with an open lifecycle context.
    pub fn open_contexts(&self) -> usize {
        self.contexts.len()
    }

    fn build_ring(
        &mut self,
        raw: &str,
        timestamp: DateTime<FixedOffset>,
        line: u32,
        fields: &[&str],
    ) -> Result<CallEvent> {
        if fields.len() < 5 {
            return Err(short_record("RING", 5, fields.len(), raw));
        }

        let caller = self.normalize(fields[3]);
        let called = self.normalize(fields[4]);
        let trunk = fields.get(5).map(|f| f.to_string()).unwrap_or_default();
        let context = LineContext {
            call_id: Uuid::now_v7().to_string(),
            direction: CallDirection::Inbound,
            trunk: trunk.clone(),
            caller: caller.clone(),
            called: called.clone(),
        };
        let event = self.assemble(
            raw,
            timestamp,
            CallType::Ring,
            line,
            &context,
            String::new(),
            0,
        );
        self.contexts.insert(line, context);
        Ok(event)
    }

    fn build_call(
        &mut self,
        raw: &str,
        timestamp: DateTime<FixedOffset>,
        line: u32,
        fields: &[&str],
    ) -> Result<CallEvent> {
        if fields.len() < 6 {
            return Err(short_record("CALL", 6, fields.len(), raw));
        }

        let extension = fields[3].to_string();
        let caller = self.normalize(fields[4]);
        let called = self.normalize(fields[5]);
        let trunk = fields.get(6).map(|f| f.to_string()).unwrap_or_default();
        let context = LineContext {
            call_id: Uuid::now_v7().to_string(),
            direction: CallDirection::Outbound,
            trunk: trunk.clone(),
            caller: caller.clone(),
            called: called.clone(),
        };
        let event = self.assemble(raw, timestamp, CallType::Call, line, &context, extension, 0);
        self.contexts.insert(line, context);
        Ok(event)
    }

    fn build_connect(
        &mut self,
        raw: &str,
        timestamp: DateTime<FixedOffset>,
        line: u32,
        fields: &[&str],
    ) -> Result<CallEvent> {
        if fields.len() < 4 {
            return Err(short_record("CONNECT", 4, fields.len(), raw));
        }

        let extension = fields[3].to_string();
        let context = self.contexts.get(&line).cloned().unwrap_or_else(|| {
            // Process started mid-call: no lifecycle to splice from.
            LineContext {
                call_id: String::new(),
                direction: CallDirection::Inbound,
                trunk: String::new(),
                caller: String::new(),
                called: String::new(),
            }
        });
        Ok(self.assemble(raw, timestamp, CallType::Connect, line, &context, extension, 0))
    }

    fn build_disconnect(
        &mut self,
        raw: &str,
        timestamp: DateTime<FixedOffset>,
        line: u32,
        fields: &[&str],
    ) -> Result<CallEvent> {
        let duration: u64 = fields
            .get(3)
            .and_then(|f| f.parse().ok())
            .unwrap_or_default();
        let context = self.contexts.remove(&line).unwrap_or_else(|| LineContext {
            call_id: String::new(),
            direction: CallDirection::Inbound,
            trunk: String::new(),
            caller: String::new(),
            called: String::new(),
        });
        Ok(self.assemble(
            raw,
            timestamp,
            CallType::Disconnect,
            line,
            &context,
            String::new(),
            duration,
        ))
    }

    fn assemble(
        &self,
        raw: &str,
        timestamp: DateTime<FixedOffset>,
        event_type: CallType,
        line: u32,
        context: &LineContext,
        extension: String,
        duration: u64,
    ) -> CallEvent {
        CallEvent {
            id: context.call_id.clone(),
            timestamp,
            event_type,
            direction: context.direction,
            line,
            trunk: context.trunk.clone(),
            extension,
            caller: context.caller.clone(),
            called: context.called.clone(),
            caller_msn: detect_msn(&context.caller, &self.msns),
            called_msn: detect_msn(&context.called, &self.msns),
            duration,
            status: CallStatus::Idle,
            finish_state: None,
            raw_message: raw.to_string(),
        }
    }

    fn normalize(&self, raw: &str) -> String {
        normalize_number(raw, &self.country_code, &self.area_code)
    }
}

fn short_record(kind: &str, want: usize, got: usize, raw: &str) -> anyhow::Error {
    anyhow!("{} record needs at least {} fields, got {}: {:?}", kind, want, got, raw)
}
