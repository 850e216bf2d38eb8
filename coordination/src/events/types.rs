//! Event types flowing through the bus
//!
//! An [`Event`] is immutable once published. Its wire shape is
//! `{type, channel, sender, payload, coordination_id, content, signals, timestamp}`
//! with `coordination_id` and `content` serialised as `null` when absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::parser::parse_signals;
use crate::error::{CoordinationError, CoordinationResult};
use crate::units::UnitCategory;

/// Sender name used for events the substrate itself emits
pub const SYSTEM_SENDER: &str = "system";

/// Event type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentMessage,
    UnitSpawn,
    UnitDespawn,
    CoordinationComplete,
    ToolOutput,
    SystemMessage,
}

impl EventType {
    pub fn all() -> &'static [EventType] {
        &[
            Self::AgentMessage,
            Self::UnitSpawn,
            Self::UnitDespawn,
            Self::CoordinationComplete,
            Self::ToolOutput,
            Self::SystemMessage,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentMessage => "agent_message",
            Self::UnitSpawn => "unit_spawn",
            Self::UnitDespawn => "unit_despawn",
            Self::CoordinationComplete => "coordination_complete",
            Self::ToolOutput => "tool_output",
            Self::SystemMessage => "system_message",
        }
    }

    /// Critical types may not enter the bus without a coordination id
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::AgentMessage | Self::ToolOutput)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoordinationError::MalformedEnvelope(format!("unknown event type {s:?}")))
    }
}

/// Structured annotation extracted from event content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    /// `@token` naming a unit category, persona or unit id
    Mention { agent_name: String },
    /// `!despawn` guardrail: the sender asks to be recalled
    Despawn,
}

impl Signal {
    pub fn mention(agent_name: impl Into<String>) -> Self {
        Self::Mention {
            agent_name: agent_name.into(),
        }
    }

    /// Canonical category of a mention, if it resolves
    pub fn mentioned_category(&self) -> Option<UnitCategory> {
        match self {
            Self::Mention { agent_name } => UnitCategory::resolve(agent_name),
            _ => None,
        }
    }
}

/// Canonical coordination event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub channel: String,
    pub sender: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub coordination_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub signals: Vec<Signal>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, channel: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            event_type,
            channel: channel.into(),
            sender: sender.into(),
            payload: Map::new(),
            coordination_id: None,
            content: None,
            signals: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Message event; signals are parsed from the content
    pub fn agent_message(
        channel: impl Into<String>,
        sender: impl Into<String>,
        coordination_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(EventType::AgentMessage, channel, sender)
            .with_coordination(coordination_id)
            .with_content(content)
    }

    pub fn unit_spawn(
        channel: impl Into<String>,
        coordination_id: impl Into<String>,
        unit_id: impl Into<String>,
    ) -> Self {
        Self::new(EventType::UnitSpawn, channel, SYSTEM_SENDER)
            .with_coordination(coordination_id)
            .with_payload("unit_id", unit_id.into())
    }

    pub fn unit_despawn(
        channel: impl Into<String>,
        coordination_id: impl Into<String>,
        unit_id: impl Into<String>,
    ) -> Self {
        Self::new(EventType::UnitDespawn, channel, SYSTEM_SENDER)
            .with_coordination(coordination_id)
            .with_payload("unit_id", unit_id.into())
    }

    pub fn coordination_complete(
        channel: impl Into<String>,
        coordination_id: impl Into<String>,
    ) -> Self {
        Self::new(EventType::CoordinationComplete, channel, SYSTEM_SENDER)
            .with_coordination(coordination_id)
            .with_payload("result", "Coordination finished successfully.")
    }

    pub fn with_coordination(mut self, coordination_id: impl Into<String>) -> Self {
        self.coordination_id = Some(coordination_id.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Attach content and re-derive signals from it
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        let content = content.into();
        self.signals = parse_signals(&content);
        self.content = Some(content);
        self
    }

    /// String payload field
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Unit id carried by spawn/despawn payloads
    pub fn unit_id(&self) -> Option<&str> {
        self.payload_str("unit_id")
    }

    pub fn mentions(&self) -> impl Iterator<Item = &str> {
        self.signals.iter().filter_map(|s| match s {
            Signal::Mention { agent_name } => Some(agent_name.as_str()),
            _ => None,
        })
    }

    /// Reject critical events that lack a coordination id
    pub fn validate(&self) -> CoordinationResult<()> {
        let missing = self
            .coordination_id
            .as_deref()
            .map(str::is_empty)
            .unwrap_or(true);
        if self.event_type.is_critical() && missing {
            return Err(CoordinationError::MissingCoordinationId(
                self.event_type.as_str().to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape_keeps_null_fields() {
        let event = Event::new(EventType::SystemMessage, "alpha", "system");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "system_message");
        assert_eq!(value["channel"], "alpha");
        assert!(value["coordination_id"].is_null());
        assert!(value["content"].is_null());
        assert!(value["payload"].is_object());
    }

    #[test]
    fn test_content_derives_signals() {
        let event = Event::agent_message("alpha", "zealot-1", "coord-1", "need @archon and @tassadar");
        let mentions: Vec<&str> = event.mentions().collect();
        assert_eq!(mentions, vec!["archon", "tassadar"]);
        assert_eq!(
            event.signals[1].mentioned_category(),
            Some(UnitCategory::Conclave)
        );
    }

    #[test]
    fn test_validate_critical_types() {
        let missing = Event::new(EventType::ToolOutput, "alpha", "zealot-1");
        assert_eq!(
            missing.validate(),
            Err(CoordinationError::MissingCoordinationId("tool_output".into()))
        );

        let empty = Event::new(EventType::AgentMessage, "alpha", "zealot-1").with_coordination("");
        assert!(empty.validate().is_err());

        let spawn = Event::new(EventType::UnitSpawn, "alpha", "system");
        assert!(spawn.validate().is_ok());
    }

    #[test]
    fn test_event_type_parse() {
        for event_type in EventType::all() {
            assert_eq!(event_type.as_str().parse::<EventType>(), Ok(*event_type));
        }
        assert!(matches!(
            "agent_spawn".parse::<EventType>(),
            Err(CoordinationError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_deserialize_from_wire() {
        let raw = r#"{"type":"unit_spawn","channel":"alpha","sender":"system",
            "payload":{"unit_id":"probe-1"},"coordination_id":"coord-1","content":null}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event_type, EventType::UnitSpawn);
        assert_eq!(event.unit_id(), Some("probe-1"));
        assert!(event.signals.is_empty());
    }
}
