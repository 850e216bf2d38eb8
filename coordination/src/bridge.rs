//! Bus bridge - unit processes publishing onto and listening to the bus
//!
//! A unit attached under its own id sends JSON event frames
//! (`{"type", "channel", "content", "payload", "coordination_id"}`, type
//! defaulting to `agent_message`) which are published with the unit as
//! sender. Every channel the unit has written to is joined, and events on
//! joined channels from other senders are pushed back to it. `history_req`
//! is answered from the [`ChannelStore`]. When the unit detaches while still
//! live somewhere, a `unit_despawn` is published for it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::archiver::{HistoryEntry, SharedChannelStore};
use crate::coordinator::SharedCoordinator;
use crate::error::{CoordinationError, CoordinationResult};
use crate::events::{Event, EventFilter, EventType, SharedEventBus, Signal, Subscription, SYSTEM_SENDER};

/// Frame type asking for a channel's history
pub const HISTORY_REQ: &str = "history_req";

/// Shared reference to BusBridge
pub type SharedBusBridge = Arc<BusBridge>;

#[derive(Debug, Deserialize)]
struct UnitFrame {
    #[serde(rename = "type", default)]
    frame_type: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    payload: Map<String, Value>,
    #[serde(default)]
    coordination_id: Option<String>,
    /// Only entries newer than this are returned by `history_req`
    #[serde(default)]
    since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPayload {
    pub history: Vec<HistoryEntry>,
}

/// Frames the bridge sends back in answer to a unit frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeReply {
    HistoryResp {
        channel: String,
        sender: String,
        payload: HistoryPayload,
    },
    Error {
        message: String,
        code: String,
    },
}

impl BridgeReply {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"type":"error","message":"{e}"}}"#))
    }
}

impl From<&CoordinationError> for BridgeReply {
    fn from(e: &CoordinationError) -> Self {
        Self::Error {
            message: e.to_string(),
            code: e.code().to_string(),
        }
    }
}

/// Publishes unit frames onto the bus and serves channel history
pub struct BusBridge {
    bus: SharedEventBus,
    coordinator: SharedCoordinator,
    store: SharedChannelStore,
}

impl BusBridge {
    pub fn new(bus: SharedEventBus, coordinator: SharedCoordinator, store: SharedChannelStore) -> Self {
        Self {
            bus,
            coordinator,
            store,
        }
    }

    /// Create a shared reference to this bridge
    pub fn shared(self) -> SharedBusBridge {
        Arc::new(self)
    }

    /// Attach a unit. Events published from here on can reach it once it
    /// joins their channel.
    pub fn attach(self: &Arc<Self>, unit_id: &str) -> BridgeSession {
        info!(unit_id, "Unit attached to bus");
        BridgeSession {
            bridge: self.clone(),
            unit_id: unit_id.to_string(),
            channels: HashSet::new(),
            events: self.bus.subscribe(EventFilter::new()),
        }
    }

    /// Publish a `unit_despawn` for `unit_id` in `channel` if it is live in
    /// an active coordination there
    fn recall(&self, channel: &str, unit_id: &str, reason: &str) -> CoordinationResult<bool> {
        let Some(coordination_id) = self.coordinator.coordination_of(channel, unit_id) else {
            return Ok(false);
        };
        self.bus.publish(
            Event::unit_despawn(channel, &coordination_id, unit_id)
                .with_payload("requested_by", unit_id)
                .with_payload("reason", reason),
        )?;
        info!(unit_id, channel, coordination_id = %coordination_id, reason, "Unit recalled");
        Ok(true)
    }
}

/// One attached unit
pub struct BridgeSession {
    bridge: SharedBusBridge,
    unit_id: String,
    channels: HashSet<String>,
    events: Subscription,
}

impl BridgeSession {
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn has_joined(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    fn wants(&self, event: &Event) -> bool {
        event.sender != self.unit_id && self.channels.contains(&event.channel)
    }

    /// Next bus event for this unit; `None` once the bus is closed
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            let event = self.events.recv().await?;
            if self.wants(&event) {
                return Some(event);
            }
        }
    }

    /// Handle one inbound frame. Returns the reply to send, if any.
    pub async fn handle_frame(&mut self, raw: &str) -> Option<BridgeReply> {
        match self.handle(raw).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(unit_id = %self.unit_id, "Unit frame rejected: {}", e);
                Some((&e).into())
            }
        }
    }

    async fn handle(&mut self, raw: &str) -> CoordinationResult<Option<BridgeReply>> {
        let frame: UnitFrame = serde_json::from_str(raw)
            .map_err(|e| CoordinationError::MalformedEnvelope(e.to_string()))?;
        let Some(channel) = frame.channel.filter(|c| !c.is_empty()) else {
            return Err(CoordinationError::MalformedEnvelope("frame without channel".into()));
        };

        let frame_type = frame.frame_type.as_deref().unwrap_or(EventType::AgentMessage.as_str());
        if frame_type == HISTORY_REQ {
            let history = self
                .bridge
                .store
                .get_history(&channel)
                .await?
                .into_iter()
                .filter(|entry| frame.since.is_none_or(|since| entry.timestamp > since))
                .collect();
            return Ok(Some(BridgeReply::HistoryResp {
                channel,
                sender: SYSTEM_SENDER.to_string(),
                payload: HistoryPayload { history },
            }));
        }

        let event_type: EventType = frame_type.parse()?;
        let mut event = Event::new(event_type, &channel, &self.unit_id);
        event.payload = frame.payload;
        self.authorize(&event)?;

        let coordination_id = frame
            .coordination_id
            .or_else(|| self.bridge.coordinator.coordination_of(&channel, &self.unit_id));
        if let Some(coordination_id) = coordination_id {
            event = event.with_coordination(coordination_id);
        }
        let content = frame
            .content
            .or_else(|| event.payload_str("content").map(str::to_string));
        if let Some(content) = content {
            event = event.with_content(content);
        }
        if event_type == EventType::UnitDespawn && event.unit_id().is_none() {
            event = event.with_payload("unit_id", self.unit_id.clone());
        }
        let recall = event_type == EventType::AgentMessage && event.signals.contains(&Signal::Despawn);

        self.bridge.bus.publish(event)?;
        if self.channels.insert(channel.clone()) {
            debug!(unit_id = %self.unit_id, channel = %channel, "Unit joined channel");
        }
        if recall {
            self.bridge.recall(&channel, &self.unit_id, "requested")?;
        }
        Ok(None)
    }

    /// Units speak for themselves only: lifecycle and completion events are
    /// the substrate's, and a unit may only retire itself
    fn authorize(&self, event: &Event) -> CoordinationResult<()> {
        let foreign = match event.event_type {
            EventType::UnitSpawn | EventType::CoordinationComplete => true,
            EventType::UnitDespawn => event.unit_id().is_some_and(|id| id != self.unit_id),
            _ => false,
        };
        if foreign {
            return Err(CoordinationError::SovereigntyViolation {
                actor: self.unit_id.clone(),
                resource: format!("{} event", event.event_type),
            });
        }
        Ok(())
    }

    /// Detach the unit, recalling it from every joined channel where it is
    /// still live. Returns how many recalls were published.
    pub fn close(self) -> usize {
        let mut recalled = 0;
        for channel in &self.channels {
            match self.bridge.recall(channel, &self.unit_id, "disconnected") {
                Ok(true) => recalled += 1,
                Ok(false) => {}
                Err(e) => warn!(unit_id = %self.unit_id, channel = %channel, "Recall failed: {}", e),
            }
        }
        info!(unit_id = %self.unit_id, recalled, "Unit detached from bus");
        recalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::{ChannelStore, MemoryStore};
    use crate::coordinator::{Coordinator, CoordinatorConfig};
    use crate::events::EventBus;

    fn bridge() -> (SharedEventBus, SharedCoordinator, SharedChannelStore, SharedBusBridge) {
        let bus = EventBus::new().shared();
        let coordinator = Coordinator::new(bus.clone(), CoordinatorConfig::default()).shared();
        let store = MemoryStore::new().shared();
        let bridge = BusBridge::new(bus.clone(), coordinator.clone(), store.clone()).shared();
        (bus, coordinator, store, bridge)
    }

    #[tokio::test]
    async fn test_frames_publish_with_unit_as_sender() {
        let (bus, _coordinator, _store, bridge) = bridge();
        let mut messages = bus.subscribe_to(Some(EventType::AgentMessage), Some("alpha"));
        let mut session = bridge.attach("zealot-1");

        let reply = session
            .handle_frame(r#"{"channel":"alpha","coordination_id":"coord-1","content":"need @archon"}"#)
            .await;
        assert_eq!(reply, None);
        assert!(session.has_joined("alpha"));

        let event = messages.recv().await.unwrap();
        assert_eq!(event.sender, "zealot-1");
        assert_eq!(event.coordination_id.as_deref(), Some("coord-1"));
        assert_eq!(event.mentions().collect::<Vec<_>>(), vec!["archon"]);
    }

    #[tokio::test]
    async fn test_joined_channels_are_pushed_back() {
        let (bus, _coordinator, _store, bridge) = bridge();
        let mut session = bridge.attach("zealot-1");
        session
            .handle_frame(r#"{"channel":"alpha","coordination_id":"coord-1","content":"hi"}"#)
            .await;

        bus.publish(Event::agent_message("beta", "archon-1", "coord-1", "elsewhere"))
            .unwrap();
        bus.publish(Event::agent_message("alpha", "archon-1", "coord-1", "welcome"))
            .unwrap();

        // Its own frame and the other channel are skipped
        let event = session.next_event().await.unwrap();
        assert_eq!(event.channel, "alpha");
        assert_eq!(event.content.as_deref(), Some("welcome"));
    }

    #[tokio::test]
    async fn test_history_request() {
        let (_bus, _coordinator, store, bridge) = bridge();
        let old = Utc::now() - chrono::Duration::seconds(60);
        for (sender, content, timestamp) in [("human", "first", old), ("zealot-1", "second", Utc::now())] {
            store
                .append(
                    "alpha",
                    HistoryEntry {
                        sender: sender.into(),
                        content: content.into(),
                        timestamp,
                    },
                )
                .await
                .unwrap();
        }
        let mut session = bridge.attach("archon-1");

        let Some(BridgeReply::HistoryResp { channel, payload, .. }) =
            session.handle_frame(r#"{"type":"history_req","channel":"alpha"}"#).await
        else {
            panic!("expected history");
        };
        assert_eq!(channel, "alpha");
        assert_eq!(payload.history.len(), 2);
        assert!(!session.has_joined("alpha"));

        let since = serde_json::json!({
            "type": "history_req",
            "channel": "alpha",
            "since": old + chrono::Duration::seconds(1),
        });
        let Some(BridgeReply::HistoryResp { payload, .. }) =
            session.handle_frame(&since.to_string()).await
        else {
            panic!("expected history");
        };
        assert_eq!(payload.history.len(), 1);
        assert_eq!(payload.history[0].content, "second");
    }

    #[tokio::test]
    async fn test_units_cannot_forge_lifecycle_events() {
        let (bus, _coordinator, _store, bridge) = bridge();
        let mut all = bus.subscribe_to(None, None);
        let mut session = bridge.attach("zealot-1");

        for raw in [
            r#"{"type":"unit_spawn","channel":"alpha","payload":{"unit_id":"zealot-2"}}"#,
            r#"{"type":"unit_despawn","channel":"alpha","coordination_id":"c","payload":{"unit_id":"archon-1"}}"#,
            r#"{"type":"coordination_complete","channel":"alpha","coordination_id":"c"}"#,
        ] {
            let reply = session.handle_frame(raw).await;
            assert!(
                matches!(reply, Some(BridgeReply::Error { ref code, .. }) if code == "SOVEREIGNTY_VIOLATION"),
                "{raw}: {reply:?}"
            );
        }
        assert!(all.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_malformed_frames_get_error_replies() {
        let (_bus, _coordinator, _store, bridge) = bridge();
        let mut session = bridge.attach("zealot-1");

        for raw in ["not json", r#"{"content":"no channel"}"#, r#"{"type":"launch","channel":"alpha"}"#] {
            let reply = session.handle_frame(raw).await;
            assert!(
                matches!(reply, Some(BridgeReply::Error { ref code, .. }) if code == "MALFORMED_ENVELOPE"),
                "{raw}: {reply:?}"
            );
        }

        // Critical type without a coordination id never enters the bus
        let reply = session.handle_frame(r#"{"channel":"alpha","content":"orphan"}"#).await;
        assert!(matches!(
            reply,
            Some(BridgeReply::Error { ref code, .. }) if code == "MISSING_COORDINATION_ID"
        ));
    }

    #[tokio::test]
    async fn test_close_recalls_live_unit() {
        let (bus, coordinator, _store, bridge) = bridge();
        coordinator.start();
        let mut despawns = bus.subscribe_to(Some(EventType::UnitDespawn), None);

        bus.publish(Event::unit_spawn("alpha", "coord-1", "zealot-1")).unwrap();
        while coordinator.coordination_of("alpha", "zealot-1").is_none() {
            tokio::task::yield_now().await;
        }

        // Coordination id is picked up from the unit's live membership
        let mut session = bridge.attach("zealot-1");
        session.handle_frame(r#"{"channel":"alpha","content":"working"}"#).await;
        assert_eq!(session.close(), 1);

        let event = despawns.recv().await.unwrap();
        assert_eq!(event.unit_id(), Some("zealot-1"));
        assert_eq!(event.coordination_id.as_deref(), Some("coord-1"));
        assert_eq!(event.payload_str("reason"), Some("disconnected"));
        coordinator.stop().await;
    }
}
