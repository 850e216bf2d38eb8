//! Gateway - engine-facing command surface
//!
//! A session must open with `{"type":"engine_req"}`; the gateway answers
//! `{"type":"engine_ack"}` and only then accepts command frames. Visions
//! start a fresh coordination effort and are announced as a human message
//! mentioning the configured roster, so every spawn still passes through the
//! Observer's admission control.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::claims::{ClaimRegistry, WorkClaim};
use crate::coordinator::SharedCoordinator;
use crate::error::{CoordinationError, CoordinationResult};
use crate::events::{Event, SharedEventBus};
use crate::units::UnitCategory;

/// Channel carrying engine commands
pub const GATEWAY_COMMANDS: &str = "gateway_commands";

/// Sender used for engine-originated messages
pub const HUMAN_SENDER: &str = "human";

static CLAIM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)!claim\s+(.+)").expect("CLAIM_RE regex should compile")
});

static COMPLETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)!complete\s+([0-9a-f]{8})\b").expect("COMPLETE_RE regex should compile")
});

static DESPAWN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)!despawn(?:\s+@?([a-z]+-[\w-]+))?").expect("DESPAWN_RE regex should compile")
});

/// Shared reference to Gateway
pub type SharedGateway = Arc<Gateway>;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Categories mentioned when a vision is announced
    pub vision_roster: Vec<UnitCategory>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            vision_roster: vec![UnitCategory::Archon, UnitCategory::Zealot],
        }
    }
}

/// Frames accepted from the engine
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    EngineReq,
    Msg {
        channel: String,
        content: Value,
        #[serde(default)]
        sender: Option<String>,
    },
}

/// Command carried inside a `gateway_commands` message
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GatewayCommand {
    Vision {
        channel: String,
        content: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
    Msg {
        channel: String,
        content: String,
        #[serde(default)]
        sender: Option<String>,
    },
}

/// Frames sent back to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    EngineAck,
    Ack {
        coordination_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        claim_id: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerFrame {
    fn ack(coordination_id: impl Into<String>) -> Self {
        Self::Ack {
            coordination_id: Some(coordination_id.into()),
            claim_id: None,
        }
    }

    fn message(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"type":"error","message":"{e}"}}"#))
    }
}

impl From<&CoordinationError> for ServerFrame {
    fn from(e: &CoordinationError) -> Self {
        Self::Error {
            message: e.to_string(),
            code: Some(e.code().to_string()),
        }
    }
}

/// Command surface shared by all engine sessions
pub struct Gateway {
    bus: SharedEventBus,
    coordinator: SharedCoordinator,
    config: GatewayConfig,
    /// channel -> current coordination id
    coordinations: Mutex<HashMap<String, String>>,
    claims: Mutex<ClaimRegistry>,
}

impl Gateway {
    pub fn new(bus: SharedEventBus, coordinator: SharedCoordinator, config: GatewayConfig) -> Self {
        Self {
            bus,
            coordinator,
            config,
            coordinations: Mutex::new(HashMap::new()),
            claims: Mutex::new(ClaimRegistry::new()),
        }
    }

    /// Create a shared reference to this gateway
    pub fn shared(self) -> SharedGateway {
        Arc::new(self)
    }

    /// Open a session that has not performed the handshake yet
    pub fn session(self: &Arc<Self>) -> GatewaySession {
        GatewaySession {
            gateway: self.clone(),
            state: SessionState::AwaitingHandshake,
        }
    }

    fn coordinations(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.coordinations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claims(&self) -> MutexGuard<'_, ClaimRegistry> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current coordination id of a channel, if one was assigned
    pub fn coordination_id(&self, channel: &str) -> Option<String> {
        self.coordinations().get(channel).cloned()
    }

    /// Coordination a message from `sender` belongs to: the effort the sender
    /// is live in, else the channel's current one (created lazily)
    fn coordination_for(&self, channel: &str, sender: &str) -> String {
        if let Some(coordination_id) = self.coordinator.coordination_of(channel, sender) {
            return coordination_id;
        }
        self.coordinations()
            .entry(channel.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    pub fn claim(&self, claim_id: &str) -> Option<WorkClaim> {
        self.claims().get(claim_id).cloned()
    }

    /// Start a fresh coordination effort on `channel` and announce the vision
    pub fn submit_vision(&self, channel: &str, vision: &str) -> CoordinationResult<String> {
        let coordination_id = uuid::Uuid::new_v4().to_string();
        self.coordinations()
            .insert(channel.to_string(), coordination_id.clone());

        let roster = self
            .config
            .vision_roster
            .iter()
            .map(|c| format!("@{c}"))
            .collect::<Vec<_>>()
            .join(" ");
        let content = if roster.is_empty() {
            vision.to_string()
        } else {
            format!("{vision}\n\n{roster}")
        };

        self.bus.publish(Event::agent_message(
            channel,
            HUMAN_SENDER,
            &coordination_id,
            content,
        ))?;
        info!(channel, coordination_id = %coordination_id, "Vision received");
        Ok(coordination_id)
    }

    /// Publish a chat message and apply any claim or recall commands in it.
    ///
    /// `!despawn` and `!complete` ownership is settled before the message is
    /// published; a rejected command publishes nothing.
    pub fn submit_chat(&self, channel: &str, sender: &str, content: &str) -> CoordinationResult<ServerFrame> {
        let coordination_id = self.coordination_for(channel, sender);

        let recall = DESPAWN_RE.captures(content).map(|caps| {
            caps.get(1)
                .map(|m| m.as_str().to_ascii_lowercase())
                .unwrap_or_else(|| sender.to_string())
        });
        if let Some(unit_id) = recall.as_deref() {
            if unit_id != sender && sender != HUMAN_SENDER {
                return Err(CoordinationError::SovereigntyViolation {
                    actor: sender.to_string(),
                    resource: unit_id.to_string(),
                });
            }
        }

        if let Some(id) = COMPLETE_RE.captures(content).and_then(|caps| caps.get(1)) {
            self.claims().complete(&id.as_str().to_ascii_lowercase(), sender)?;
        }

        self.bus.publish(Event::agent_message(
            channel,
            sender,
            &coordination_id,
            content,
        ))?;

        let claim_id = CLAIM_RE.captures(content).map(|caps| {
            let text = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            self.claims().claim(sender, &coordination_id, text)
        });

        if let Some(unit_id) = recall {
            // The unit may belong to an earlier effort on this channel
            let owner = self
                .coordinator
                .coordination_of(channel, &unit_id)
                .unwrap_or_else(|| coordination_id.clone());
            self.bus.publish(
                Event::unit_despawn(channel, &owner, &unit_id).with_payload("requested_by", sender),
            )?;
            info!(channel, unit_id = %unit_id, coordination_id = %owner, requested_by = sender, "Unit recalled");
        }

        Ok(ServerFrame::Ack {
            coordination_id: Some(coordination_id),
            claim_id,
        })
    }

    fn dispatch(&self, command: GatewayCommand) -> CoordinationResult<ServerFrame> {
        match command {
            GatewayCommand::Vision {
                channel,
                content,
                params,
            } => {
                debug!(channel = %channel, params = params.len(), "Vision command");
                self.submit_vision(&channel, &content).map(ServerFrame::ack)
            }
            GatewayCommand::Msg {
                channel,
                content,
                sender,
            } => self.submit_chat(&channel, sender.as_deref().unwrap_or(HUMAN_SENDER), &content),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Ready,
}

/// One engine connection
pub struct GatewaySession {
    gateway: SharedGateway,
    state: SessionState,
}

impl GatewaySession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handle one inbound text frame and produce the reply frame
    pub fn handle_frame(&mut self, raw: &str) -> ServerFrame {
        let frame: ClientFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Rejected gateway frame: {}", e);
                return (&CoordinationError::MalformedEnvelope(e.to_string())).into();
            }
        };

        match (self.state, frame) {
            (_, ClientFrame::EngineReq) => {
                if self.state == SessionState::AwaitingHandshake {
                    info!("Engine handshake complete");
                }
                self.state = SessionState::Ready;
                ServerFrame::EngineAck
            }
            (SessionState::AwaitingHandshake, _) => {
                ServerFrame::message("handshake required: send engine_req first")
            }
            (SessionState::Ready, ClientFrame::Msg { channel, content, sender }) => {
                let result = if channel == GATEWAY_COMMANDS {
                    decode_command(content).and_then(|command| self.gateway.dispatch(command))
                } else {
                    match content {
                        Value::String(text) => self.gateway.submit_chat(
                            &channel,
                            sender.as_deref().unwrap_or(HUMAN_SENDER),
                            &text,
                        ),
                        _ => Err(CoordinationError::MalformedEnvelope(
                            "chat content must be a string".into(),
                        )),
                    }
                };

                result.unwrap_or_else(|e| {
                    warn!(channel = %channel, "Gateway command rejected: {}", e);
                    (&e).into()
                })
            }
        }
    }
}

/// The inner command arrives either JSON-encoded in a string or inline
fn decode_command(content: Value) -> CoordinationResult<GatewayCommand> {
    let decoded = match content {
        Value::String(text) => serde_json::from_str(&text),
        other => serde_json::from_value(other),
    };
    decoded.map_err(|e| CoordinationError::MalformedEnvelope(e.to_string()))
}
