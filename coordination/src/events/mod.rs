//! Event-driven coordination module for the unit swarm
//!
//! This module provides the in-process pub/sub substrate every other
//! component hangs off.
//!
//! # Architecture
//!
//! 1. **Event Types** (`types.rs`): the immutable [`Event`] record, its type
//!    tag and the [`Signal`]s extracted from content.
//!
//! 2. **Parser** (`parser.rs`): `@mention` and guardrail extraction.
//!
//! 3. **Event Bus** (`bus.rs`): fan-out with a dedicated queue per
//!    subscriber, filterable by event type and channel.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Producer   │────▶│  Event Bus   │────▶│ Coordinator  │
//! │  (publish)   │     │  (fan-out)   │────▶│ Observer     │
//! └──────────────┘     └──────────────┘────▶│ Archiver     │
//!                             ▲             └──────┬───────┘
//!                             └────────────────────┘
//!                          unit_spawn / coordination_complete
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use protoss_coordination::events::{Event, EventBus, EventType};
//!
//! let bus = EventBus::new().shared();
//! let mut messages = bus.subscribe_to(Some(EventType::AgentMessage), Some("alpha"));
//!
//! bus.publish(Event::agent_message("alpha", "zealot-1", "coord-1", "@archon review"))?;
//!
//! let event = messages.recv().await;
//! ```

pub mod bus;
pub mod parser;
pub mod types;

pub use bus::{BusResult, EventBus, EventFilter, SharedEventBus, Subscription};
pub use parser::parse_signals;
pub use types::{Event, EventType, Signal, SYSTEM_SENDER};
