//! Protoss Coordination Library
//!
//! Coordination and routing substrate for a swarm of unit processes that
//! talk over named channels, spawn and retire each other in response to
//! messages, and agree when a piece of work is finished.
//!
//! # Components
//!
//! - [`events`]: typed in-process pub/sub bus with per-subscriber queues
//! - [`coordinator`]: per-effort liveness tracking and completion detection
//! - [`observer`]: `@mention`-triggered spawning under admission control
//! - [`grid`]: point-to-point router with offline inboxes and a WebSocket
//!   transport
//! - [`bridge`]: unit-facing bus attachment with channel history replay
//! - [`gateway`]: engine-facing handshake and command surface
//! - [`claims`]: owner-only work claims
//! - [`archiver`]: channel history behind the [`archiver::ChannelStore`] trait
//! - [`spawner`]: the injected process-creation capability
//!
//! # Usage
//!
//! ```ignore
//! use protoss_coordination::{Coordinator, CoordinatorConfig, Event, EventBus};
//!
//! let bus = EventBus::new().shared();
//! let coordinator = Coordinator::new(bus.clone(), CoordinatorConfig::default()).shared();
//! coordinator.start();
//!
//! bus.publish(Event::unit_spawn("alpha", "coord-1", "probe-1"))?;
//! bus.publish(Event::unit_despawn("alpha", "coord-1", "probe-1"))?;
//! // -> one coordination_complete for ("coord-1", "alpha")
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod archiver;
pub mod bridge;
pub mod claims;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod gateway;
pub mod grid;
pub mod observer;
pub mod spawner;
pub mod units;

pub use bridge::{BusBridge, SharedBusBridge};
pub use config::NodeConfig;
pub use coordinator::{CoordinationStatus, Coordinator, CoordinatorConfig, SharedCoordinator};
pub use error::{CoordinationError, CoordinationResult};
pub use events::{Event, EventBus, EventFilter, EventType, SharedEventBus, Signal, Subscription};
pub use gateway::{Gateway, GatewayConfig, SharedGateway};
pub use grid::{Grid, Psi, SharedGrid};
pub use observer::{should_spawn_unit, Observer, ObserverConfig, SharedObserver};
pub use spawner::{ProcessSpawner, SharedSpawner, SpawnedUnit, Spawner};
pub use units::{UnitCategory, UnitRegistry};
