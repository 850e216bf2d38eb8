//! Completion detection for coordination efforts
//!
//! The [`Coordinator`] consumes `unit_spawn` and `unit_despawn` events from
//! the bus and keeps a [`CoordinationTable`] of live units per
//! `(coordination_id, channel)`. When a channel empties after having hosted
//! at least one unit, a debounced check is armed; a spawn arriving before it
//! fires cancels it, otherwise a single `coordination_complete` is published.

pub mod service;
pub mod table;

pub use service::{Coordinator, CoordinatorConfig, SharedCoordinator, RESERVATION_KEY};
pub use table::{Coordination, CoordinationStatus, CoordinationTable, Reservation, SpawnOutcome};
