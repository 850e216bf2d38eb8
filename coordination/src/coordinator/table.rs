//! Coordination table - per-effort liveness state
//!
//! Pure state transitions; the [`Coordinator`](super::Coordinator) loop is
//! the only writer apart from Observer slot reservations, and both go through
//! the same mutex-guarded table.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::units::UnitCategory;

/// Lifecycle status of a coordination effort
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationStatus {
    Active,
    Complete,
}

/// Handle to a scheduled completion check for one channel
#[derive(Debug)]
struct PendingCheck {
    generation: u64,
    cancel: CancellationToken,
}

/// State of one coordination effort
#[derive(Debug)]
pub struct Coordination {
    pub status: CoordinationStatus,
    /// Sticky once any unit was recorded
    pub had_units: bool,
    /// channel -> live unit ids
    pub channels: HashMap<String, HashSet<String>>,
    pending: HashMap<String, PendingCheck>,
}

impl Coordination {
    fn new() -> Self {
        Self {
            status: CoordinationStatus::Active,
            had_units: false,
            channels: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == CoordinationStatus::Active
    }

    fn channel_is_empty(&self, channel: &str) -> bool {
        self.channels.get(channel).map(HashSet::is_empty).unwrap_or(true)
    }

    fn cancel_pending(&mut self, channel: &str) -> bool {
        match self.pending.remove(channel) {
            Some(check) => {
                check.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether an emptied channel should get a completion check
    fn wants_check(&self, channel: &str) -> bool {
        self.is_active()
            && self.had_units
            && self.channel_is_empty(channel)
            && !self.pending.contains_key(channel)
    }
}

/// Provisional slot held by the Observer while a spawn call is in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub coordination_id: String,
    pub channel: String,
    pub category: UnitCategory,
    /// Placeholder unit id occupying the slot
    pub placeholder: String,
}

/// Outcome of recording a spawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    Recorded,
    /// A pending completion check was cancelled by this spawn
    RecordedCancelledCheck,
    /// The coordination already completed; nothing changed
    IgnoredComplete,
}

/// Table of coordination efforts keyed by coordination id
#[derive(Debug, Default)]
pub struct CoordinationTable {
    coordinations: HashMap<String, Coordination>,
    next_generation: u64,
}

impl CoordinationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, coordination_id: &str) -> Option<&Coordination> {
        self.coordinations.get(coordination_id)
    }

    pub fn status(&self, coordination_id: &str) -> Option<CoordinationStatus> {
        self.get(coordination_id).map(|c| c.status)
    }

    pub fn len(&self) -> usize {
        self.coordinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinations.is_empty()
    }

    /// Record a live unit, replacing the reservation it fulfils if any
    pub fn record_spawn(
        &mut self,
        coordination_id: &str,
        channel: &str,
        unit_id: &str,
        reservation: Option<&str>,
    ) -> SpawnOutcome {
        let coordination = self
            .coordinations
            .entry(coordination_id.to_string())
            .or_insert_with(Coordination::new);

        if !coordination.is_active() {
            return SpawnOutcome::IgnoredComplete;
        }

        let units = coordination.channels.entry(channel.to_string()).or_default();
        if let Some(placeholder) = reservation {
            units.remove(placeholder);
        }
        units.insert(unit_id.to_string());
        coordination.had_units = true;

        if coordination.cancel_pending(channel) {
            SpawnOutcome::RecordedCancelledCheck
        } else {
            SpawnOutcome::Recorded
        }
    }

    /// Remove a live unit. Returns `true` when the channel emptied and a
    /// completion check should be scheduled. Unknown ids are a no-op.
    pub fn record_despawn(&mut self, coordination_id: &str, channel: &str, unit_id: &str) -> bool {
        let Some(coordination) = self.coordinations.get_mut(coordination_id) else {
            return false;
        };
        if let Some(units) = coordination.channels.get_mut(channel) {
            units.remove(unit_id);
        }
        coordination.wants_check(channel)
    }

    /// Register a pending check and return its generation
    pub fn arm_check(&mut self, coordination_id: &str, channel: &str, cancel: CancellationToken) -> Option<u64> {
        let coordination = self.coordinations.get_mut(coordination_id)?;
        self.next_generation += 1;
        let generation = self.next_generation;
        if let Some(previous) = coordination
            .pending
            .insert(channel.to_string(), PendingCheck { generation, cancel })
        {
            previous.cancel.cancel();
        }
        Some(generation)
    }

    /// Run a fired completion check. Returns `true` when the coordination
    /// transitioned to complete and the completion event must be emitted.
    pub fn complete_if_empty(&mut self, coordination_id: &str, channel: &str, generation: u64) -> bool {
        let Some(coordination) = self.coordinations.get_mut(coordination_id) else {
            return false;
        };

        // Superseded or cancelled in the meantime
        let current = coordination.pending.get(channel).map(|c| c.generation);
        if current != Some(generation) {
            return false;
        }
        coordination.pending.remove(channel);

        if !coordination.is_active() || !coordination.channel_is_empty(channel) {
            return false;
        }

        coordination.status = CoordinationStatus::Complete;
        for (_, check) in coordination.pending.drain() {
            check.cancel.cancel();
        }
        true
    }

    /// Hold a slot for a spawn that has not resolved yet. Returns `None` if
    /// the coordination already completed.
    pub fn reserve(&mut self, coordination_id: &str, channel: &str, category: UnitCategory) -> Option<Reservation> {
        let coordination = self
            .coordinations
            .entry(coordination_id.to_string())
            .or_insert_with(Coordination::new);
        if !coordination.is_active() {
            return None;
        }

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let placeholder = format!("{}-pending-{}", category.as_str(), &suffix[..8]);
        coordination
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(placeholder.clone());
        coordination.cancel_pending(channel);

        Some(Reservation {
            coordination_id: coordination_id.to_string(),
            channel: channel.to_string(),
            category,
            placeholder,
        })
    }

    /// Roll back a reservation. Returns `true` when a completion check
    /// should be scheduled for the emptied channel.
    pub fn release(&mut self, reservation: &Reservation) -> bool {
        self.record_despawn(
            &reservation.coordination_id,
            &reservation.channel,
            &reservation.placeholder,
        )
    }

    /// Union of live units in `channel` across active coordinations
    pub fn active_units(&self, channel: &str) -> HashSet<String> {
        self.coordinations
            .values()
            .filter(|c| c.is_active())
            .filter_map(|c| c.channels.get(channel))
            .flat_map(|units| units.iter().cloned())
            .collect()
    }

    /// Active coordination that lists `unit_id` as live in `channel`
    pub fn coordination_of(&self, channel: &str, unit_id: &str) -> Option<&str> {
        self.coordinations
            .iter()
            .filter(|(_, c)| c.is_active())
            .find(|(_, c)| {
                c.channels
                    .get(channel)
                    .is_some_and(|units| units.contains(unit_id))
            })
            .map(|(id, _)| id.as_str())
    }

    /// Cancel every pending completion check
    pub fn cancel_all_checks(&mut self) {
        for coordination in self.coordinations.values_mut() {
            for (_, check) in coordination.pending.drain() {
                check.cancel.cancel();
            }
        }
    }
}
