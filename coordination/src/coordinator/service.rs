//! Coordinator - completion detection over spawn/despawn events
//!
//! A single task consumes `unit_spawn`/`unit_despawn` events in publish
//! order together with fired completion checks, so every mutation of a
//! coordination is serialized through one loop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::table::{CoordinationStatus, CoordinationTable, Reservation, SpawnOutcome};
use crate::events::{Event, EventFilter, EventType, SharedEventBus, Subscription};
use crate::units::UnitCategory;

/// Payload key carrying the reservation a spawn fulfils
pub const RESERVATION_KEY: &str = "reservation";

/// Shared reference to Coordinator
pub type SharedCoordinator = Arc<Coordinator>;

/// Configuration for the coordinator
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Debounce before an emptied channel is re-checked; zero yields once
    pub completion_grace: Duration,
}

#[derive(Debug)]
struct CompletionCheck {
    coordination_id: String,
    channel: String,
    generation: u64,
}

struct Shared {
    table: Mutex<CoordinationTable>,
    bus: SharedEventBus,
    checks: mpsc::UnboundedSender<CompletionCheck>,
    cancel: CancellationToken,
    config: CoordinatorConfig,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, CoordinationTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_event(&self, event: &Event) {
        let Some(coordination_id) = event.coordination_id.as_deref() else {
            debug!(event_type = %event.event_type, "Ignoring event without coordination_id");
            return;
        };
        let Some(unit_id) = event.unit_id() else {
            warn!(
                event_type = %event.event_type,
                coordination_id,
                "Lifecycle event without unit_id"
            );
            return;
        };

        match event.event_type {
            EventType::UnitSpawn => {
                let reservation = event.payload_str(RESERVATION_KEY);
                let outcome =
                    self.table()
                        .record_spawn(coordination_id, &event.channel, unit_id, reservation);
                match outcome {
                    SpawnOutcome::IgnoredComplete => warn!(
                        coordination_id,
                        channel = %event.channel,
                        unit_id,
                        "Spawn for completed coordination ignored"
                    ),
                    SpawnOutcome::RecordedCancelledCheck => debug!(
                        coordination_id,
                        channel = %event.channel,
                        unit_id,
                        "Spawn cancelled pending completion check"
                    ),
                    SpawnOutcome::Recorded => {
                        debug!(coordination_id, channel = %event.channel, unit_id, "Unit spawned")
                    }
                }
            }
            EventType::UnitDespawn => {
                let wants_check =
                    self.table()
                        .record_despawn(coordination_id, &event.channel, unit_id);
                debug!(coordination_id, channel = %event.channel, unit_id, "Unit despawned");
                if wants_check {
                    self.schedule_check(coordination_id, &event.channel);
                }
            }
            _ => {}
        }
    }

    /// Arm a cancellable, debounced completion check for one channel
    fn schedule_check(&self, coordination_id: &str, channel: &str) {
        let token = self.cancel.child_token();
        let Some(generation) = self
            .table()
            .arm_check(coordination_id, channel, token.clone())
        else {
            return;
        };

        debug!(coordination_id, channel, generation, "Completion check scheduled");
        let check = CompletionCheck {
            coordination_id: coordination_id.to_string(),
            channel: channel.to_string(),
            generation,
        };
        let checks = self.checks.clone();
        let grace = self.config.completion_grace;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(coordination_id = %check.coordination_id, "Completion check cancelled");
                }
                _ = debounce(grace) => {
                    if !token.is_cancelled() {
                        let _ = checks.send(check);
                    }
                }
            }
        });
    }

    fn run_check(&self, check: CompletionCheck) {
        let completed = self.table().complete_if_empty(
            &check.coordination_id,
            &check.channel,
            check.generation,
        );
        if !completed {
            debug!(
                coordination_id = %check.coordination_id,
                channel = %check.channel,
                "Completion check aborted"
            );
            return;
        }

        info!(
            coordination_id = %check.coordination_id,
            channel = %check.channel,
            "Coordination complete"
        );
        let event = Event::coordination_complete(&check.channel, &check.coordination_id);
        if let Err(e) = self.bus.publish(event) {
            warn!(coordination_id = %check.coordination_id, "Failed to publish completion: {}", e);
        }
    }
}

async fn debounce(grace: Duration) {
    if grace.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(grace).await;
    }
}

async fn run(
    shared: Arc<Shared>,
    mut events: Subscription,
    mut checks: mpsc::UnboundedReceiver<CompletionCheck>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => shared.handle_event(&event),
                None => break,
            },
            Some(check) = checks.recv() => shared.run_check(check),
        }
    }
    shared.table().cancel_all_checks();
    info!("Coordinator stopped");
}

/// Tracks which units are alive per coordination effort and declares
/// completion once an effort's units have all retired
pub struct Coordinator {
    shared: Arc<Shared>,
    checks_rx: Mutex<Option<mpsc::UnboundedReceiver<CompletionCheck>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(bus: SharedEventBus, config: CoordinatorConfig) -> Self {
        let (checks, checks_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(CoordinationTable::new()),
                bus,
                checks,
                cancel: CancellationToken::new(),
                config,
            }),
            checks_rx: Mutex::new(Some(checks_rx)),
            task: Mutex::new(None),
        }
    }

    /// Create a shared reference to this coordinator
    pub fn shared(self) -> SharedCoordinator {
        Arc::new(self)
    }

    /// Subscribe to lifecycle events and start the consuming loop.
    ///
    /// The subscription exists when this returns, so events published
    /// afterwards are observed. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(checks_rx) = self
            .checks_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let events = self.shared.bus.subscribe(
            EventFilter::new().types(vec![EventType::UnitSpawn, EventType::UnitDespawn]),
        );
        let handle = tokio::spawn(run(self.shared.clone(), events, checks_rx));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!("Coordinator started");
    }

    /// Stop the loop and cancel pending completion checks
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Live unit ids in `channel` across all active coordinations
    pub fn get_active_units(&self, channel: &str) -> HashSet<String> {
        self.shared.table().active_units(channel)
    }

    /// Active coordination in which `unit_id` is live on `channel`
    pub fn coordination_of(&self, channel: &str, unit_id: &str) -> Option<String> {
        self.shared
            .table()
            .coordination_of(channel, unit_id)
            .map(str::to_string)
    }

    pub fn status(&self, coordination_id: &str) -> Option<CoordinationStatus> {
        self.shared.table().status(coordination_id)
    }

    /// Reserve a slot for an in-flight spawn
    pub fn reserve(
        &self,
        coordination_id: &str,
        channel: &str,
        category: UnitCategory,
    ) -> Option<Reservation> {
        self.shared.table().reserve(coordination_id, channel, category)
    }

    /// Check admission against the live units of `channel` and reserve a
    /// slot in the same critical section, so two concurrent admissions can
    /// never both pass against the same state
    pub fn reserve_if<F>(
        &self,
        coordination_id: &str,
        channel: &str,
        category: UnitCategory,
        admit: F,
    ) -> Option<Reservation>
    where
        F: FnOnce(&HashSet<String>) -> bool,
    {
        let mut table = self.shared.table();
        if !admit(&table.active_units(channel)) {
            return None;
        }
        table.reserve(coordination_id, channel, category)
    }

    /// Roll back a reservation whose spawn failed
    pub fn release(&self, reservation: &Reservation) {
        let wants_check = self.shared.table().release(reservation);
        if wants_check {
            self.shared
                .schedule_check(&reservation.coordination_id, &reservation.channel);
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_spawn_despawn_completes_once() {
        let bus = EventBus::new().shared();
        let coordinator = Coordinator::new(bus.clone(), CoordinatorConfig::default());
        coordinator.start();
        let mut completions = bus.subscribe_to(Some(EventType::CoordinationComplete), None);

        bus.publish(Event::unit_spawn("alpha", "coord-1", "probe-1")).unwrap();
        bus.publish(Event::unit_despawn("alpha", "coord-1", "probe-1")).unwrap();

        let event = completions.recv().await.unwrap();
        assert_eq!(event.channel, "alpha");
        assert_eq!(event.coordination_id.as_deref(), Some("coord-1"));
        assert_eq!(coordinator.status("coord-1"), Some(CoordinationStatus::Complete));

        // A repeated despawn is a no-op
        bus.publish(Event::unit_despawn("alpha", "coord-1", "probe-1")).unwrap();
        settle().await;
        assert!(completions.try_recv().is_none());

        coordinator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_inside_grace_aborts_completion() {
        let bus = EventBus::new().shared();
        let coordinator = Coordinator::new(
            bus.clone(),
            CoordinatorConfig {
                completion_grace: Duration::from_millis(50),
            },
        );
        coordinator.start();
        let mut completions = bus.subscribe_to(Some(EventType::CoordinationComplete), None);

        bus.publish(Event::unit_spawn("alpha", "coord-1", "zealot-1")).unwrap();
        bus.publish(Event::unit_despawn("alpha", "coord-1", "zealot-1")).unwrap();
        settle().await;
        bus.publish(Event::unit_spawn("alpha", "coord-1", "zealot-2")).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert!(completions.try_recv().is_none());
        assert_eq!(coordinator.status("coord-1"), Some(CoordinationStatus::Active));

        coordinator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_check() {
        let bus = EventBus::new().shared();
        let coordinator = Coordinator::new(
            bus.clone(),
            CoordinatorConfig {
                completion_grace: Duration::from_millis(50),
            },
        );
        coordinator.start();
        let mut completions = bus.subscribe_to(Some(EventType::CoordinationComplete), None);

        bus.publish(Event::unit_spawn("alpha", "coord-1", "zealot-1")).unwrap();
        bus.publish(Event::unit_despawn("alpha", "coord-1", "zealot-1")).unwrap();
        settle().await;
        coordinator.stop().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert!(completions.try_recv().is_none());
        assert_eq!(coordinator.status("coord-1"), Some(CoordinationStatus::Active));
    }

    #[tokio::test]
    async fn test_release_after_spawn_history_schedules_completion() {
        let bus = EventBus::new().shared();
        let coordinator = Coordinator::new(bus.clone(), CoordinatorConfig::default());
        coordinator.start();
        let mut completions = bus.subscribe_to(Some(EventType::CoordinationComplete), None);

        bus.publish(Event::unit_spawn("alpha", "coord-1", "zealot-1")).unwrap();
        settle().await;
        let reservation = coordinator
            .reserve("coord-1", "alpha", UnitCategory::Archon)
            .unwrap();
        bus.publish(Event::unit_despawn("alpha", "coord-1", "zealot-1")).unwrap();
        settle().await;
        assert!(completions.try_recv().is_none());

        coordinator.release(&reservation);
        let event = completions.recv().await.unwrap();
        assert_eq!(event.coordination_id.as_deref(), Some("coord-1"));

        coordinator.stop().await;
    }
}
