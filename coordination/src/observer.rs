//! Observer - mention-triggered, admission-controlled spawning
//!
//! Watches `agent_message` events for `@mention` signals. Each mention is
//! resolved to a canonical category and admitted against the channel's live
//! units; admitted spawns hold a reserved slot until the spawner answers, so
//! a second mention for the same category cannot slip through meanwhile.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Reservation, SharedCoordinator, RESERVATION_KEY};
use crate::events::{Event, EventType, SharedEventBus, Subscription};
use crate::spawner::SharedSpawner;
use crate::units::{UnitCategory, UnitRegistry};

/// Default ceiling on live units per channel
pub const DEFAULT_MAX_UNITS: usize = 100;

/// Shared reference to Observer
pub type SharedObserver = Arc<Observer>;

/// Decide whether a unit of `unit_type` may be spawned into `channel`.
///
/// Rejected when the type is unknown or not spawnable by mention, when the
/// channel already holds `max_units` units, or when a unit of the same
/// category is already live there.
pub fn should_spawn_unit(
    unit_type: &str,
    channel: &str,
    active_units: &HashMap<String, HashSet<String>>,
    max_units: usize,
) -> bool {
    let Some(category) = UnitCategory::resolve(unit_type) else {
        return false;
    };
    if !category.spawnable_by_mention() {
        return false;
    }

    let Some(units) = active_units.get(channel) else {
        return max_units > 0;
    };
    units.len() < max_units
        && !units
            .iter()
            .any(|unit_id| UnitCategory::resolve(unit_id) == Some(category))
}

/// Observer configuration
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub max_units: usize,
    /// Grid URL handed to spawned units
    pub endpoint: String,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            max_units: DEFAULT_MAX_UNITS,
            endpoint: "ws://127.0.0.1:8888".to_string(),
        }
    }
}

struct Inner {
    bus: SharedEventBus,
    coordinator: SharedCoordinator,
    spawner: SharedSpawner,
    registry: UnitRegistry,
    config: ObserverConfig,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Inner {
    fn handle_message(self: &Arc<Self>, event: &Event) {
        let Some(coordination_id) = event.coordination_id.as_deref() else {
            return;
        };

        for mention in event.mentions() {
            let Some(category) = self.registry.resolve(mention) else {
                debug!(mention, channel = %event.channel, "Unknown mention ignored");
                continue;
            };

            let reservation =
                self.coordinator
                    .reserve_if(coordination_id, &event.channel, category, |units| {
                        let snapshot = HashMap::from([(event.channel.clone(), units.clone())]);
                        should_spawn_unit(
                            category.as_str(),
                            &event.channel,
                            &snapshot,
                            self.config.max_units,
                        )
                    });
            let Some(reservation) = reservation else {
                debug!(
                    unit_type = category.as_str(),
                    channel = %event.channel,
                    "Spawn not admitted"
                );
                continue;
            };

            info!(
                unit_type = category.as_str(),
                channel = %event.channel,
                coordination_id,
                spawned_by = %event.sender,
                "Spawning unit for mention"
            );
            let inner = self.clone();
            let spawned_by = event.sender.clone();
            self.tracker.spawn(async move {
                tokio::select! {
                    _ = inner.cancel.cancelled() => inner.coordinator.release(&reservation),
                    _ = inner.spawn_and_publish(&reservation, &spawned_by) => {}
                }
            });
        }
    }

    async fn spawn_and_publish(&self, reservation: &Reservation, spawned_by: &str) {
        let unit_type = reservation.category.as_str();
        let result = self
            .spawner
            .spawn_unit(unit_type, &reservation.channel, &self.config.endpoint)
            .await;

        let units = match result {
            Ok(units) if !units.is_empty() => units,
            Ok(_) => {
                warn!(unit_type, channel = %reservation.channel, "Spawner returned no units");
                self.coordinator.release(reservation);
                return;
            }
            Err(e) => {
                error!(unit_type, channel = %reservation.channel, "Failed to spawn: {}", e);
                self.coordinator.release(reservation);
                return;
            }
        };

        for unit in units {
            let event = Event::unit_spawn(
                &reservation.channel,
                &reservation.coordination_id,
                &unit.unit_id,
            )
            .with_payload("unit_type", unit_type)
            .with_payload("spawned_by", spawned_by)
            .with_payload(RESERVATION_KEY, reservation.placeholder.as_str());

            if let Err(e) = self.bus.publish(event) {
                warn!(unit_id = %unit.unit_id, "Failed to publish spawn: {}", e);
                self.coordinator.release(reservation);
            }
        }
    }
}

async fn run(inner: Arc<Inner>, mut messages: Subscription) {
    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            event = messages.recv() => match event {
                Some(event) => inner.handle_message(&event),
                None => break,
            },
        }
    }
    info!("Observer stopped");
}

/// Watches messages for mentions and triggers admitted spawns
pub struct Observer {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Observer {
    pub fn new(
        bus: SharedEventBus,
        coordinator: SharedCoordinator,
        spawner: SharedSpawner,
        registry: UnitRegistry,
        config: ObserverConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                coordinator,
                spawner,
                registry,
                config,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Create a shared reference to this observer
    pub fn shared(self) -> SharedObserver {
        Arc::new(self)
    }

    /// Subscribe to `agent_message` events and start the loop. Idempotent.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }
        let messages = self.inner.bus.subscribe_to(Some(EventType::AgentMessage), None);
        *task = Some(tokio::spawn(run(self.inner.clone(), messages)));
        info!(max_units = self.inner.config.max_units, "Observer started");
    }

    /// Stop the loop and wait for in-flight spawns to settle
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Number of spawn calls currently awaiting the spawner
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{Coordinator, CoordinatorConfig};
    use crate::error::CoordinationError;
    use crate::events::EventBus;
    use crate::spawner::{MockSpawner, SpawnedUnit};

    fn active(channel: &str, units: &[&str]) -> HashMap<String, HashSet<String>> {
        HashMap::from([(
            channel.to_string(),
            units.iter().map(|u| u.to_string()).collect(),
        )])
    }

    #[test]
    fn test_should_spawn_unit() {
        let snapshot = active("alpha", &["zealot-1"]);
        assert!(!should_spawn_unit("zealot", "alpha", &snapshot, 2));
        assert!(should_spawn_unit("archon", "alpha", &snapshot, 2));
        assert!(!should_spawn_unit("unknown", "alpha", &HashMap::new(), DEFAULT_MAX_UNITS));
    }

    #[test]
    fn test_should_spawn_unit_ceiling_and_personas() {
        let snapshot = active("alpha", &["zealot-1", "archon-2"]);
        assert!(!should_spawn_unit("oracle", "alpha", &snapshot, 2));
        assert!(should_spawn_unit("oracle", "beta", &snapshot, 2));
        assert!(should_spawn_unit("tassadar", "alpha", &snapshot, 3));

        let snapshot = active("alpha", &["conclave-1"]);
        assert!(!should_spawn_unit("zeratul", "alpha", &snapshot, 3));
        assert!(!should_spawn_unit("probe", "alpha", &HashMap::new(), 3));
        assert!(!should_spawn_unit("zealot", "alpha", &HashMap::new(), 0));
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn observer_with(spawner: MockSpawner) -> (SharedEventBus, SharedCoordinator, Observer) {
        let bus = EventBus::new().shared();
        let coordinator = Coordinator::new(bus.clone(), CoordinatorConfig::default()).shared();
        coordinator.start();
        let observer = Observer::new(
            bus.clone(),
            coordinator.clone(),
            Arc::new(spawner),
            UnitRegistry::all(),
            ObserverConfig::default(),
        );
        observer.start();
        (bus, coordinator, observer)
    }

    #[tokio::test]
    async fn test_mention_spawns_once_per_category() {
        let mut spawner = MockSpawner::new();
        spawner
            .expect_spawn_unit()
            .withf(|unit_type, channel, _| unit_type.to_string() == "archon" && channel.to_string() == "alpha")
            .times(1)
            .returning(|_, _, _| {
                Ok(vec![SpawnedUnit {
                    unit_id: "archon-0a1b2c3d".into(),
                    pid: None,
                }])
            });

        let (bus, coordinator, observer) = observer_with(spawner);
        let mut spawns = bus.subscribe_to(Some(EventType::UnitSpawn), None);

        // Two mentions of the same category in one message: one admission
        bus.publish(Event::agent_message("alpha", "human", "coord-1", "@archon and @archon"))
            .unwrap();

        let event = spawns.recv().await.unwrap();
        assert_eq!(event.unit_id(), Some("archon-0a1b2c3d"));
        assert_eq!(event.coordination_id.as_deref(), Some("coord-1"));
        assert_eq!(event.payload_str("unit_type"), Some("archon"));
        assert_eq!(event.payload_str("spawned_by"), Some("human"));

        settle().await;
        let units = coordinator.get_active_units("alpha");
        assert_eq!(units, HashSet::from(["archon-0a1b2c3d".to_string()]));

        observer.stop().await;
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_failed_spawn_releases_reservation() {
        let mut spawner = MockSpawner::new();
        spawner.expect_spawn_unit().times(1).returning(|unit_type, _, _| {
            Err(CoordinationError::SpawnFailed {
                unit_type: unit_type.to_string(),
                reason: "exec failed".into(),
            })
        });

        let (bus, coordinator, observer) = observer_with(spawner);
        let mut spawns = bus.subscribe_to(Some(EventType::UnitSpawn), None);

        bus.publish(Event::agent_message("alpha", "human", "coord-1", "@zealot go"))
            .unwrap();
        settle().await;

        assert!(spawns.try_recv().is_none());
        assert!(coordinator.get_active_units("alpha").is_empty());
        assert_eq!(observer.in_flight(), 0);

        observer.stop().await;
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_messages_without_mentions_are_ignored() {
        let mut spawner = MockSpawner::new();
        spawner.expect_spawn_unit().never();

        let (bus, coordinator, observer) = observer_with(spawner);
        bus.publish(Event::agent_message("alpha", "human", "coord-1", "no mentions here"))
            .unwrap();
        bus.publish(Event::agent_message("alpha", "human", "coord-1", "@carrier @probe"))
            .unwrap();
        settle().await;

        assert!(coordinator.get_active_units("alpha").is_empty());
        observer.stop().await;
        coordinator.stop().await;
    }
}
