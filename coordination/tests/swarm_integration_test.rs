//! End-to-end tests: gateway -> bus -> observer -> spawner -> coordinator
//!
//! Uses an in-process spawner that records calls instead of launching
//! processes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use protoss_coordination::gateway::ServerFrame;
use protoss_coordination::spawner::SpawnResult;
use protoss_coordination::{
    CoordinationError, Coordinator, CoordinatorConfig, Event, EventBus, EventType, Gateway,
    GatewayConfig, Observer, ObserverConfig, SharedCoordinator, SharedEventBus, SpawnedUnit,
    Spawner, UnitCategory, UnitRegistry,
};

/// Spawner that answers after an optional delay and records every call
#[derive(Default)]
struct RecordingSpawner {
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
    spawned: Mutex<Vec<String>>,
}

#[async_trait]
impl Spawner for RecordingSpawner {
    async fn spawn_unit(
        &self,
        unit_type: &str,
        _channel: &str,
        _endpoint: &str,
    ) -> SpawnResult<Vec<SpawnedUnit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(CoordinationError::SpawnFailed {
                unit_type: unit_type.to_string(),
                reason: "no capacity".into(),
            });
        }
        let category = UnitCategory::resolve(unit_type)
            .ok_or_else(|| CoordinationError::UnknownUnitType(unit_type.to_string()))?;
        let unit_id = category.new_unit_id();
        self.spawned.lock().unwrap().push(unit_id.clone());
        Ok(vec![SpawnedUnit { unit_id, pid: None }])
    }
}

struct Swarm {
    bus: SharedEventBus,
    coordinator: SharedCoordinator,
    observer: Observer,
    spawner: Arc<RecordingSpawner>,
}

impl Swarm {
    fn start(spawner: RecordingSpawner, max_units: usize) -> Self {
        let bus = EventBus::new().shared();
        let coordinator = Coordinator::new(bus.clone(), CoordinatorConfig::default()).shared();
        coordinator.start();

        let spawner = Arc::new(spawner);
        let observer = Observer::new(
            bus.clone(),
            coordinator.clone(),
            spawner.clone(),
            UnitRegistry::all(),
            ObserverConfig {
                max_units,
                ..ObserverConfig::default()
            },
        );
        observer.start();

        Self {
            bus,
            coordinator,
            observer,
            spawner,
        }
    }

    async fn stop(self) {
        self.observer.stop().await;
        self.coordinator.stop().await;
        self.bus.close();
    }
}

async fn next(sub: &mut protoss_coordination::Subscription) -> Event {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("event within timeout")
        .expect("bus open")
}

fn chat(channel: &str, sender: &str, content: &str) -> String {
    serde_json::json!({
        "type": "msg",
        "channel": "gateway_commands",
        "content": serde_json::json!({
            "type": "msg",
            "channel": channel,
            "sender": sender,
            "content": content,
        }).to_string(),
    })
    .to_string()
}

/// Test: a vision spawns the roster, and the effort completes once every
/// spawned unit recalls itself
#[tokio::test]
async fn test_vision_to_completion() {
    let swarm = Swarm::start(RecordingSpawner::default(), 10);
    let mut spawns = swarm.bus.subscribe_to(Some(EventType::UnitSpawn), Some("alpha"));
    let mut completions = swarm
        .bus
        .subscribe_to(Some(EventType::CoordinationComplete), None);

    let gateway = Gateway::new(
        swarm.bus.clone(),
        swarm.coordinator.clone(),
        GatewayConfig::default(),
    )
    .shared();
    let mut session = gateway.session();
    assert_eq!(session.handle_frame(r#"{"type":"engine_req"}"#), ServerFrame::EngineAck);

    let vision = serde_json::json!({
        "type": "msg",
        "channel": "gateway_commands",
        "content": r#"{"type":"vision","channel":"alpha","content":"ship the grid","params":{}}"#,
    });
    let ServerFrame::Ack {
        coordination_id: Some(coordination_id),
        ..
    } = session.handle_frame(&vision.to_string())
    else {
        panic!("vision should be acknowledged");
    };

    let mut unit_ids = Vec::new();
    for _ in 0..2 {
        let event = next(&mut spawns).await;
        assert_eq!(event.coordination_id.as_deref(), Some(coordination_id.as_str()));
        assert_eq!(event.payload_str("spawned_by"), Some("human"));
        unit_ids.push(event.unit_id().unwrap().to_string());
    }
    unit_ids.sort();
    assert!(unit_ids[0].starts_with("archon-"));
    assert!(unit_ids[1].starts_with("zealot-"));
    assert_eq!(swarm.spawner.calls.load(Ordering::SeqCst), 2);

    for unit_id in &unit_ids {
        let reply = session.handle_frame(&chat("alpha", unit_id, "finished !despawn"));
        assert!(matches!(reply, ServerFrame::Ack { .. }), "{reply:?}");
    }

    let done = next(&mut completions).await;
    assert_eq!(done.channel, "alpha");
    assert_eq!(done.coordination_id, Some(coordination_id));
    swarm.stop().await;
}

/// Test: two mentions racing a slow spawn admit a single unit
#[tokio::test(start_paused = true)]
async fn test_concurrent_mentions_admit_once() {
    let swarm = Swarm::start(
        RecordingSpawner {
            delay: Duration::from_millis(200),
            ..RecordingSpawner::default()
        },
        10,
    );
    let mut spawns = swarm.bus.subscribe_to(Some(EventType::UnitSpawn), None);

    swarm
        .bus
        .publish(Event::agent_message("alpha", "archon-1", "coord-1", "@zealot fix it"))
        .unwrap();
    swarm
        .bus
        .publish(Event::agent_message("alpha", "oracle-1", "coord-1", "@zealot please"))
        .unwrap();

    let event = next(&mut spawns).await;
    assert!(event.unit_id().unwrap().starts_with("zealot-"));
    assert_eq!(event.payload_str("spawned_by"), Some("archon-1"));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(spawns.try_recv().is_none());
    assert_eq!(swarm.spawner.calls.load(Ordering::SeqCst), 1);

    let live = swarm.coordinator.get_active_units("alpha");
    assert_eq!(live.len(), 1);
    assert!(live.iter().all(|u| u.starts_with("zealot-") && !u.contains("pending")));
    swarm.stop().await;
}

/// Test: the per-channel ceiling caps admissions
#[tokio::test]
async fn test_max_units_ceiling() {
    let swarm = Swarm::start(RecordingSpawner::default(), 2);
    let mut spawns = swarm.bus.subscribe_to(Some(EventType::UnitSpawn), None);

    swarm
        .bus
        .publish(Event::agent_message("alpha", "human", "coord-1", "@zealot @archon @oracle"))
        .unwrap();

    next(&mut spawns).await;
    next(&mut spawns).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(spawns.try_recv().is_none());
    assert_eq!(swarm.spawner.calls.load(Ordering::SeqCst), 2);
    assert_eq!(swarm.coordinator.get_active_units("alpha").len(), 2);
    swarm.stop().await;
}

/// Test: a failing spawner frees the slot so a later mention retries
#[tokio::test]
async fn test_spawn_failure_keeps_loop_alive() {
    let swarm = Swarm::start(
        RecordingSpawner {
            fail: true,
            ..RecordingSpawner::default()
        },
        10,
    );

    for _ in 0..2 {
        swarm
            .bus
            .publish(Event::agent_message("alpha", "human", "coord-1", "@oracle?"))
            .unwrap();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    assert_eq!(swarm.spawner.calls.load(Ordering::SeqCst), 2);
    assert!(swarm.coordinator.get_active_units("alpha").is_empty());
    assert!(swarm.spawner.spawned.lock().unwrap().is_empty());
    swarm.stop().await;
}
