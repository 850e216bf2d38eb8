//! Spawn capability injected into the Observer and Gateway
//!
//! Process creation is a side effect the coordination logic never performs
//! directly; it goes through [`Spawner`] so tests can substitute a mock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{CoordinationError, CoordinationResult};
use crate::units::UnitRegistry;

/// Result type alias for spawn operations
pub type SpawnResult<T> = CoordinationResult<T>;

/// Shared reference to a spawner implementation
pub type SharedSpawner = Arc<dyn Spawner>;

/// A unit created by a spawner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnedUnit {
    pub unit_id: String,
    /// OS process id, when the unit runs as a local process
    pub pid: Option<u32>,
}

/// Creates unit processes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Spawn a unit of `unit_type` into `channel`, connecting back to the
    /// grid at `endpoint`. Unregistered types fail with `UnknownUnitType`
    /// before anything is created.
    async fn spawn_unit(
        &self,
        unit_type: &str,
        channel: &str,
        endpoint: &str,
    ) -> SpawnResult<Vec<SpawnedUnit>>;
}

/// Spawner that launches each unit as a child process
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    registry: UnitRegistry,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, registry: UnitRegistry) -> Self {
        Self {
            program: program.into(),
            args,
            registry,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Number of children that have not exited yet
    pub fn running(&self) -> usize {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        children.retain(|_, child| matches!(child.try_wait(), Ok(None)));
        children.len()
    }

    /// Ask every child to terminate
    pub fn shutdown(&self) {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        for (unit_id, mut child) in children.drain() {
            if let Err(e) = child.start_kill() {
                debug!(unit_id = %unit_id, "Child already gone: {}", e);
            }
        }
    }
}

#[async_trait]
impl Spawner for ProcessSpawner {
    async fn spawn_unit(
        &self,
        unit_type: &str,
        channel: &str,
        endpoint: &str,
    ) -> SpawnResult<Vec<SpawnedUnit>> {
        let category = self.registry.require(unit_type)?;
        let unit_id = category.new_unit_id();
        let unit_endpoint = format!("{}/{}", endpoint.trim_end_matches('/'), unit_id);

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg("--unit-id")
            .arg(&unit_id)
            .arg("--unit-type")
            .arg(category.as_str())
            .arg("--channel")
            .arg(channel)
            .arg("--endpoint")
            .arg(&unit_endpoint)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                warn!(unit_type, program = %self.program.display(), "Spawn failed: {}", e);
                CoordinationError::SpawnFailed {
                    unit_type: unit_type.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let pid = child.id();
        info!(unit_id = %unit_id, unit_type = category.as_str(), channel, ?pid, "Unit process started");
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(unit_id.clone(), child);

        Ok(vec![SpawnedUnit { unit_id, pid }])
    }
}

impl Drop for ProcessSpawner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
