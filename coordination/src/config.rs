//! Node configuration
//!
//! Layered as defaults, then an optional TOML file, then `PROTOSS_*`
//! environment variables; the binary applies command-line flags last.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, CoordinationResult};
use crate::observer::DEFAULT_MAX_UNITS;
use crate::units::{UnitCategory, UnitRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the grid listens on
    pub grid_addr: String,
    /// Ceiling on live units per channel
    pub max_units: usize,
    /// Debounce before an emptied channel completes (0 = one yield)
    pub completion_grace_ms: u64,
    /// Categories this node may spawn
    pub unit_types: Vec<String>,
    /// Categories mentioned when a vision arrives
    pub vision_roster: Vec<String>,
    /// Executable launched for each unit
    pub spawn_program: String,
    /// Extra arguments placed before the unit arguments
    pub spawn_args: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            grid_addr: "127.0.0.1:8888".to_string(),
            max_units: DEFAULT_MAX_UNITS,
            completion_grace_ms: 0,
            unit_types: ["zealot", "archon", "arbiter", "oracle", "conclave"]
                .into_iter()
                .map(String::from)
                .collect(),
            vision_roster: vec!["archon".to_string(), "zealot".to_string()],
            spawn_program: "protoss-unit".to_string(),
            spawn_args: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Defaults overlaid with the given TOML file
    pub fn from_file(path: &Path) -> CoordinationResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoordinationError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&raw)
            .map_err(|e| CoordinationError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load from an optional file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> CoordinationResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `PROTOSS_*` environment variables
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("PROTOSS_GRID_ADDR") {
            self.grid_addr = addr;
        }
        if let Some(max) = lookup("PROTOSS_MAX_UNITS") {
            if let Ok(n) = max.parse() {
                self.max_units = n;
            }
        }
        if let Some(grace) = lookup("PROTOSS_COMPLETION_GRACE_MS") {
            if let Ok(ms) = grace.parse() {
                self.completion_grace_ms = ms;
            }
        }
        if let Some(types) = lookup("PROTOSS_UNIT_TYPES") {
            self.unit_types = split_list(&types);
        }
        if let Some(program) = lookup("PROTOSS_SPAWN_PROGRAM") {
            self.spawn_program = program;
        }
    }

    pub fn validate(&self) -> CoordinationResult<()> {
        if self.max_units == 0 {
            return Err(CoordinationError::Config("max_units must be at least 1".into()));
        }
        self.socket_addr()?;
        self.registry()?;
        self.roster()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> CoordinationResult<SocketAddr> {
        self.grid_addr
            .parse()
            .map_err(|e| CoordinationError::Config(format!("grid_addr {:?}: {}", self.grid_addr, e)))
    }

    /// URL handed to spawned units
    pub fn grid_url(&self) -> String {
        format!("ws://{}", self.grid_addr)
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }

    pub fn registry(&self) -> CoordinationResult<UnitRegistry> {
        UnitRegistry::from_names(&self.unit_types)
    }

    /// Roster categories; each must be registered
    pub fn roster(&self) -> CoordinationResult<Vec<UnitCategory>> {
        let registry = self.registry()?;
        self.vision_roster
            .iter()
            .map(|name| registry.require(name))
            .collect()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
