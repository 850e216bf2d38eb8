//! Unit categories and mention resolution
//!
//! Mentions name a category either directly (`@zealot`), through a persona
//! that belongs to a collective (`@tassadar` → conclave), or through a
//! concrete unit id (`@zealot-3f9a01bc`). Resolution is a closed mapping;
//! anything outside it is unknown and never admitted.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoordinationError;

/// Canonical unit category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitCategory {
    Zealot,
    Archon,
    Arbiter,
    Oracle,
    Conclave,
    /// Heuristic unit; recognised in mentions but never spawned by one
    Probe,
}

impl UnitCategory {
    pub fn all() -> &'static [UnitCategory] {
        &[
            Self::Zealot,
            Self::Archon,
            Self::Arbiter,
            Self::Oracle,
            Self::Conclave,
            Self::Probe,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zealot => "zealot",
            Self::Archon => "archon",
            Self::Arbiter => "arbiter",
            Self::Oracle => "oracle",
            Self::Conclave => "conclave",
            Self::Probe => "probe",
        }
    }

    /// Whether an `@mention` may trigger a spawn of this category
    pub fn spawnable_by_mention(&self) -> bool {
        !matches!(self, Self::Probe)
    }

    /// Resolve a raw mention token or unit id to its category.
    ///
    /// Only the base token (before the first `-`) is considered, so
    /// `zealot-3f9a01bc` and `zealot` resolve identically.
    pub fn resolve(token: &str) -> Option<UnitCategory> {
        let lowered = token.trim().trim_start_matches('@').to_ascii_lowercase();
        let base = lowered.split('-').next().unwrap_or_default();
        match base {
            "zealot" => Some(Self::Zealot),
            "archon" => Some(Self::Archon),
            "arbiter" | "human" => Some(Self::Arbiter),
            "oracle" => Some(Self::Oracle),
            "conclave" | "tassadar" | "zeratul" | "artanis" | "fenix" => Some(Self::Conclave),
            "probe" => Some(Self::Probe),
            _ => None,
        }
    }

    /// Generate a fresh unit id of the form `{category}-{8 hex}`
    pub fn new_unit_id(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.as_str(), &suffix[..8])
    }
}

impl fmt::Display for UnitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitCategory {
    type Err = CoordinationError;

    /// Strict parse of a canonical category name (no persona aliases)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| CoordinationError::UnknownUnitType(s.to_string()))
    }
}

/// Set of categories a node is able to spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRegistry {
    registered: BTreeSet<UnitCategory>,
}

impl UnitRegistry {
    /// Build a registry from configured unit type names, rejecting any that
    /// do not map onto a canonical category
    pub fn from_names<I, S>(names: I) -> Result<Self, CoordinationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registered = names
            .into_iter()
            .map(|n| n.as_ref().parse::<UnitCategory>())
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self { registered })
    }

    /// Registry with every category
    pub fn all() -> Self {
        Self {
            registered: UnitCategory::all().iter().copied().collect(),
        }
    }

    pub fn contains(&self, category: UnitCategory) -> bool {
        self.registered.contains(&category)
    }

    /// Resolve a token to a registered category
    pub fn resolve(&self, token: &str) -> Option<UnitCategory> {
        UnitCategory::resolve(token).filter(|c| self.contains(*c))
    }

    /// Resolve a unit type name for spawning, failing with `UnknownUnitType`
    pub fn require(&self, unit_type: &str) -> Result<UnitCategory, CoordinationError> {
        self.resolve(unit_type)
            .ok_or_else(|| CoordinationError::UnknownUnitType(unit_type.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = UnitCategory> + '_ {
        self.registered.iter().copied()
    }
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::all()
    }
}
