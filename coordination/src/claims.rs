//! Work claims: an agent announces what it is doing and only that agent may
//! close it

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoordinationError, CoordinationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Active,
    Complete,
}

/// A unit of work owned by one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkClaim {
    pub claim_id: String,
    pub agent_id: String,
    pub coordination_id: String,
    pub content: String,
    pub status: ClaimStatus,
}

#[derive(Debug, Default)]
pub struct ClaimRegistry {
    claims: HashMap<String, WorkClaim>,
}

impl ClaimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a claim and return its 8-hex id
    pub fn claim(&mut self, agent_id: &str, coordination_id: &str, content: &str) -> String {
        let claim_id = loop {
            let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
            if !self.claims.contains_key(&id) {
                break id;
            }
        };

        info!(claim_id = %claim_id, agent_id, coordination_id, "Work claimed");
        self.claims.insert(
            claim_id.clone(),
            WorkClaim {
                claim_id: claim_id.clone(),
                agent_id: agent_id.to_string(),
                coordination_id: coordination_id.to_string(),
                content: content.to_string(),
                status: ClaimStatus::Active,
            },
        );
        claim_id
    }

    /// Close a claim. Only its owner may; closing twice is a no-op.
    pub fn complete(&mut self, claim_id: &str, agent_id: &str) -> CoordinationResult<()> {
        let claim = self
            .claims
            .get_mut(claim_id)
            .ok_or_else(|| CoordinationError::ClaimNotFound(claim_id.to_string()))?;

        if claim.agent_id != agent_id {
            return Err(CoordinationError::SovereigntyViolation {
                actor: agent_id.to_string(),
                resource: format!("claim {claim_id}"),
            });
        }

        if claim.status == ClaimStatus::Complete {
            debug!(claim_id, "Claim already complete");
            return Ok(());
        }
        claim.status = ClaimStatus::Complete;
        info!(claim_id, agent_id, "Claim completed");
        Ok(())
    }

    pub fn get(&self, claim_id: &str) -> Option<&WorkClaim> {
        self.claims.get(claim_id)
    }
}
