//! Error taxonomy for the coordination substrate
//!
//! Boundary failures (malformed envelopes, events missing a coordination id)
//! are recovered where they occur and only logged; spawn failures travel back
//! to the caller as typed errors so event loops keep running.

use thiserror::Error;

/// Result type alias for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors raised by the bus, coordinator, observer, grid and gateway
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    /// Spawn requested for a category that is not registered
    #[error("Unknown unit type: {0}")]
    UnknownUnitType(String),

    /// An actor tried to mutate state it does not own
    #[error("Sovereignty violation: {actor} does not own {resource}")]
    SovereigntyViolation { actor: String, resource: String },

    /// A critical event type was published without a coordination id
    #[error("Event type '{0}' requires a coordination_id")]
    MissingCoordinationId(String),

    /// Grid target never completed its connection handshake
    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// Wire frame did not parse into the PSI envelope shape
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Publish attempted after the bus was torn down
    #[error("Bus closed")]
    BusClosed,

    #[error("Claim not found: {0}")]
    ClaimNotFound(String),

    /// The spawn collaborator failed after admission
    #[error("Failed to spawn {unit_type}: {reason}")]
    SpawnFailed { unit_type: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CoordinationError {
    /// Stable machine-readable code, used in gateway error frames
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownUnitType(_) => "UNKNOWN_UNIT_TYPE",
            Self::SovereigntyViolation { .. } => "SOVEREIGNTY_VIOLATION",
            Self::MissingCoordinationId(_) => "MISSING_COORDINATION_ID",
            Self::ConnectionUnavailable(_) => "CONNECTION_UNAVAILABLE",
            Self::MalformedEnvelope(_) => "MALFORMED_ENVELOPE",
            Self::BusClosed => "BUS_CLOSED",
            Self::ClaimNotFound(_) => "CLAIM_NOT_FOUND",
            Self::SpawnFailed { .. } => "SPAWN_FAILED",
            Self::Config(_) => "CONFIG",
        }
    }

    /// Whether the failure was recovered at the boundary rather than surfaced
    pub fn is_boundary_rejection(&self) -> bool {
        matches!(
            self,
            Self::MissingCoordinationId(_) | Self::MalformedEnvelope(_)
        )
    }
}
