//! Engine-wide error taxonomy.
//!
//! Every public operation returns [`EngineError`]; each variant carries the
//! offending identifiers and maps to a stable numeric code for the transport
//! layer via [`EngineError::code`]. Script failures are deliberately absent
//! here: they are absorbed per-binding by the orchestrator (fallback path)
//! and surface only in tick logs and telemetry.
//!
//! Messages name simulation/script/agent ids but never filesystem paths or
//! connection strings.

use crate::store::{CacheError, DurableStoreError};
use thiserror::Error;

/// Result alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    // --- Validation -------------------------------------------------------
    /// Script source failed static validation (syntax or forbidden construct).
    #[error("invalid script: {0}")]
    InvalidScript(String),

    /// A decision override did not match the `TickDecisions` schema.
    #[error("invalid override for {section}: {reason}")]
    InvalidOverride { section: String, reason: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    // --- Authorization / state -------------------------------------------
    #[error("not found: {0}")]
    NotFound(String),

    /// The `(simulation, agent_kind, entity)` triple already has a script.
    #[error("conflicting binding for simulation {simulation_id}: {agent_kind}/{entity}")]
    ConflictingBinding {
        simulation_id: String,
        agent_kind: String,
        entity: String,
    },

    #[error("script quota exceeded for user {user_id} (limit {limit})")]
    QuotaExceeded { user_id: String, limit: u32 },

    /// Code updates for bound scripts are only permitted at day boundaries.
    #[error("simulation {simulation_id} is mid-day (tick {tick}); retry at a day boundary")]
    NotAtDayBoundary { simulation_id: String, tick: u64 },

    /// The simulation has a tick in flight or is frozen after a fatal error.
    #[error("simulation {0} is locked")]
    SimulationLocked(String),

    // --- Coverage ---------------------------------------------------------
    /// One or more required agents have neither a script nor an authorized
    /// fallback. Lists the unbound agents.
    #[error("missing agent scripts: {}", missing.join(", "))]
    MissingAgentScripts { missing: Vec<String> },

    // --- Persistence ------------------------------------------------------
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Durable(#[from] DurableStoreError),

    /// The durable-write retry budget was exhausted; the simulation is
    /// frozen until reset or manual resolution.
    #[error("persistence retry budget exhausted for simulation {0}")]
    Persistence(String),

    // --- Invariant --------------------------------------------------------
    /// Post-apply invariant check failed (e.g. negative balance). Fatal for
    /// the simulation.
    #[error("invariant violation in simulation {simulation_id}: {detail}")]
    InvariantViolation {
        simulation_id: String,
        detail: String,
    },
}

impl EngineError {
    /// Stable numeric code consumed by the (out-of-scope) transport layer.
    pub fn code(&self) -> u16 {
        match self {
            EngineError::InvalidScript(_) => 1001,
            EngineError::InvalidOverride { .. } => 1002,
            EngineError::InvalidConfig(_) => 1003,
            EngineError::NotFound(_) => 2001,
            EngineError::ConflictingBinding { .. } => 2002,
            EngineError::QuotaExceeded { .. } => 2003,
            EngineError::NotAtDayBoundary { .. } => 2004,
            EngineError::SimulationLocked(_) => 2005,
            EngineError::MissingAgentScripts { .. } => 3001,
            EngineError::Cache(_) => 4001,
            EngineError::Durable(_) => 4002,
            EngineError::Persistence(_) => 4003,
            EngineError::InvariantViolation { .. } => 5001,
        }
    }

    /// Errors that freeze the simulation (state -> `Failed`) until reset.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Persistence(_) | EngineError::InvariantViolation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_per_kind() {
        let err = EngineError::MissingAgentScripts {
            missing: vec!["household:007".to_string()],
        };
        assert_eq!(err.code(), 3001);
        assert!(err.to_string().contains("household:007"));
    }

    #[test]
    fn only_persistence_and_invariant_are_fatal() {
        assert!(EngineError::Persistence("sim-1".into()).is_fatal());
        assert!(EngineError::InvariantViolation {
            simulation_id: "sim-1".into(),
            detail: "negative cash".into(),
        }
        .is_fatal());
        assert!(!EngineError::SimulationLocked("sim-1".into()).is_fatal());
        assert!(!EngineError::NotFound("sim-1".into()).is_fatal());
    }
}
