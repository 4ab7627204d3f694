//! Tick log entries.
//!
//! Append-only domain records of what happened inside a tick: market
//! clearing outcomes, script failures with provenance, macro readings.
//! Retained in full in the durable tier; a bounded recent window is also
//! cached. Distinct from `tracing` output, which is operational and never
//! persisted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickLogEntry {
    pub simulation_id: String,
    pub tick: u64,
    pub day: u64,
    pub message: String,
    /// Structured context; shape varies per message.
    pub context: Value,
    /// RFC-3339 timestamp, stamped by the store at persistence time. Absent
    /// on freshly produced entries so that log *contents* stay deterministic
    /// across replays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<String>,
}

impl TickLogEntry {
    pub fn new(
        simulation_id: impl Into<String>,
        tick: u64,
        day: u64,
        message: impl Into<String>,
        context: Value,
    ) -> Self {
        Self {
            simulation_id: simulation_id.into(),
            tick,
            day,
            message: message.into(),
            context,
            recorded_at: None,
        }
    }
}
