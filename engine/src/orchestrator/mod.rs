//! Control plane: simulation lifecycle, coverage guard, tick/day advance.

pub mod coverage;
mod engine;

pub use engine::{
    DayResult, Orchestrator, ScriptFailureEvent, SimStatus, SimulationSummary, TickResult,
};
