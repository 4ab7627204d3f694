//! Simulation Orchestration Engine.
//!
//! Core of a multi-tenant macroeconomic agent-based platform: many users
//! concurrently upload policy scripts that drive heterogeneous agents
//! (households, firm, bank, central bank, government) through a shared,
//! discrete-time world.
//!
//! # Architecture
//!
//! - **core / rng**: time arithmetic and deterministic randomness
//! - **models**: typed world state, decisions, update commands, tick logs
//! - **store**: two-tier state store (in-process cache + SQLite durable)
//! - **registry**: script catalog, bindings, quotas, static validation
//! - **sandbox**: pooled interpreter subprocesses with resource caps
//! - **baseline / merge**: fallback strategies and decision composition
//! - **logic**: pure market-clearing and evolution modules
//! - **orchestrator**: the control plane tying it together
//!
//! # Critical Invariants
//!
//! 1. World state mutates only through `StateUpdateCommand` batches applied
//!    atomically by the store, driven by the orchestrator.
//! 2. All randomness is seeded from `(global_seed, tick_index, purpose)`;
//!    identical inputs replay to identical worlds and tick logs.
//! 3. A simulation has at most one tick in flight; ticks are strictly
//!    serialized and monotonically numbered.

pub mod baseline;
pub mod config;
pub mod core;
pub mod error;
pub mod logic;
pub mod merge;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod sandbox;
pub mod store;

mod rng;

// Re-exports for convenience
pub use config::{BondCouponMode, FeatureFlags, SimulationConfig};
pub use crate::core::time::TimeManager;
pub use error::{EngineError, EngineResult};
pub use models::{
    AgentKind, StateUpdateCommand, TickDecisionOverrides, TickDecisions, TickLogEntry, WorldState,
};
pub use orchestrator::{DayResult, Orchestrator, SimulationSummary, TickResult};
pub use registry::ScriptRegistry;
pub use rng::RngManager;
pub use sandbox::{
    BindingRef, InvocationRequest, InvocationResult, SandboxExecutor, ScriptEngine, ScriptFailure,
    ScriptFailureKind,
};
pub use store::{MemoryCache, SqliteStore, StateStore, TickLogQuery};
