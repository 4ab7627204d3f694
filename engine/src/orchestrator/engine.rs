//! Orchestrator: the per-simulation control plane.
//!
//! Owns the lifecycle state machine, the single-writer-per-simulation
//! invariant, and the ten-step tick algorithm:
//!
//! ```text
//! For each tick:
//! 1. Acquire the simulation's writer slot (status -> Advancing)
//! 2. Read WorldState through the state store
//! 3. Coverage guard (missing scripts reject the tick, state stays Ready)
//! 4. Resolve bindings and trim per-binding contexts
//! 5. Dispatch bindings to the sandbox concurrently
//! 6. Record script failures; mark those bindings for fallback
//! 7. Merge admin + script + baseline decisions
//! 8. Run logic modules in fixed order against a scratch world
//! 9. Apply the accumulated commands atomically; append tick logs
//! 10. Tick/day advance; status -> Ready; return the summary
//! ```
//!
//! Mutation authority over world state lives exclusively here: every other
//! component produces values or commands.

use crate::baseline::BaselineFallbacks;
use crate::config::SimulationConfig;
use crate::core::time::TimeManager;
use crate::error::{EngineError, EngineResult};
use crate::logic::{pipeline, TickContext};
use crate::merge::DecisionMerger;
use crate::models::{
    apply_commands, AgentKind, MacroStats, Provenance, StateUpdateCommand, TickDecisionOverrides,
    TickLogEntry, WorldState,
};
use crate::registry::{ScriptRecord, ScriptRegistry};
use crate::sandbox::context::build_context;
use crate::sandbox::{BindingRef, InvocationRequest, ScriptEngine, ScriptFailureKind};
use crate::store::{SnapshotMeta, StateStore, TickLogQuery};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::coverage;

/// Lifecycle of one simulation. `Uninitialized` is represented by absence
/// from the control-plane map; `Advancing` doubles as the locked state
/// concurrent callers observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStatus {
    Ready,
    Advancing,
    Failed,
}

struct SimEntry {
    config: SimulationConfig,
    status: SimStatus,
    failure_stats: BTreeMap<ScriptFailureKind, u64>,
}

/// One script failure absorbed during a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptFailureEvent {
    pub binding: String,
    pub kind: ScriptFailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub simulation_id: String,
    pub tick: u64,
    pub day: u64,
    pub household_count: usize,
    pub participants: Vec<String>,
}

/// Result of one completed tick.
#[derive(Debug, Clone)]
pub struct TickResult {
    pub new_tick: u64,
    pub new_day: u64,
    pub logs: Vec<TickLogEntry>,
    pub macro_stats: MacroStats,
    pub script_failures: Vec<ScriptFailureEvent>,
    /// Winning decision source per section.
    pub provenance: BTreeMap<String, Provenance>,
}

/// Result of a `run_day` batch.
#[derive(Debug, Clone)]
pub struct DayResult {
    pub ticks_executed: u64,
    pub final_tick: u64,
    pub final_day: u64,
    pub macro_stats: MacroStats,
}

pub struct Orchestrator {
    store: Arc<StateStore>,
    registry: Arc<ScriptRegistry>,
    engine: Arc<dyn ScriptEngine>,
    sims: Mutex<HashMap<String, SimEntry>>,
}

impl Orchestrator {
    /// Wire the control plane from explicitly constructed components.
    pub fn new(
        store: Arc<StateStore>,
        registry: Arc<ScriptRegistry>,
        engine: Arc<dyn ScriptEngine>,
    ) -> Self {
        Self {
            store,
            registry,
            engine,
            sims: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create (or idempotently re-open) a simulation.
    pub fn create_simulation(
        &self,
        id: Option<String>,
        config: Option<SimulationConfig>,
        initial_participant: Option<&str>,
    ) -> EngineResult<SimulationSummary> {
        let config = config.unwrap_or_default();
        config.validate()?;
        let simulation_id = id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let world = self.store.ensure_simulation(&simulation_id, &config)?;
        {
            let mut sims = self.sims.lock();
            sims.entry(simulation_id.clone()).or_insert(SimEntry {
                config,
                status: SimStatus::Ready,
                failure_stats: BTreeMap::new(),
            });
        }
        if let Some(user) = initial_participant {
            self.store.register_participant(&simulation_id, user)?;
        }
        info!(simulation_id, "simulation created");
        self.summarize(&simulation_id, &world)
    }

    pub fn get_state(&self, simulation_id: &str) -> EngineResult<WorldState> {
        self.require_entry(simulation_id)?;
        self.store.get_world_state(simulation_id)
    }

    /// Delete world state but keep script bindings; a fresh initial world
    /// is recreated immediately so the simulation stays usable.
    pub fn reset_simulation(&self, simulation_id: &str) -> EngineResult<()> {
        let config = self.require_entry(simulation_id)?;
        self.store.reset_simulation(simulation_id, &config)?;
        self.store.ensure_simulation(simulation_id, &config)?;
        let mut sims = self.sims.lock();
        if let Some(entry) = sims.get_mut(simulation_id) {
            entry.status = SimStatus::Ready;
            entry.failure_stats.clear();
        }
        info!(simulation_id, "simulation reset");
        Ok(())
    }

    /// Remove the world and detach (not erase) every bound script.
    pub fn delete_simulation(&self, simulation_id: &str) -> EngineResult<()> {
        let config = self.require_entry(simulation_id)?;
        self.store.delete_simulation(simulation_id, &config)?;
        let detached = self.registry.detach_all_for_simulation(simulation_id)?;
        self.sims.lock().remove(simulation_id);
        info!(simulation_id, detached, "simulation deleted");
        Ok(())
    }

    pub fn register_participant(&self, simulation_id: &str, user_id: &str) -> EngineResult<()> {
        self.require_entry(simulation_id)?;
        self.store.register_participant(simulation_id, user_id)
    }

    pub fn list_participants(&self, simulation_id: &str) -> EngineResult<Vec<String>> {
        self.require_entry(simulation_id)?;
        self.store.list_participants(simulation_id)
    }

    pub fn list_tick_logs(
        &self,
        simulation_id: &str,
        query: &TickLogQuery,
    ) -> EngineResult<Vec<TickLogEntry>> {
        self.require_entry(simulation_id)?;
        self.store.list_tick_logs(simulation_id, query)
    }

    pub fn list_snapshots(&self, simulation_id: &str) -> EngineResult<Vec<SnapshotMeta>> {
        self.require_entry(simulation_id)?;
        self.store.list_snapshots(simulation_id)
    }

    /// Override the per-user script quota for one simulation
    /// (`simulation_limits` row; the registry default applies otherwise).
    pub fn set_script_limit(&self, simulation_id: &str, limit: u32) -> EngineResult<()> {
        self.require_entry(simulation_id)?;
        Ok(self.store.durable().set_script_limit(simulation_id, limit)?)
    }

    /// Per-kind counts of script failures absorbed since creation/reset.
    pub fn script_failure_stats(
        &self,
        simulation_id: &str,
    ) -> EngineResult<BTreeMap<ScriptFailureKind, u64>> {
        let sims = self.sims.lock();
        sims.get(simulation_id)
            .map(|entry| entry.failure_stats.clone())
            .ok_or_else(|| EngineError::NotFound(format!("simulation {}", simulation_id)))
    }

    // ------------------------------------------------------------------
    // Script facade
    // ------------------------------------------------------------------

    pub fn register_script(
        &self,
        user_id: &str,
        code: &str,
        agent_kind: AgentKind,
        entity_id: Option<String>,
        simulation_id: Option<String>,
        description: &str,
    ) -> EngineResult<Uuid> {
        if let Some(sim) = &simulation_id {
            self.require_entry(sim)?;
        }
        self.registry
            .register_script(user_id, code, agent_kind, entity_id, simulation_id, description)
    }

    pub fn attach_script(
        &self,
        script_id: Uuid,
        simulation_id: &str,
        entity_id: Option<String>,
    ) -> EngineResult<()> {
        self.require_entry(simulation_id)?;
        self.registry.attach_script(script_id, simulation_id, entity_id)
    }

    pub fn detach_script(&self, script_id: Uuid) -> EngineResult<()> {
        self.registry.detach_script(script_id)
    }

    pub fn delete_script(&self, script_id: Uuid) -> EngineResult<()> {
        self.registry.delete_script(script_id)
    }

    pub fn list_user_scripts(&self, user_id: &str) -> Vec<ScriptRecord> {
        self.registry.list_user_scripts(user_id)
    }

    pub fn list_simulation_scripts(&self, simulation_id: &str) -> Vec<ScriptRecord> {
        self.registry.list_simulation_scripts(simulation_id)
    }

    /// Replace a bound script's code; permitted only while its simulation
    /// sits at a day boundary. Library scripts update at any time.
    pub fn update_script_code(&self, script_id: Uuid, new_code: &str) -> EngineResult<Uuid> {
        let record = self.registry.get_script(script_id)?;
        if let Some(simulation_id) = &record.simulation_id {
            let config = self.require_entry(simulation_id)?;
            let world = self.store.get_world_state(simulation_id)?;
            let time = TimeManager::new(config.ticks_per_day);
            if !time.is_day_boundary(world.tick) {
                return Err(EngineError::NotAtDayBoundary {
                    simulation_id: simulation_id.clone(),
                    tick: world.tick,
                });
            }
        }
        self.registry.update_script_code(script_id, new_code)
    }

    // ------------------------------------------------------------------
    // Tick advancement
    // ------------------------------------------------------------------

    /// Execute one tick. Script failures are absorbed (fallback); fatal
    /// errors freeze the simulation until reset.
    pub fn run_tick(
        &self,
        simulation_id: &str,
        admin_overrides: Option<TickDecisionOverrides>,
    ) -> EngineResult<TickResult> {
        let config = self.begin_advance(simulation_id)?;
        let outcome = self.execute_tick(simulation_id, &config, admin_overrides);
        self.finish_advance(simulation_id, &outcome);
        outcome
    }

    /// Advance until the day boundary is crossed or the tick quota is
    /// reached, whichever comes first.
    pub fn run_day(
        &self,
        simulation_id: &str,
        ticks_in_day: Option<u64>,
    ) -> EngineResult<DayResult> {
        let config = self.require_entry(simulation_id)?;
        let time = TimeManager::new(config.ticks_per_day);
        let world = self.store.get_world_state(simulation_id)?;
        let start_day = time.day_of(world.tick);
        let remaining_in_day = config.ticks_per_day - (world.tick % config.ticks_per_day);
        let quota = ticks_in_day.unwrap_or(remaining_in_day).max(1);

        let mut executed = 0;
        let mut last: Option<TickResult> = None;
        loop {
            let result = self.run_tick(simulation_id, None)?;
            executed += 1;
            let crossed = result.new_day > start_day;
            last = Some(result);
            if crossed || executed >= quota {
                break;
            }
        }
        let last = last.expect("at least one tick executed");
        Ok(DayResult {
            ticks_executed: executed,
            final_tick: last.new_tick,
            final_day: last.new_day,
            macro_stats: last.macro_stats,
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn summarize(&self, simulation_id: &str, world: &WorldState) -> EngineResult<SimulationSummary> {
        Ok(SimulationSummary {
            simulation_id: simulation_id.to_string(),
            tick: world.tick,
            day: world.day,
            household_count: world.households.len(),
            participants: self.store.list_participants(simulation_id)?,
        })
    }

    fn require_entry(&self, simulation_id: &str) -> EngineResult<SimulationConfig> {
        let sims = self.sims.lock();
        sims.get(simulation_id)
            .map(|entry| entry.config.clone())
            .ok_or_else(|| EngineError::NotFound(format!("simulation {}", simulation_id)))
    }

    /// Claim the writer slot: `Ready -> Advancing`.
    fn begin_advance(&self, simulation_id: &str) -> EngineResult<SimulationConfig> {
        let mut sims = self.sims.lock();
        let entry = sims
            .get_mut(simulation_id)
            .ok_or_else(|| EngineError::NotFound(format!("simulation {}", simulation_id)))?;
        match entry.status {
            SimStatus::Ready => {
                entry.status = SimStatus::Advancing;
                Ok(entry.config.clone())
            }
            SimStatus::Advancing | SimStatus::Failed => {
                Err(EngineError::SimulationLocked(simulation_id.to_string()))
            }
        }
    }

    /// Release the writer slot, freezing the simulation on fatal errors.
    fn finish_advance(&self, simulation_id: &str, outcome: &EngineResult<TickResult>) {
        let mut sims = self.sims.lock();
        let Some(entry) = sims.get_mut(simulation_id) else {
            return;
        };
        match outcome {
            Ok(result) => {
                entry.status = SimStatus::Ready;
                for event in &result.script_failures {
                    *entry.failure_stats.entry(event.kind).or_default() += 1;
                }
            }
            Err(err) if err.is_fatal() => {
                warn!(simulation_id, %err, "tick failed fatally; freezing simulation");
                entry.status = SimStatus::Failed;
            }
            Err(_) => {
                entry.status = SimStatus::Ready;
            }
        }
    }

    fn execute_tick(
        &self,
        simulation_id: &str,
        config: &SimulationConfig,
        admin_overrides: Option<TickDecisionOverrides>,
    ) -> EngineResult<TickResult> {
        // Step 2: pre-tick snapshot.
        let world = self.store.get_world_state(simulation_id)?;
        let time = TimeManager::new(config.ticks_per_day);
        let tick_index = time.executing_index(world.tick);
        let ctx = TickContext {
            simulation_id: simulation_id.to_string(),
            tick_index,
            day: world.day,
            tick_in_day: time.tick_in_day(tick_index),
            seed: config.global_rng_seed,
        };

        // Step 3: coverage guard.
        let bindings = self.registry.resolve_bindings(simulation_id);
        coverage::check(&world, &bindings, config.allow_fallback_for_missing)
            .map_err(|missing| EngineError::MissingAgentScripts { missing })?;

        // Step 4: trim contexts.
        let mut requests = Vec::new();
        for ((agent_kind, entity_id), record) in &bindings {
            let binding = BindingRef {
                agent_kind: *agent_kind,
                entity_id: entity_id.clone(),
            };
            match build_context(&world, config, &binding) {
                Some(context) => requests.push(InvocationRequest {
                    binding,
                    code: record.code.clone(),
                    code_version: record.code_version,
                    context,
                }),
                None => {
                    // Bound entity no longer exists in the world; the
                    // binding is simply inert this tick.
                    warn!(simulation_id, binding = %binding, "binding has no world entity");
                }
            }
        }

        // Step 5: concurrent dispatch. Replies arrive in completion order;
        // re-sort by binding so failure logs replay identically.
        let mut raw_results = self.engine.execute_batch(requests);
        raw_results.sort_by(|a, b| a.0.cmp(&b.0));

        // Step 6: absorb failures, collect successes.
        let mut script_outputs: BTreeMap<BindingRef, serde_json::Value> = BTreeMap::new();
        let mut script_failures = Vec::new();
        let mut logs: Vec<TickLogEntry> = Vec::new();
        for (binding, result) in raw_results {
            match result {
                Ok(value) => {
                    script_outputs.insert(binding, value);
                }
                Err(failure) => {
                    logs.push(TickLogEntry::new(
                        simulation_id,
                        tick_index,
                        ctx.day,
                        "script_failure",
                        json!({
                            "binding": binding.to_string(),
                            "kind": failure.kind,
                            "message": failure.message,
                        }),
                    ));
                    script_failures.push(ScriptFailureEvent {
                        binding: binding.to_string(),
                        kind: failure.kind,
                        message: failure.message,
                    });
                }
            }
        }

        // Step 7: merge decision sources.
        let baseline = BaselineFallbacks::tick_decisions(&world, config);
        let merge = DecisionMerger::merge(
            simulation_id,
            tick_index,
            ctx.day,
            &baseline,
            &script_outputs,
            admin_overrides.as_ref(),
        );
        logs.extend(merge.warnings);
        let decisions = merge.decisions;

        // Step 8: logic modules over a scratch world.
        let mut scratch = world.clone();
        let mut commands: Vec<StateUpdateCommand> = Vec::new();
        for (name, module) in pipeline() {
            let output = module(&scratch, &decisions, config, &ctx);
            if !output.commands.is_empty() {
                let mut value =
                    serde_json::to_value(&scratch).expect("world state serializes");
                apply_commands(&mut value, &output.commands).map_err(|e| {
                    EngineError::InvariantViolation {
                        simulation_id: simulation_id.to_string(),
                        detail: format!("{} emitted an invalid command: {}", name, e),
                    }
                })?;
                scratch = serde_json::from_value(value).map_err(|e| {
                    EngineError::InvariantViolation {
                        simulation_id: simulation_id.to_string(),
                        detail: format!("{} broke the world schema: {}", name, e),
                    }
                })?;
            }
            commands.extend(output.commands);
            logs.extend(output.logs);
        }

        // Step 10 part one: tick/day advancement joins the same batch.
        commands.push(StateUpdateCommand::assign("tick", tick_index));
        commands.push(StateUpdateCommand::assign("day", time.day_of(tick_index)));

        // Step 9: atomic apply + log append.
        let updated = self.store.apply_updates(simulation_id, &commands, config)?;
        self.store.record_tick(simulation_id, &logs, config)?;

        // Day-boundary snapshot (supplementary persistence).
        if config.features.snapshot_on_day_boundary && time.is_day_boundary(updated.tick) {
            self.store.snapshot_world(simulation_id, config)?;
        }

        Ok(TickResult {
            new_tick: updated.tick,
            new_day: updated.day,
            logs,
            macro_stats: updated.macro_stats,
            script_failures,
            provenance: merge.provenance,
        })
    }
}
