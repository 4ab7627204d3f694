//! Logic modules: pure market-clearing and evolution passes.
//!
//! Each module is a pure function
//! `(WorldState, TickDecisions, Config, TickContext) -> (commands, logs)`.
//! The orchestrator runs them in a fixed order, applying each module's
//! commands to an in-memory scratch world before invoking the next, then
//! applies the accumulated batch atomically at the store. Modules therefore
//! observe earlier modules' effects while external observers still see one
//! atomic tick.
//!
//! Determinism: every random draw derives from
//! `(global_seed, tick_index, purpose)` or, for per-agent noise,
//! `(global_seed + tick_index + agent_id)`; all iteration is over `BTreeMap`s.

pub mod finance;
pub mod goods;
pub mod labor;
pub mod macro_stats;
pub mod planning;
pub mod production;
pub mod settlement;
pub mod shocks;

use crate::config::SimulationConfig;
use crate::models::{StateUpdateCommand, TickDecisions, TickLogEntry, WorldState};
use serde_json::Value;

/// Immutable per-tick facts shared by every module.
#[derive(Debug, Clone)]
pub struct TickContext {
    pub simulation_id: String,
    /// 1-based index of the executing tick.
    pub tick_index: u64,
    /// Day the executing tick belongs to.
    pub day: u64,
    /// 1-based position within the day; 1 gates day-start work.
    pub tick_in_day: u64,
    pub seed: u64,
}

/// Commands plus structured log entries from one module run.
#[derive(Debug, Default)]
pub struct ModuleOutput {
    pub commands: Vec<StateUpdateCommand>,
    pub logs: Vec<TickLogEntry>,
}

impl ModuleOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, path: impl Into<String>, value: impl Into<Value>) {
        self.commands.push(StateUpdateCommand::assign(path, value));
    }

    pub fn delta(&mut self, path: impl Into<String>, amount: f64) {
        self.commands.push(StateUpdateCommand::delta(path, amount));
    }

    pub fn log(&mut self, ctx: &TickContext, message: &str, context: Value) {
        self.logs.push(TickLogEntry::new(
            ctx.simulation_id.clone(),
            ctx.tick_index,
            ctx.day,
            message,
            context,
        ));
    }
}

/// Dotted path to a household field.
pub(crate) fn hh_path(id: &str, field: &str) -> String {
    format!("households.{}.{}", id, field)
}

pub type LogicModule =
    fn(&WorldState, &TickDecisions, &SimulationConfig, &TickContext) -> ModuleOutput;

/// The fixed execution order of one tick. Conditional modules (shocks,
/// labor, day-start settlement flows) decide internally whether to act.
pub fn pipeline() -> [(&'static str, LogicModule); 8] {
    [
        ("shocks", shocks::run),
        ("labor_market", labor::run),
        ("agent_planning", planning::run),
        ("production", production::run),
        ("goods_market", goods::run),
        ("finance_market", finance::run),
        ("agent_settlement", settlement::run),
        ("macro_stats", macro_stats::run),
    ]
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::baseline::BaselineFallbacks;
    use crate::models::apply_commands;

    /// Build a default world/decisions pair for module tests.
    pub fn fixture(ticks_per_day: u64) -> (WorldState, TickDecisions, SimulationConfig) {
        let config = SimulationConfig {
            ticks_per_day,
            ..Default::default()
        };
        let world = WorldState::initial("sim-1", &config);
        let decisions = BaselineFallbacks::tick_decisions(&world, &config);
        (world, decisions, config)
    }

    pub fn ctx(tick_index: u64, ticks_per_day: u64) -> TickContext {
        TickContext {
            simulation_id: "sim-1".to_string(),
            tick_index,
            day: (tick_index - 1) / ticks_per_day,
            tick_in_day: ((tick_index - 1) % ticks_per_day) + 1,
            seed: 42,
        }
    }

    /// Apply a module's commands to a copy of the world.
    pub fn applied(world: &WorldState, output: &ModuleOutput) -> WorldState {
        let mut value = serde_json::to_value(world).unwrap();
        apply_commands(&mut value, &output.commands).unwrap();
        serde_json::from_value(value).unwrap()
    }
}
