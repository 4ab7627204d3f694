//! Shock injection. Active only when `features.shock_enabled` is set.
//!
//! Draws a multiplicative firm-productivity disturbance from a truncated
//! normal under the purpose-tagged stream, so an enabled-but-quiet economy
//! still replays identically.

use super::{ModuleOutput, TickContext};
use crate::config::SimulationConfig;
use crate::models::{TickDecisions, WorldState};
use crate::rng::RngManager;
use serde_json::json;

const SHOCK_STD_DEV: f64 = 0.05;
const SHOCK_FLOOR: f64 = 0.8;
const SHOCK_CEIL: f64 = 1.2;

pub fn run(
    world: &WorldState,
    _decisions: &TickDecisions,
    config: &SimulationConfig,
    ctx: &TickContext,
) -> ModuleOutput {
    let mut out = ModuleOutput::new();
    if !config.features.shock_enabled {
        return out;
    }

    let mut rng = RngManager::for_purpose(ctx.seed, ctx.tick_index, "shock");
    let factor = rng.truncated_normal(1.0, SHOCK_STD_DEV, SHOCK_FLOOR, SHOCK_CEIL);
    let shocked = (world.firm.productivity * factor).max(0.1);

    out.assign("firm.productivity", shocked);
    out.log(
        ctx,
        "shock_injected",
        json!({ "factor": factor, "productivity": shocked }),
    );
    out
}
