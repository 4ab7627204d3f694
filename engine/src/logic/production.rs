//! Production: the firm converts labor into inventory.
//!
//! Capacity is the firm's productivity multiplied by the effective
//! productivity of its workforce; output is capped by the plan posted in
//! the planning pass.

use super::{ModuleOutput, TickContext};
use crate::config::SimulationConfig;
use crate::models::{TickDecisions, WorldState};
use serde_json::json;

pub fn run(
    world: &WorldState,
    _decisions: &TickDecisions,
    _config: &SimulationConfig,
    ctx: &TickContext,
) -> ModuleOutput {
    let mut out = ModuleOutput::new();

    let workforce: f64 = world
        .firm
        .employees
        .iter()
        .filter_map(|id| world.households.get(id))
        .map(|hh| hh.effective_productivity())
        .sum();
    let capacity = world.firm.productivity * workforce;
    let output = capacity.min(world.firm.planned_production);

    if output > 0.0 {
        out.delta("firm.inventory", output);
    }
    out.log(
        ctx,
        "production",
        json!({
            "output": output,
            "capacity": capacity,
            "workforce": world.firm.employees.len(),
        }),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::testutil::{applied, ctx, fixture};
    use crate::models::{EmploymentStatus, FIRM_ID};

    #[test]
    fn no_workforce_means_no_output() {
        let (world, decisions, config) = fixture(3);
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let updated = applied(&world, &out);
        assert_eq!(updated.firm.inventory, world.firm.inventory);
    }

    #[test]
    fn output_capped_by_plan() {
        let (mut world, decisions, config) = fixture(3);
        {
            let hh = world.households.get_mut("000").unwrap();
            hh.employment_status = EmploymentStatus::EmployedFirm;
            hh.employer_id = Some(FIRM_ID.to_string());
            hh.skill = 1000.0;
        }
        world.firm.employees.push("000".to_string());
        world.firm.planned_production = 5.0;

        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let updated = applied(&world, &out);
        assert!((updated.firm.inventory - world.firm.inventory - 5.0).abs() < 1e-9);
    }
}
