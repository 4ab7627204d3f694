//! Macro statistics: recomputed from the post-clearing world every tick.
//!
//! GDP here is the value of household consumption cleared this tick;
//! inflation is the per-tick relative change of the price index.

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

    let total = world.households.len() as f64;
    let unemployed = world
        .households
        .values()
        .filter(|h| h.employer_id.is_none())
        .count() as f64;
    let unemployment_rate = if total > 0.0 { unemployed / total } else { 0.0 };

    let gdp: f64 = world.households.values().map(|h| h.last_consumption).sum();

    let previous_index = world.macro_stats.price_index;
    let price_index = world.firm.price;
    let inflation = if previous_index > 0.0 {
        (price_index - previous_index) / previous_index
    } else {
        0.0
    };
    let wage_index = world.firm.wage_offer;

    out.assign("macro.gdp", gdp);
    out.assign("macro.inflation", inflation);
    out.assign("macro.unemployment_rate", unemployment_rate);
    out.assign("macro.price_index", price_index);
    out.assign("macro.wage_index", wage_index);

    out.log(
        ctx,
        "macro",
        json!({
            "gdp": gdp,
            "inflation": inflation,
            "unemployment_rate": unemployment_rate,
            "price_index": price_index,
            "wage_index": wage_index,
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
    fn unemployment_counts_employer_links() {
        let (mut world, decisions, config) = fixture(3);
        {
            let hh = world.households.get_mut("000").unwrap();
            hh.employment_status = EmploymentStatus::EmployedFirm;
            hh.employer_id = Some(FIRM_ID.to_string());
        }
        world.firm.employees.push("000".to_string());
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let updated = applied(&world, &out);
        assert!((updated.macro_stats.unemployment_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn inflation_tracks_price_index_change() {
        let (mut world, decisions, config) = fixture(3);
        world.macro_stats.price_index = 10.0;
        world.firm.price = 11.0;
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let updated = applied(&world, &out);
        assert!((updated.macro_stats.inflation - 0.1).abs() < 1e-9);
        assert_eq!(updated.macro_stats.price_index, 11.0);
    }

    #[test]
    fn gdp_sums_consumption() {
        let (mut world, decisions, config) = fixture(3);
        world.households.get_mut("000").unwrap().last_consumption = 12.0;
        world.households.get_mut("001").unwrap().last_consumption = 8.0;
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let updated = applied(&world, &out);
        assert!((updated.macro_stats.gdp - 20.0).abs() < 1e-9);
    }
}
