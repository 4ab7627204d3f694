//! Labor market clearing. Runs only on the first tick of each day.
//!
//! Candidates are unemployed households offering labor (`labor_supply > 0`)
//! that are not studying (and not about to start) and whose reservation wage
//! the firm's offer meets. Matching score is
//! `0.8 * normalized_productivity + 0.2 * noise`, noise seeded per agent by
//! `(global_seed + tick_index + agent_id)`. The top-k candidates fill the
//! firm's hiring demand; ties break by score, then by agent id.

use super::{hh_path, ModuleOutput, TickContext};
use crate::config::SimulationConfig;
use crate::models::{TickDecisions, WorldState, FIRM_ID};
use crate::rng::RngManager;
use serde_json::json;

struct Candidate {
    id: String,
    score: f64,
}

pub fn run(
    world: &WorldState,
    decisions: &TickDecisions,
    _config: &SimulationConfig,
    ctx: &TickContext,
) -> ModuleOutput {
    let mut out = ModuleOutput::new();
    if ctx.tick_in_day != 1 {
        return out;
    }

    let wage_offer = decisions.firm.wage_offer;
    let hiring_demand = decisions.firm.hiring_demand as usize;

    let eligible: Vec<(&String, f64)> = world
        .households
        .iter()
        .filter(|(id, hh)| {
            let decision = &decisions.households[*id];
            hh.employer_id.is_none()
                && !hh.is_studying
                && !decision.study
                && decision.labor_supply > 0.0
                && decision.reservation_wage <= wage_offer
        })
        .map(|(id, hh)| (id, hh.effective_productivity()))
        .collect();

    let max_productivity = eligible
        .iter()
        .map(|(_, p)| *p)
        .fold(0.0_f64, f64::max);

    let mut candidates: Vec<Candidate> = eligible
        .into_iter()
        .map(|(id, productivity)| {
            let normalized = if max_productivity > 0.0 {
                productivity / max_productivity
            } else {
                0.0
            };
            let noise = RngManager::for_agent(ctx.seed, ctx.tick_index, id).next_f64();
            Candidate {
                id: id.clone(),
                score: 0.8 * normalized + 0.2 * noise,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    let hired: Vec<String> = candidates
        .into_iter()
        .take(hiring_demand)
        .map(|c| c.id)
        .collect();

    if !hired.is_empty() {
        let mut roster = world.firm.employees.clone();
        for id in &hired {
            out.assign(hh_path(id, "employment_status"), "employed_firm");
            out.assign(hh_path(id, "employer_id"), FIRM_ID);
            roster.push(id.clone());
        }
        // Keep the roster in sync with employer_id in the same batch.
        out.assign("firm.employees", serde_json::to_value(&roster).expect("roster serializes"));
    }

    out.log(
        ctx,
        "labor_market",
        json!({
            "hiring_demand": hiring_demand,
            "hired": hired,
            "wage_offer": wage_offer,
        }),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::testutil::{applied, ctx, fixture};
    use crate::models::EmploymentStatus;

    #[test]
    fn skips_mid_day_ticks() {
        let (world, decisions, config) = fixture(3);
        let out = run(&world, &decisions, &config, &ctx(2, 3));
        assert!(out.commands.is_empty());
        assert!(out.logs.is_empty());
    }

    #[test]
    fn hires_up_to_demand_with_roster_co_update() {
        let (world, mut decisions, config) = fixture(3);
        decisions.firm.hiring_demand = 2;
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let updated = applied(&world, &out);

        let employed: Vec<&String> = updated
            .households
            .iter()
            .filter(|(_, h)| h.employment_status == EmploymentStatus::EmployedFirm)
            .map(|(id, _)| id)
            .collect();
        assert_eq!(employed.len(), 2);
        assert_eq!(updated.firm.employees.len(), 2);
        updated.check_invariants(config.ticks_per_day).unwrap();
    }

    #[test]
    fn studying_households_are_not_candidates() {
        let (mut world, mut decisions, config) = fixture(3);
        world.households.get_mut("000").unwrap().is_studying = true;
        decisions.firm.hiring_demand = 3;
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let updated = applied(&world, &out);
        assert!(updated.households["000"].employer_id.is_none());
        assert_eq!(updated.firm.employees.len(), 2);
    }

    #[test]
    fn reservation_wage_filters_candidates() {
        let (world, mut decisions, config) = fixture(3);
        decisions.firm.hiring_demand = 3;
        decisions
            .households
            .get_mut("001")
            .unwrap()
            .reservation_wage = 1e9;
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let updated = applied(&world, &out);
        assert!(updated.households["001"].employer_id.is_none());
    }

    #[test]
    fn matching_is_deterministic() {
        let (world, mut decisions, config) = fixture(3);
        decisions.firm.hiring_demand = 1;
        let first = run(&world, &decisions, &config, &ctx(1, 3));
        let second = run(&world, &decisions, &config, &ctx(1, 3));
        assert_eq!(first.commands, second.commands);
    }

    #[test]
    fn ties_break_by_agent_id() {
        // Zero demand for noise separation: all households identical skills,
        // but per-agent noise streams still differ, so just verify that two
        // runs order identically and hiring never exceeds demand.
        let (world, mut decisions, config) = fixture(3);
        decisions.firm.hiring_demand = 2;
        let a = run(&world, &decisions, &config, &ctx(1, 3));
        let b = run(&world, &decisions, &config, &ctx(1, 3));
        assert_eq!(a.commands, b.commands);
        let hired = applied(&world, &a).firm.employees;
        assert_eq!(hired.len(), 2);
    }
}
