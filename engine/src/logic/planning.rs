//! Agent planning: posts merged decisions into the world.
//!
//! Prices, rates and fiscal settings from the merged `TickDecisions` become
//! world state here, before the clearing passes read them. Study enrollment
//! is honored only at the first tick of a day and only for unemployed
//! households (`is_studying && employed` is a forbidden state).

use super::{hh_path, ModuleOutput, TickContext};
use crate::config::SimulationConfig;
use crate::models::{TickDecisions, WorldState};
use serde_json::json;

pub fn run(
    world: &WorldState,
    decisions: &TickDecisions,
    _config: &SimulationConfig,
    ctx: &TickContext,
) -> ModuleOutput {
    let mut out = ModuleOutput::new();

    out.assign("firm.price", decisions.firm.price);
    out.assign("firm.wage_offer", decisions.firm.wage_offer);
    out.assign("firm.planned_production", decisions.firm.planned_production);

    out.assign("bank.deposit_rate", decisions.bank.deposit_rate);
    out.assign("bank.loan_rate", decisions.bank.loan_rate);

    out.assign("central_bank.policy_rate", decisions.central_bank.policy_rate);
    out.assign("central_bank.reserve_ratio", decisions.central_bank.reserve_ratio);

    out.assign("government.tax_rate", decisions.government.tax_rate);
    out.assign("government.spending", decisions.government.spending);
    out.assign(
        "government.unemployment_benefit",
        decisions.government.unemployment_benefit,
    );
    out.assign(
        "government.bond_issuance_plan",
        decisions.government.bond_issuance,
    );

    let mut enrollments: Vec<String> = Vec::new();
    let mut withdrawals_from_study: Vec<String> = Vec::new();
    if ctx.tick_in_day == 1 {
        for (id, hh) in &world.households {
            let decision = &decisions.households[id];
            if decision.study && hh.employer_id.is_none() && !hh.is_studying {
                out.assign(hh_path(id, "is_studying"), true);
                enrollments.push(id.clone());
            } else if !decision.study && hh.is_studying {
                out.assign(hh_path(id, "is_studying"), false);
                withdrawals_from_study.push(id.clone());
            }
        }
    }

    out.log(
        ctx,
        "agent_planning",
        json!({
            "firm_price": decisions.firm.price,
            "policy_rate": decisions.central_bank.policy_rate,
            "study_enrolled": enrollments,
            "study_stopped": withdrawals_from_study,
        }),
    );
    out
}
