//! Baseline fallback strategies.
//!
//! Deterministic built-in decision producers, one per agent kind. They are
//! used three ways: to synthesize coverage for agents without a bound script
//! (when the simulation allows it), to replace the output of a script that
//! failed in the sandbox, and to replace script output that failed schema
//! validation. Fallback decisions flow through the same merger as script
//! output and carry `Provenance::Baseline` in telemetry.
//!
//! The rules are intentionally simple dampened heuristics; domain-grade
//! behavior is what user scripts are for.

use crate::config::SimulationConfig;
use crate::models::{
    BankDecision, CentralBankDecision, FirmDecision, GovernmentDecision, HouseholdDecision,
    HouseholdState, TickDecisions, WorldState,
};

pub struct BaselineFallbacks;

impl BaselineFallbacks {
    /// Complete decision record for every agent in the world.
    pub fn tick_decisions(world: &WorldState, _config: &SimulationConfig) -> TickDecisions {
        TickDecisions {
            households: world
                .households
                .iter()
                .map(|(id, hh)| (id.clone(), Self::household(world, hh)))
                .collect(),
            firm: Self::firm(world),
            bank: Self::bank(world),
            central_bank: Self::central_bank(world),
            government: Self::government(world),
        }
    }

    pub fn household(world: &WorldState, hh: &HouseholdState) -> HouseholdDecision {
        let price = world.firm.price;
        // Spend most of current wage income plus a trickle of cash savings.
        let consumption_budget = (0.7 * hh.wage_income + 0.05 * hh.cash).min(hh.cash);
        let cash_buffer = 2.0 * price;
        let surplus = (hh.cash - consumption_budget - cash_buffer).max(0.0);
        let shortfall = (consumption_budget - hh.cash).max(0.0);
        HouseholdDecision {
            consumption_budget,
            max_price: price * 1.1,
            labor_supply: if hh.is_studying { 0.0 } else { 1.0 },
            reservation_wage: hh.reservation_wage,
            deposit_amount: 0.5 * surplus,
            withdrawal_amount: shortfall.min(hh.deposits),
            loan_request: 0.0,
            loan_rate_bid: world.bank.loan_rate,
            bond_bid_face: 0.0,
            study: false,
        }
    }

    pub fn firm(world: &WorldState) -> FirmDecision {
        let firm = &world.firm;
        let inventory_target = 2.0 * firm.planned_production;
        let price = if firm.inventory > inventory_target {
            firm.price * 0.98
        } else {
            firm.price * 1.02
        };
        let target_workforce = if firm.productivity > 0.0 {
            (firm.planned_production / firm.productivity).ceil() as u32
        } else {
            0
        };
        let hiring_demand = target_workforce.saturating_sub(firm.employees.len() as u32);
        FirmDecision {
            price: price.max(0.1),
            wage_offer: firm.wage_offer,
            planned_production: firm.planned_production,
            hiring_demand,
        }
    }

    pub fn bank(world: &WorldState) -> BankDecision {
        let policy_rate = world.central_bank.policy_rate;
        let free_reserves =
            (world.bank.reserves - world.central_bank.reserve_ratio * world.bank.deposits).max(0.0);
        BankDecision {
            deposit_rate: (policy_rate * 0.5).clamp(0.0, 1.0),
            loan_rate: (policy_rate + 0.02).clamp(0.0, 1.0),
            bond_bid_face: 0.25 * free_reserves,
        }
    }

    pub fn central_bank(world: &WorldState) -> CentralBankDecision {
        let cb = &world.central_bank;
        let inflation_gap = world.macro_stats.inflation - cb.inflation_target;
        let unemployment_gap = world.macro_stats.unemployment_rate - cb.unemployment_target;
        CentralBankDecision {
            policy_rate: (cb.policy_rate + 0.5 * inflation_gap - 0.2 * unemployment_gap)
                .clamp(0.0, 0.4),
            reserve_ratio: cb.reserve_ratio,
        }
    }

    pub fn government(world: &WorldState) -> GovernmentDecision {
        let gov = &world.government;
        GovernmentDecision {
            tax_rate: gov.tax_rate,
            spending: gov.spending,
            unemployment_benefit: gov.unemployment_benefit,
            bond_issuance: gov.bond_issuance_plan.max(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> WorldState {
        WorldState::initial("sim-1", &SimulationConfig::default())
    }

    #[test]
    fn covers_every_household() {
        let world = world();
        let decisions = BaselineFallbacks::tick_decisions(&world, &SimulationConfig::default());
        assert_eq!(decisions.households.len(), world.households.len());
    }

    #[test]
    fn is_deterministic() {
        let world = world();
        let cfg = SimulationConfig::default();
        let a = BaselineFallbacks::tick_decisions(&world, &cfg);
        let b = BaselineFallbacks::tick_decisions(&world, &cfg);
        assert_eq!(a, b);
    }

    #[test]
    fn household_budget_never_exceeds_cash() {
        let mut world = world();
        let hh = world.households.get_mut("000").unwrap();
        hh.cash = 1.0;
        hh.wage_income = 1_000.0;
        let decision = BaselineFallbacks::household(&world, &world.households["000"]);
        assert!(decision.consumption_budget <= 1.0 + 1e-9);
    }

    #[test]
    fn firm_price_respects_floor() {
        let mut world = world();
        world.firm.price = 0.1;
        world.firm.inventory = 1e9; // deep oversupply pushes the price down
        let decision = BaselineFallbacks::firm(&world);
        assert!(decision.price >= 0.1);
    }

    #[test]
    fn policy_rate_stays_in_band() {
        let mut world = world();
        world.macro_stats.inflation = 5.0;
        let decision = BaselineFallbacks::central_bank(&world);
        assert!(decision.policy_rate <= 0.4);
        world.macro_stats.inflation = -5.0;
        let decision = BaselineFallbacks::central_bank(&world);
        assert!(decision.policy_rate >= 0.0);
    }
}
