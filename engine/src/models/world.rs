//! World state: the per-simulation aggregate of all agent records.
//!
//! The aggregate exists iff the simulation exists; every persisted update is
//! the result of a completed tick or a reset. Serialization is `serde_json`
//! end to end: the cache tier stores this struct's JSON form, and update
//! commands address leaves by their serialized field paths (for example
//! `households.000.cash` or `macro.price_index`).

use crate::config::SimulationConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Employer id used by the singleton firm.
pub const FIRM_ID: &str = "firm";
/// Employer id used by the government.
pub const GOVERNMENT_ID: &str = "government";

/// Tolerance for floating-point balance checks.
const BALANCE_EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmploymentStatus {
    Unemployed,
    EmployedFirm,
    EmployedGovernment,
}

/// One household's balance sheet and labor situation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdState {
    pub cash: f64,
    pub deposits: f64,
    pub loans: f64,
    pub bond_holdings: f64,
    /// Bonds bought during the current day; they season into
    /// `bond_holdings` at the next day start.
    #[serde(default)]
    pub bonds_pending: f64,
    pub skill: f64,
    /// In `[0, 1.5]`; raised by studying, multiplies effective productivity.
    pub education_level: f64,
    pub employment_status: EmploymentStatus,
    pub employer_id: Option<String>,
    /// Mutable only at the first tick of a day.
    pub is_studying: bool,
    pub wage_income: f64,
    pub last_consumption: f64,
    pub reservation_wage: f64,
}

impl HouseholdState {
    pub fn effective_productivity(&self) -> f64 {
        self.skill * (1.0 + self.education_level)
    }
}

/// The singleton producing firm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmState {
    pub cash: f64,
    /// Posted goods price, floored at 0.1.
    pub price: f64,
    pub wage_offer: f64,
    pub planned_production: f64,
    pub inventory: f64,
    pub capital_stock: f64,
    pub productivity: f64,
    /// Household ids currently on payroll; derived from `employer_id` and
    /// co-updated in the same command batch.
    pub employees: Vec<String>,
}

/// The singleton commercial bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankState {
    pub reserves: f64,
    /// Total customer deposits (the sum of household `deposits`).
    pub deposits: f64,
    /// Outstanding loan principal per household id.
    pub loans: BTreeMap<String, f64>,
    pub bond_holdings: f64,
    #[serde(default)]
    pub bonds_pending: f64,
    pub deposit_rate: f64,
    pub loan_rate: f64,
}

impl BankState {
    /// Reserve adequacy gate: when violated, no new loans this tick.
    pub fn meets_reserve_requirement(&self, reserve_ratio: f64) -> bool {
        self.reserves + BALANCE_EPS >= reserve_ratio * self.deposits
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentralBankState {
    /// In `[0, 0.4]`.
    pub policy_rate: f64,
    /// In `[0.05, 0.2]`.
    pub reserve_ratio: f64,
    pub inflation_target: f64,
    pub unemployment_target: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernmentState {
    pub cash: f64,
    pub tax_rate: f64,
    pub spending: f64,
    pub unemployment_benefit: f64,
    pub employees: Vec<String>,
    pub debt_outstanding: f64,
    pub bond_issuance_plan: f64,
}

/// Aggregate statistics recomputed by the macro logic module every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MacroStats {
    pub gdp: f64,
    pub inflation: f64,
    pub unemployment_rate: f64,
    pub price_index: f64,
    pub wage_index: f64,
}

/// Complete world state for one simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    pub simulation_id: String,
    /// Completed ticks; monotonic, advanced only by the orchestrator.
    pub tick: u64,
    /// `tick / ticks_per_day`, recomputed alongside every tick increment.
    pub day: u64,
    pub households: BTreeMap<String, HouseholdState>,
    pub firm: FirmState,
    pub bank: BankState,
    pub central_bank: CentralBankState,
    pub government: GovernmentState,
    #[serde(rename = "macro")]
    pub macro_stats: MacroStats,
}

impl WorldState {
    /// Build the initial world from a validated config.
    pub fn initial(simulation_id: &str, config: &SimulationConfig) -> Self {
        let households: BTreeMap<String, HouseholdState> = config
            .households
            .iter()
            .map(|seed| {
                (
                    seed.id.clone(),
                    HouseholdState {
                        cash: seed.cash,
                        deposits: seed.deposits,
                        loans: 0.0,
                        bond_holdings: 0.0,
                        bonds_pending: 0.0,
                        skill: seed.skill,
                        education_level: seed.education_level,
                        employment_status: EmploymentStatus::Unemployed,
                        employer_id: None,
                        is_studying: false,
                        wage_income: 0.0,
                        last_consumption: 0.0,
                        reservation_wage: seed.reservation_wage,
                    },
                )
            })
            .collect();

        let total_deposits: f64 = households.values().map(|h| h.deposits).sum();

        Self {
            simulation_id: simulation_id.to_string(),
            tick: 0,
            day: 0,
            households,
            firm: FirmState {
                cash: config.firm.cash,
                price: config.firm.price,
                wage_offer: config.firm.wage_offer,
                planned_production: config.firm.planned_production,
                inventory: config.firm.inventory,
                capital_stock: config.firm.capital_stock,
                productivity: config.firm.productivity,
                employees: Vec::new(),
            },
            bank: BankState {
                reserves: config.bank.reserves,
                deposits: total_deposits,
                loans: BTreeMap::new(),
                bond_holdings: 0.0,
                bonds_pending: 0.0,
                deposit_rate: config.bank.deposit_rate,
                loan_rate: config.bank.loan_rate,
            },
            central_bank: CentralBankState {
                policy_rate: config.central_bank.policy_rate,
                reserve_ratio: config.central_bank.reserve_ratio,
                inflation_target: config.central_bank.inflation_target,
                unemployment_target: config.central_bank.unemployment_target,
            },
            government: GovernmentState {
                cash: config.government.cash,
                tax_rate: config.government.tax_rate,
                spending: config.government.spending,
                unemployment_benefit: config.government.unemployment_benefit,
                employees: Vec::new(),
                debt_outstanding: 0.0,
                bond_issuance_plan: config.government.bond_issuance_plan,
            },
            macro_stats: MacroStats {
                gdp: 0.0,
                inflation: 0.0,
                unemployment_rate: 1.0,
                price_index: config.firm.price,
                wage_index: config.firm.wage_offer,
            },
        }
    }

    /// Check the structural invariants that every persisted world must hold.
    ///
    /// Returns a human-readable detail string on the first violation; the
    /// caller wraps it into `EngineError::InvariantViolation`.
    pub fn check_invariants(&self, ticks_per_day: u64) -> Result<(), String> {
        if self.day != self.tick / ticks_per_day {
            return Err(format!(
                "day {} does not match tick {} / ticks_per_day {}",
                self.day, self.tick, ticks_per_day
            ));
        }
        if self.firm.price < 0.1 - BALANCE_EPS {
            return Err(format!("firm price {} below floor 0.1", self.firm.price));
        }
        for (id, hh) in &self.households {
            for (label, value) in [
                ("cash", hh.cash),
                ("deposits", hh.deposits),
                ("loans", hh.loans),
                ("bond_holdings", hh.bond_holdings),
                ("bonds_pending", hh.bonds_pending),
            ] {
                if value < -BALANCE_EPS {
                    return Err(format!("household {} has negative {}: {}", id, label, value));
                }
            }
            if !(0.0 - BALANCE_EPS..=1.5 + BALANCE_EPS).contains(&hh.education_level) {
                return Err(format!(
                    "household {} education_level {} outside [0, 1.5]",
                    id, hh.education_level
                ));
            }
            let unemployed = hh.employment_status == EmploymentStatus::Unemployed;
            if unemployed != hh.employer_id.is_none() {
                return Err(format!(
                    "household {} employment_status/employer_id mismatch",
                    id
                ));
            }
            if let Some(employer) = &hh.employer_id {
                let expected = match hh.employment_status {
                    EmploymentStatus::EmployedFirm => FIRM_ID,
                    EmploymentStatus::EmployedGovernment => GOVERNMENT_ID,
                    EmploymentStatus::Unemployed => unreachable!(),
                };
                if employer != expected {
                    return Err(format!(
                        "household {} employed by '{}' but status says '{}'",
                        id, employer, expected
                    ));
                }
            }
            if hh.is_studying && hh.employment_status != EmploymentStatus::Unemployed {
                return Err(format!("household {} is studying while employed", id));
            }
        }

        let firm_roster: BTreeSet<&String> = self.firm.employees.iter().collect();
        let firm_derived: BTreeSet<&String> = self
            .households
            .iter()
            .filter(|(_, h)| h.employer_id.as_deref() == Some(FIRM_ID))
            .map(|(id, _)| id)
            .collect();
        if firm_roster != firm_derived {
            return Err("firm.employees diverged from household employer_id".to_string());
        }
        let gov_roster: BTreeSet<&String> = self.government.employees.iter().collect();
        let gov_derived: BTreeSet<&String> = self
            .households
            .iter()
            .filter(|(_, h)| h.employer_id.as_deref() == Some(GOVERNMENT_ID))
            .map(|(id, _)| id)
            .collect();
        if gov_roster != gov_derived {
            return Err("government.employees diverged from household employer_id".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> WorldState {
        WorldState::initial("sim-1", &SimulationConfig::default())
    }

    #[test]
    fn initial_world_satisfies_invariants() {
        let w = world();
        w.check_invariants(100).unwrap();
        assert_eq!(w.tick, 0);
        assert_eq!(w.day, 0);
        assert_eq!(w.households.len(), 3);
        assert_eq!(w.macro_stats.unemployment_rate, 1.0);
    }

    #[test]
    fn bank_deposits_match_household_sum_at_init() {
        let w = world();
        let sum: f64 = w.households.values().map(|h| h.deposits).sum();
        assert_eq!(w.bank.deposits, sum);
    }

    #[test]
    fn employment_mismatch_is_caught() {
        let mut w = world();
        let hh = w.households.get_mut("000").unwrap();
        hh.employment_status = EmploymentStatus::EmployedFirm;
        hh.employer_id = Some(FIRM_ID.to_string());
        // Roster not co-updated: invariant check must flag the divergence.
        assert!(w.check_invariants(100).is_err());
    }

    #[test]
    fn studying_while_employed_is_caught() {
        let mut w = world();
        {
            let hh = w.households.get_mut("000").unwrap();
            hh.employment_status = EmploymentStatus::EmployedFirm;
            hh.employer_id = Some(FIRM_ID.to_string());
            hh.is_studying = true;
        }
        w.firm.employees.push("000".to_string());
        assert!(w
            .check_invariants(100)
            .unwrap_err()
            .contains("studying while employed"));
    }

    #[test]
    fn reserve_requirement_gate() {
        let mut w = world();
        w.bank.reserves = 100.0;
        w.bank.deposits = 500.0;
        assert!(w.bank.meets_reserve_requirement(0.2));
        assert!(!w.bank.meets_reserve_requirement(0.21));
    }

    #[test]
    fn serde_uses_macro_key() {
        let json = serde_json::to_value(world()).unwrap();
        assert!(json.get("macro").is_some());
        assert!(json.get("macro_stats").is_none());
    }
}
