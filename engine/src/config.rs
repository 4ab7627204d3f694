//! Simulation configuration.
//!
//! One [`SimulationConfig`] fully determines a simulation's initial world
//! and runtime limits. Configs arrive as JSON from the (out-of-scope) REST
//! layer; every field has a default so partial documents deserialize.
//!
//! Economic formulas presuppose the *configured* `ticks_per_day`: per-tick
//! interest is derived from annual rates with
//! `(1 + r)^(1 / (ticks_per_day * 365)) - 1`, so changing the tick density
//! changes per-tick flows but not annualized outcomes.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Bond settlement behavior (see DESIGN.md, Open Question 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BondCouponMode {
    /// Coupons accrue on the first tick of each day on held face value.
    #[default]
    DailyAccrual,
    /// Coupons are paid on redemption; bonds must be held one full day.
    OnRedemption,
}

/// Optional subsystem switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Enables the shock-injection logic module.
    pub shock_enabled: bool,
    /// Snapshot the world into the durable tier at every day boundary.
    pub snapshot_on_day_boundary: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            shock_enabled: false,
            snapshot_on_day_boundary: true,
        }
    }
}

/// Initial household record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HouseholdSeed {
    /// Decimal-digit id, unique within the simulation.
    pub id: String,
    pub cash: f64,
    pub deposits: f64,
    pub skill: f64,
    pub education_level: f64,
    pub reservation_wage: f64,
}

impl Default for HouseholdSeed {
    fn default() -> Self {
        Self {
            id: "000".to_string(),
            cash: 100.0,
            deposits: 0.0,
            skill: 1.0,
            education_level: 0.0,
            reservation_wage: 4.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmSeed {
    pub cash: f64,
    pub price: f64,
    pub wage_offer: f64,
    pub planned_production: f64,
    pub inventory: f64,
    pub capital_stock: f64,
    pub productivity: f64,
}

impl Default for FirmSeed {
    fn default() -> Self {
        Self {
            cash: 1_000.0,
            price: 10.0,
            wage_offer: 5.0,
            planned_production: 20.0,
            inventory: 50.0,
            capital_stock: 100.0,
            productivity: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BankSeed {
    pub reserves: f64,
    pub deposit_rate: f64,
    pub loan_rate: f64,
}

impl Default for BankSeed {
    fn default() -> Self {
        Self {
            reserves: 1_000.0,
            deposit_rate: 0.01,
            loan_rate: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralBankSeed {
    pub policy_rate: f64,
    pub reserve_ratio: f64,
    pub inflation_target: f64,
    pub unemployment_target: f64,
}

impl Default for CentralBankSeed {
    fn default() -> Self {
        Self {
            policy_rate: 0.03,
            reserve_ratio: 0.1,
            inflation_target: 0.02,
            unemployment_target: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernmentSeed {
    pub cash: f64,
    pub tax_rate: f64,
    pub spending: f64,
    pub unemployment_benefit: f64,
    pub bond_issuance_plan: f64,
}

impl Default for GovernmentSeed {
    fn default() -> Self {
        Self {
            cash: 1_000.0,
            tax_rate: 0.2,
            spending: 50.0,
            unemployment_benefit: 2.0,
            bond_issuance_plan: 0.0,
        }
    }
}

/// Complete configuration for one simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub ticks_per_day: u64,
    pub simulation_days: u64,
    pub global_rng_seed: u64,

    /// Wall-clock budget per sandbox invocation, in seconds.
    pub script_timeout_seconds: f64,
    /// CPU-seconds cap applied to worker processes via rlimit.
    pub script_cpu_seconds: u64,
    /// Resident-memory cap per worker process, in MB.
    pub script_memory_limit_mb: u64,
    pub worker_pool_size: usize,
    /// Worker processes are recycled after this many invocations.
    pub worker_max_invocations: u32,
    pub script_execution_concurrency: usize,

    /// When unset, a tick with unbound required agents fails with
    /// `MissingAgentScripts` instead of filling in baseline strategies.
    pub allow_fallback_for_missing: bool,
    /// Default per-user script quota; `simulation_limits` rows override it
    /// per simulation.
    pub script_limit: u32,

    pub durable_retry_budget: u32,
    pub durable_retry_base_ms: u64,
    /// Capacity of the cached recent-log ring per simulation.
    pub log_cache_entries: usize,

    pub bond_coupon_mode: BondCouponMode,
    /// Annual coupon rate on government bonds.
    pub bond_coupon_rate: f64,
    /// Education gained per full day of study, capped at 1.5 total.
    pub education_daily_increment: f64,

    pub features: FeatureFlags,

    pub households: Vec<HouseholdSeed>,
    pub firm: FirmSeed,
    pub bank: BankSeed,
    pub central_bank: CentralBankSeed,
    pub government: GovernmentSeed,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ticks_per_day: 100,
            simulation_days: 30,
            global_rng_seed: 42,
            script_timeout_seconds: 0.75,
            script_cpu_seconds: 1,
            script_memory_limit_mb: 256,
            worker_pool_size: 4,
            worker_max_invocations: 100,
            script_execution_concurrency: 4,
            allow_fallback_for_missing: true,
            script_limit: 16,
            durable_retry_budget: 3,
            durable_retry_base_ms: 10,
            log_cache_entries: 512,
            bond_coupon_mode: BondCouponMode::default(),
            bond_coupon_rate: 0.03,
            education_daily_increment: 0.05,
            features: FeatureFlags::default(),
            households: default_households(),
            firm: FirmSeed::default(),
            bank: BankSeed::default(),
            central_bank: CentralBankSeed::default(),
            government: GovernmentSeed::default(),
        }
    }
}

fn default_households() -> Vec<HouseholdSeed> {
    (0..3)
        .map(|i| HouseholdSeed {
            id: format!("{:03}", i),
            ..HouseholdSeed::default()
        })
        .collect()
}

impl SimulationConfig {
    /// Validate field ranges and household identity rules.
    pub fn validate(&self) -> EngineResult<()> {
        if self.ticks_per_day == 0 {
            return Err(EngineError::InvalidConfig(
                "ticks_per_day must be > 0".to_string(),
            ));
        }
        if self.simulation_days == 0 {
            return Err(EngineError::InvalidConfig(
                "simulation_days must be > 0".to_string(),
            ));
        }
        if self.worker_pool_size == 0 || self.script_execution_concurrency == 0 {
            return Err(EngineError::InvalidConfig(
                "worker_pool_size and script_execution_concurrency must be > 0".to_string(),
            ));
        }
        if self.script_timeout_seconds <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "script_timeout_seconds must be > 0".to_string(),
            ));
        }
        if self.households.is_empty() {
            return Err(EngineError::InvalidConfig(
                "at least one household is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for hh in &self.households {
            if hh.id.is_empty() || !hh.id.bytes().all(|b| b.is_ascii_digit()) {
                return Err(EngineError::InvalidConfig(format!(
                    "household id '{}' is not a decimal digit string",
                    hh.id
                )));
            }
            if !seen.insert(hh.id.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate household id '{}'",
                    hh.id
                )));
            }
            if hh.cash < 0.0 || hh.deposits < 0.0 {
                return Err(EngineError::InvalidConfig(format!(
                    "household '{}' has a negative opening balance",
                    hh.id
                )));
            }
            if !(0.0..=1.5).contains(&hh.education_level) {
                return Err(EngineError::InvalidConfig(format!(
                    "household '{}' education_level outside [0, 1.5]",
                    hh.id
                )));
            }
        }
        if self.firm.price < 0.1 {
            return Err(EngineError::InvalidConfig(
                "firm price must be >= 0.1".to_string(),
            ));
        }
        if !(0.0..=0.4).contains(&self.central_bank.policy_rate) {
            return Err(EngineError::InvalidConfig(
                "policy_rate outside [0, 0.4]".to_string(),
            ));
        }
        if !(0.05..=0.2).contains(&self.central_bank.reserve_ratio) {
            return Err(EngineError::InvalidConfig(
                "reserve_ratio outside [0.05, 0.2]".to_string(),
            ));
        }
        Ok(())
    }

    /// Convert an annual rate to the per-tick compounding rate for this
    /// config's tick density.
    pub fn per_tick_rate(&self, annual: f64) -> f64 {
        let periods = (self.ticks_per_day * 365) as f64;
        (1.0 + annual).powf(1.0 / periods) - 1.0
    }
}
