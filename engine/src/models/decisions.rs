//! Tick decisions and the override records that feed them.
//!
//! A [`TickDecisions`] record is complete: every field has a value, seeded
//! from the baseline fallback and selectively overridden by script and admin
//! sources. Override structs mirror the decision structs with every field
//! optional; `deny_unknown_fields` makes unrecognized keys a schema error,
//! which the merger converts into `InvalidOverride` and a fallback to the
//! next-priority source.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a merged decision section came from, for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Baseline,
    Script,
    Admin,
}

// ---------------------------------------------------------------------------
// Complete per-kind decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdDecision {
    /// Cash earmarked for goods purchases this tick.
    pub consumption_budget: f64,
    /// Limit price for the goods order.
    pub max_price: f64,
    /// Labor offered in `[0, 1]`; candidates need a positive value.
    pub labor_supply: f64,
    pub reservation_wage: f64,
    /// Cash moved into deposits this tick.
    pub deposit_amount: f64,
    /// Deposits withdrawn to cash this tick.
    pub withdrawal_amount: f64,
    pub loan_request: f64,
    /// Rate the household is willing to pay; below the bank's posted rate
    /// the request is rejected.
    pub loan_rate_bid: f64,
    pub bond_bid_face: f64,
    /// Honored only at the first tick of a day.
    pub study: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmDecision {
    pub price: f64,
    pub wage_offer: f64,
    pub planned_production: f64,
    pub hiring_demand: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankDecision {
    pub deposit_rate: f64,
    pub loan_rate: f64,
    pub bond_bid_face: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentralBankDecision {
    pub policy_rate: f64,
    pub reserve_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernmentDecision {
    pub tax_rate: f64,
    pub spending: f64,
    pub unemployment_benefit: f64,
    pub bond_issuance: f64,
}

/// The composed decision record one tick executes against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickDecisions {
    pub households: BTreeMap<String, HouseholdDecision>,
    pub firm: FirmDecision,
    pub bank: BankDecision,
    pub central_bank: CentralBankDecision,
    pub government: GovernmentDecision,
}

// ---------------------------------------------------------------------------
// Overrides (script- and admin-supplied)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HouseholdDecisionOverride {
    pub consumption_budget: Option<f64>,
    pub max_price: Option<f64>,
    pub labor_supply: Option<f64>,
    pub reservation_wage: Option<f64>,
    pub deposit_amount: Option<f64>,
    pub withdrawal_amount: Option<f64>,
    pub loan_request: Option<f64>,
    pub loan_rate_bid: Option<f64>,
    pub bond_bid_face: Option<f64>,
    pub study: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FirmDecisionOverride {
    pub price: Option<f64>,
    pub wage_offer: Option<f64>,
    pub planned_production: Option<f64>,
    pub hiring_demand: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BankDecisionOverride {
    pub deposit_rate: Option<f64>,
    pub loan_rate: Option<f64>,
    pub bond_bid_face: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CentralBankDecisionOverride {
    pub policy_rate: Option<f64>,
    pub reserve_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GovernmentDecisionOverride {
    pub tax_rate: Option<f64>,
    pub spending: Option<f64>,
    pub unemployment_benefit: Option<f64>,
    pub bond_issuance: Option<f64>,
}

/// Partial decision record, keyed the same way as [`TickDecisions`].
///
/// This is the shape scripts return from `generate_decisions` and the shape
/// admins pass to `run_tick`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TickDecisionOverrides {
    pub households: BTreeMap<String, HouseholdDecisionOverride>,
    pub firm: Option<FirmDecisionOverride>,
    pub bank: Option<BankDecisionOverride>,
    pub central_bank: Option<CentralBankDecisionOverride>,
    pub government: Option<GovernmentDecisionOverride>,
}

impl TickDecisionOverrides {
    pub fn is_empty(&self) -> bool {
        self.households.is_empty()
            && self.firm.is_none()
            && self.bank.is_none()
            && self.central_bank.is_none()
            && self.government.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_override_fields_are_rejected() {
        let result: Result<FirmDecisionOverride, _> =
            serde_json::from_str(r#"{"price": 12.0, "stock_buyback": 1.0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn partial_overrides_deserialize() {
        let ov: TickDecisionOverrides = serde_json::from_str(
            r#"{"households": {"000": {"consumption_budget": 5.0}}, "firm": {"price": 11.0}}"#,
        )
        .unwrap();
        assert_eq!(
            ov.households["000"].consumption_budget,
            Some(5.0)
        );
        assert_eq!(ov.firm.unwrap().price, Some(11.0));
        assert!(ov.bank.is_none());
    }

    #[test]
    fn empty_override_is_empty() {
        assert!(TickDecisionOverrides::default().is_empty());
    }
}
