//! Decision merger: composes baseline, script and admin decision sources.
//!
//! Precedence per leaf field, highest wins: admin overrides, then script
//! overrides, then baseline defaults. The merge is explicit field-by-field
//! (no generic dict union) and enforces two contracts:
//!
//! - **Schema**: unknown fields reject the containing override
//!   (`InvalidOverride`); the section falls back to the next-priority
//!   source. Numeric fields are clamped to their declared ranges with a
//!   warning log entry; non-finite values fall back to the baseline value.
//! - **Isolation**: a script's output is trimmed to the section its binding
//!   permits before validation. A household script cannot produce an effect
//!   on any other household; foreign sections are dropped with a warning.

use crate::models::{
    BankDecision, BankDecisionOverride, CentralBankDecision, CentralBankDecisionOverride,
    FirmDecision, FirmDecisionOverride, GovernmentDecision, GovernmentDecisionOverride,
    HouseholdDecision, HouseholdDecisionOverride, Provenance, TickDecisionOverrides,
    TickDecisions, TickLogEntry,
};
use crate::models::AgentKind;
use crate::sandbox::BindingRef;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// An override that failed validation and was replaced by the next source.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRejection {
    /// Section label, e.g. `household:000` or `firm`.
    pub section: String,
    pub source: Provenance,
    pub reason: String,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub decisions: TickDecisions,
    /// Winning source per section label.
    pub provenance: BTreeMap<String, Provenance>,
    /// Clamp/trim warnings, ready for the tick log.
    pub warnings: Vec<TickLogEntry>,
    pub rejections: Vec<MergeRejection>,
}

/// Script outputs trimmed into typed per-section overrides.
#[derive(Default)]
struct ScriptSections {
    households: BTreeMap<String, HouseholdDecisionOverride>,
    firm: Option<FirmDecisionOverride>,
    bank: Option<BankDecisionOverride>,
    central_bank: Option<CentralBankDecisionOverride>,
    government: Option<GovernmentDecisionOverride>,
}

pub struct DecisionMerger;

struct MergeCtx<'a> {
    simulation_id: &'a str,
    tick: u64,
    day: u64,
    warnings: Vec<TickLogEntry>,
    rejections: Vec<MergeRejection>,
}

impl<'a> MergeCtx<'a> {
    fn warn(&mut self, message: &str, context: Value) {
        self.warnings.push(TickLogEntry::new(
            self.simulation_id,
            self.tick,
            self.day,
            message,
            context,
        ));
    }

    fn reject(&mut self, section: &str, source: Provenance, reason: String) {
        self.warn(
            "override_rejected",
            json!({ "section": section, "reason": reason.clone() }),
        );
        self.rejections.push(MergeRejection {
            section: section.to_string(),
            source,
            reason,
        });
    }

    /// Clamp a numeric field into its declared range, falling back to the
    /// baseline value for non-finite input.
    fn sanitize(
        &mut self,
        section: &str,
        field: &str,
        value: f64,
        baseline: f64,
        lo: f64,
        hi: f64,
    ) -> f64 {
        if !value.is_finite() {
            self.warn(
                "override_non_finite",
                json!({ "section": section, "field": field }),
            );
            return baseline;
        }
        let clamped = value.clamp(lo, hi);
        if clamped != value {
            self.warn(
                "override_clamped",
                json!({ "section": section, "field": field, "from": value, "to": clamped }),
            );
        }
        clamped
    }
}

impl DecisionMerger {
    pub fn merge(
        simulation_id: &str,
        tick: u64,
        day: u64,
        baseline: &TickDecisions,
        script_outputs: &BTreeMap<BindingRef, Value>,
        admin: Option<&TickDecisionOverrides>,
    ) -> MergeOutcome {
        let mut ctx = MergeCtx {
            simulation_id,
            tick,
            day,
            warnings: Vec::new(),
            rejections: Vec::new(),
        };

        let script = Self::trim_script_outputs(script_outputs, &mut ctx);
        let mut decisions = baseline.clone();
        let mut provenance: BTreeMap<String, Provenance> = BTreeMap::new();

        // Seed provenance with baseline for every section.
        for id in decisions.households.keys() {
            provenance.insert(format!("household:{}", id), Provenance::Baseline);
        }
        for kind in AgentKind::SINGLETONS {
            provenance.insert(kind.as_str().to_string(), Provenance::Baseline);
        }

        // Script layer.
        for (id, ov) in &script.households {
            if let Some(base) = decisions.households.get(id).cloned() {
                let section = format!("household:{}", id);
                let merged = Self::merge_household(&base, ov, &section, &mut ctx);
                decisions.households.insert(id.clone(), merged);
                provenance.insert(section, Provenance::Script);
            }
        }
        if let Some(ov) = &script.firm {
            decisions.firm = Self::merge_firm(&decisions.firm.clone(), ov, "firm", &mut ctx);
            provenance.insert("firm".to_string(), Provenance::Script);
        }
        if let Some(ov) = &script.bank {
            decisions.bank = Self::merge_bank(&decisions.bank.clone(), ov, "bank", &mut ctx);
            provenance.insert("bank".to_string(), Provenance::Script);
        }
        if let Some(ov) = &script.central_bank {
            decisions.central_bank = Self::merge_central_bank(
                &decisions.central_bank.clone(),
                ov,
                "central_bank",
                &mut ctx,
            );
            provenance.insert("central_bank".to_string(), Provenance::Script);
        }
        if let Some(ov) = &script.government {
            decisions.government =
                Self::merge_government(&decisions.government.clone(), ov, "government", &mut ctx);
            provenance.insert("government".to_string(), Provenance::Script);
        }

        // Admin layer (highest precedence).
        if let Some(admin) = admin {
            for (id, ov) in &admin.households {
                let section = format!("household:{}", id);
                match decisions.households.get(id).cloned() {
                    Some(base) if *ov != HouseholdDecisionOverride::default() => {
                        let merged = Self::merge_household(&base, ov, &section, &mut ctx);
                        decisions.households.insert(id.clone(), merged);
                        provenance.insert(section, Provenance::Admin);
                    }
                    Some(_) => {}
                    None => {
                        ctx.reject(
                            &section,
                            Provenance::Admin,
                            format!("unknown household '{}'", id),
                        );
                    }
                }
            }
            if let Some(ov) = &admin.firm {
                if *ov != FirmDecisionOverride::default() {
                    decisions.firm = Self::merge_firm(&decisions.firm.clone(), ov, "firm", &mut ctx);
                    provenance.insert("firm".to_string(), Provenance::Admin);
                }
            }
            if let Some(ov) = &admin.bank {
                if *ov != BankDecisionOverride::default() {
                    decisions.bank = Self::merge_bank(&decisions.bank.clone(), ov, "bank", &mut ctx);
                    provenance.insert("bank".to_string(), Provenance::Admin);
                }
            }
            if let Some(ov) = &admin.central_bank {
                if *ov != CentralBankDecisionOverride::default() {
                    decisions.central_bank = Self::merge_central_bank(
                        &decisions.central_bank.clone(),
                        ov,
                        "central_bank",
                        &mut ctx,
                    );
                    provenance.insert("central_bank".to_string(), Provenance::Admin);
                }
            }
            if let Some(ov) = &admin.government {
                if *ov != GovernmentDecisionOverride::default() {
                    decisions.government = Self::merge_government(
                        &decisions.government.clone(),
                        ov,
                        "government",
                        &mut ctx,
                    );
                    provenance.insert("government".to_string(), Provenance::Admin);
                }
            }
        }

        MergeOutcome {
            decisions,
            provenance,
            warnings: ctx.warnings,
            rejections: ctx.rejections,
        }
    }

    /// Trim each script's raw return value to its permitted section and
    /// validate it against the override schema.
    fn trim_script_outputs(
        script_outputs: &BTreeMap<BindingRef, Value>,
        ctx: &mut MergeCtx<'_>,
    ) -> ScriptSections {
        let mut sections = ScriptSections::default();

        for (binding, raw) in script_outputs {
            let section_label = binding.to_string();
            let Some(object) = raw.as_object() else {
                ctx.reject(
                    &section_label,
                    Provenance::Script,
                    "script result is not a mapping".to_string(),
                );
                continue;
            };

            match binding.agent_kind {
                AgentKind::Household => {
                    let Some(entity_id) = binding.entity_id.as_deref() else {
                        continue;
                    };
                    // Everything except the script's own household entry is
                    // out of its visibility slice.
                    let foreign_sections = object.keys().any(|k| k != "households");
                    let foreign_households = object
                        .get("households")
                        .and_then(Value::as_object)
                        .map(|m| m.keys().any(|k| k != entity_id))
                        .unwrap_or(false);
                    if foreign_sections || foreign_households {
                        ctx.warn(
                            "override_trimmed",
                            json!({
                                "section": section_label,
                                "reason": "fields outside the binding's own household were dropped",
                            }),
                        );
                    }
                    let own = object
                        .get("households")
                        .and_then(Value::as_object)
                        .and_then(|m| m.get(entity_id));
                    if let Some(own) = own {
                        match serde_json::from_value::<HouseholdDecisionOverride>(own.clone()) {
                            Ok(ov) => {
                                sections.households.insert(entity_id.to_string(), ov);
                            }
                            Err(err) => ctx.reject(
                                &section_label,
                                Provenance::Script,
                                err.to_string(),
                            ),
                        }
                    }
                }
                AgentKind::Firm
                | AgentKind::Bank
                | AgentKind::CentralBank
                | AgentKind::Government => {
                    let key = binding.agent_kind.as_str();
                    if object.keys().any(|k| k != key) {
                        ctx.warn(
                            "override_trimmed",
                            json!({
                                "section": section_label,
                                "reason": "fields outside the binding's own section were dropped",
                            }),
                        );
                    }
                    let Some(own) = object.get(key) else { continue };
                    let parsed: Result<(), String> = match binding.agent_kind {
                        AgentKind::Firm => serde_json::from_value::<FirmDecisionOverride>(own.clone())
                            .map(|ov| sections.firm = Some(ov))
                            .map_err(|e| e.to_string()),
                        AgentKind::Bank => serde_json::from_value::<BankDecisionOverride>(own.clone())
                            .map(|ov| sections.bank = Some(ov))
                            .map_err(|e| e.to_string()),
                        AgentKind::CentralBank => {
                            serde_json::from_value::<CentralBankDecisionOverride>(own.clone())
                                .map(|ov| sections.central_bank = Some(ov))
                                .map_err(|e| e.to_string())
                        }
                        AgentKind::Government => {
                            serde_json::from_value::<GovernmentDecisionOverride>(own.clone())
                                .map(|ov| sections.government = Some(ov))
                                .map_err(|e| e.to_string())
                        }
                        AgentKind::Household => unreachable!(),
                    };
                    if let Err(reason) = parsed {
                        ctx.reject(&section_label, Provenance::Script, reason);
                    }
                }
            }
        }
        sections
    }

    fn merge_household(
        base: &HouseholdDecision,
        ov: &HouseholdDecisionOverride,
        section: &str,
        ctx: &mut MergeCtx<'_>,
    ) -> HouseholdDecision {
        const INF: f64 = f64::INFINITY;
        HouseholdDecision {
            consumption_budget: ov.consumption_budget.map_or(base.consumption_budget, |v| {
                ctx.sanitize(section, "consumption_budget", v, base.consumption_budget, 0.0, INF)
            }),
            max_price: ov
                .max_price
                .map_or(base.max_price, |v| ctx.sanitize(section, "max_price", v, base.max_price, 0.0, INF)),
            labor_supply: ov.labor_supply.map_or(base.labor_supply, |v| {
                ctx.sanitize(section, "labor_supply", v, base.labor_supply, 0.0, 1.0)
            }),
            reservation_wage: ov.reservation_wage.map_or(base.reservation_wage, |v| {
                ctx.sanitize(section, "reservation_wage", v, base.reservation_wage, 0.0, INF)
            }),
            deposit_amount: ov.deposit_amount.map_or(base.deposit_amount, |v| {
                ctx.sanitize(section, "deposit_amount", v, base.deposit_amount, 0.0, INF)
            }),
            withdrawal_amount: ov.withdrawal_amount.map_or(base.withdrawal_amount, |v| {
                ctx.sanitize(section, "withdrawal_amount", v, base.withdrawal_amount, 0.0, INF)
            }),
            loan_request: ov.loan_request.map_or(base.loan_request, |v| {
                ctx.sanitize(section, "loan_request", v, base.loan_request, 0.0, INF)
            }),
            loan_rate_bid: ov.loan_rate_bid.map_or(base.loan_rate_bid, |v| {
                ctx.sanitize(section, "loan_rate_bid", v, base.loan_rate_bid, 0.0, 1.0)
            }),
            bond_bid_face: ov.bond_bid_face.map_or(base.bond_bid_face, |v| {
                ctx.sanitize(section, "bond_bid_face", v, base.bond_bid_face, 0.0, INF)
            }),
            study: ov.study.unwrap_or(base.study),
        }
    }

    fn merge_firm(
        base: &FirmDecision,
        ov: &FirmDecisionOverride,
        section: &str,
        ctx: &mut MergeCtx<'_>,
    ) -> FirmDecision {
        const INF: f64 = f64::INFINITY;
        FirmDecision {
            price: ov
                .price
                .map_or(base.price, |v| ctx.sanitize(section, "price", v, base.price, 0.1, INF)),
            wage_offer: ov
                .wage_offer
                .map_or(base.wage_offer, |v| ctx.sanitize(section, "wage_offer", v, base.wage_offer, 0.0, INF)),
            planned_production: ov.planned_production.map_or(base.planned_production, |v| {
                ctx.sanitize(section, "planned_production", v, base.planned_production, 0.0, INF)
            }),
            hiring_demand: ov.hiring_demand.unwrap_or(base.hiring_demand),
        }
    }

    fn merge_bank(
        base: &BankDecision,
        ov: &BankDecisionOverride,
        section: &str,
        ctx: &mut MergeCtx<'_>,
    ) -> BankDecision {
        const INF: f64 = f64::INFINITY;
        BankDecision {
            deposit_rate: ov.deposit_rate.map_or(base.deposit_rate, |v| {
                ctx.sanitize(section, "deposit_rate", v, base.deposit_rate, 0.0, 1.0)
            }),
            loan_rate: ov
                .loan_rate
                .map_or(base.loan_rate, |v| ctx.sanitize(section, "loan_rate", v, base.loan_rate, 0.0, 1.0)),
            bond_bid_face: ov.bond_bid_face.map_or(base.bond_bid_face, |v| {
                ctx.sanitize(section, "bond_bid_face", v, base.bond_bid_face, 0.0, INF)
            }),
        }
    }

    fn merge_central_bank(
        base: &CentralBankDecision,
        ov: &CentralBankDecisionOverride,
        section: &str,
        ctx: &mut MergeCtx<'_>,
    ) -> CentralBankDecision {
        CentralBankDecision {
            policy_rate: ov.policy_rate.map_or(base.policy_rate, |v| {
                ctx.sanitize(section, "policy_rate", v, base.policy_rate, 0.0, 0.4)
            }),
            reserve_ratio: ov.reserve_ratio.map_or(base.reserve_ratio, |v| {
                ctx.sanitize(section, "reserve_ratio", v, base.reserve_ratio, 0.05, 0.2)
            }),
        }
    }

    fn merge_government(
        base: &GovernmentDecision,
        ov: &GovernmentDecisionOverride,
        section: &str,
        ctx: &mut MergeCtx<'_>,
    ) -> GovernmentDecision {
        const INF: f64 = f64::INFINITY;
        GovernmentDecision {
            tax_rate: ov
                .tax_rate
                .map_or(base.tax_rate, |v| ctx.sanitize(section, "tax_rate", v, base.tax_rate, 0.0, 0.95)),
            spending: ov
                .spending
                .map_or(base.spending, |v| ctx.sanitize(section, "spending", v, base.spending, 0.0, INF)),
            unemployment_benefit: ov.unemployment_benefit.map_or(base.unemployment_benefit, |v| {
                ctx.sanitize(section, "unemployment_benefit", v, base.unemployment_benefit, 0.0, INF)
            }),
            bond_issuance: ov.bond_issuance.map_or(base.bond_issuance, |v| {
                ctx.sanitize(section, "bond_issuance", v, base.bond_issuance, 0.0, INF)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineFallbacks;
    use crate::config::SimulationConfig;
    use crate::models::WorldState;

    fn setup() -> (WorldState, TickDecisions) {
        let cfg = SimulationConfig::default();
        let world = WorldState::initial("sim-1", &cfg);
        let baseline = BaselineFallbacks::tick_decisions(&world, &cfg);
        (world, baseline)
    }

    fn hh_binding(id: &str) -> BindingRef {
        BindingRef {
            agent_kind: AgentKind::Household,
            entity_id: Some(id.to_string()),
        }
    }

    #[test]
    fn admin_beats_script_beats_baseline() {
        let (_, baseline) = setup();
        let mut scripts = BTreeMap::new();
        scripts.insert(
            hh_binding("000"),
            serde_json::json!({
                "households": { "000": { "consumption_budget": 20.0, "max_price": 12.0 } }
            }),
        );
        let admin = TickDecisionOverrides {
            households: [(
                "000".to_string(),
                HouseholdDecisionOverride {
                    consumption_budget: Some(30.0),
                    ..Default::default()
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        };

        let outcome =
            DecisionMerger::merge("sim-1", 1, 0, &baseline, &scripts, Some(&admin));
        let decision = &outcome.decisions.households["000"];
        // Admin wins the contested field; script wins the uncontested one.
        assert_eq!(decision.consumption_budget, 30.0);
        assert_eq!(decision.max_price, 12.0);
        assert_eq!(
            outcome.provenance["household:000"],
            Provenance::Admin
        );
    }

    #[test]
    fn unknown_field_rejects_script_section() {
        let (_, baseline) = setup();
        let mut scripts = BTreeMap::new();
        scripts.insert(
            hh_binding("000"),
            serde_json::json!({
                "households": { "000": { "consumption_budget": 20.0, "teleport": true } }
            }),
        );
        let outcome = DecisionMerger::merge("sim-1", 1, 0, &baseline, &scripts, None);
        assert_eq!(outcome.rejections.len(), 1);
        assert_eq!(outcome.rejections[0].section, "household:000");
        // Fallback: baseline untouched.
        assert_eq!(
            outcome.decisions.households["000"],
            baseline.households["000"]
        );
        assert_eq!(
            outcome.provenance["household:000"],
            Provenance::Baseline
        );
    }

    #[test]
    fn household_script_cannot_touch_other_households() {
        let (_, baseline) = setup();
        let mut scripts = BTreeMap::new();
        scripts.insert(
            hh_binding("000"),
            serde_json::json!({
                "households": {
                    "000": { "consumption_budget": 20.0 },
                    "001": { "consumption_budget": 0.0 }
                },
                "firm": { "price": 99.0 }
            }),
        );
        let outcome = DecisionMerger::merge("sim-1", 1, 0, &baseline, &scripts, None);
        // Own override applied; foreign household and firm untouched.
        assert_eq!(outcome.decisions.households["000"].consumption_budget, 20.0);
        assert_eq!(
            outcome.decisions.households["001"],
            baseline.households["001"]
        );
        assert_eq!(outcome.decisions.firm, baseline.firm);
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.message == "override_trimmed"));
    }

    #[test]
    fn out_of_range_values_are_clamped_with_warning() {
        let (_, baseline) = setup();
        let mut scripts = BTreeMap::new();
        scripts.insert(
            BindingRef {
                agent_kind: AgentKind::CentralBank,
                entity_id: None,
            },
            serde_json::json!({ "central_bank": { "policy_rate": 0.9 } }),
        );
        let outcome = DecisionMerger::merge("sim-1", 1, 0, &baseline, &scripts, None);
        assert_eq!(outcome.decisions.central_bank.policy_rate, 0.4);
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.message == "override_clamped"));
    }

    #[test]
    fn firm_price_floor_applies_in_merge() {
        let (_, baseline) = setup();
        let mut scripts = BTreeMap::new();
        scripts.insert(
            BindingRef {
                agent_kind: AgentKind::Firm,
                entity_id: None,
            },
            serde_json::json!({ "firm": { "price": 0.0 } }),
        );
        let outcome = DecisionMerger::merge("sim-1", 1, 0, &baseline, &scripts, None);
        assert_eq!(outcome.decisions.firm.price, 0.1);
    }

    #[test]
    fn admin_override_for_unknown_household_is_rejected() {
        let (_, baseline) = setup();
        let admin = TickDecisionOverrides {
            households: [(
                "999".to_string(),
                HouseholdDecisionOverride {
                    consumption_budget: Some(1.0),
                    ..Default::default()
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        let outcome =
            DecisionMerger::merge("sim-1", 1, 0, &baseline, &BTreeMap::new(), Some(&admin));
        assert_eq!(outcome.rejections.len(), 1);
        assert_eq!(outcome.rejections[0].source, Provenance::Admin);
    }

    #[test]
    fn non_mapping_script_result_is_rejected() {
        let (_, baseline) = setup();
        let mut scripts = BTreeMap::new();
        scripts.insert(hh_binding("000"), serde_json::json!([1, 2, 3]));
        let outcome = DecisionMerger::merge("sim-1", 1, 0, &baseline, &scripts, None);
        assert_eq!(outcome.rejections.len(), 1);
    }
}
