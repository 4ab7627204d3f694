//! Context trimming: the visibility policy for sandboxed scripts.
//!
//! The trimmed context is the only channel through which script code sees
//! world data. Households see their own record plus the public aggregates;
//! singleton agents see their own record plus the same aggregates. Nothing
//! else crosses the boundary.

use super::BindingRef;
use crate::config::SimulationConfig;
use crate::models::{AgentKind, WorldState};
use serde_json::{json, Value};

/// Protocol version stamped into every context.
pub const SCRIPT_API_VERSION: u32 = 1;

/// Public market aggregates visible to every binding.
fn market_data(world: &WorldState) -> Value {
    json!({
        "firm_price": world.firm.price,
        "wage_offer": world.firm.wage_offer,
        "deposit_rate": world.bank.deposit_rate,
        "loan_rate": world.bank.loan_rate,
        "policy_rate": world.central_bank.policy_rate,
        "reserve_ratio": world.central_bank.reserve_ratio,
        "tax_rate": world.government.tax_rate,
        "unemployment_benefit": world.government.unemployment_benefit,
        "bond_issuance_plan": world.government.bond_issuance_plan,
    })
}

fn public_config(config: &SimulationConfig) -> Value {
    json!({
        "ticks_per_day": config.ticks_per_day,
        "simulation_days": config.simulation_days,
        "bond_coupon_rate": config.bond_coupon_rate,
    })
}

/// Build the visibility-sliced snapshot for one binding.
///
/// Returns `None` when a household binding references an id that is not in
/// the world (the coverage guard rejects that earlier; this is a backstop).
pub fn build_context(
    world: &WorldState,
    config: &SimulationConfig,
    binding: &BindingRef,
) -> Option<Value> {
    let macro_stats = serde_json::to_value(&world.macro_stats).expect("macro serializes");
    let market = market_data(world);

    let (world_view, entity_state) = match binding.agent_kind {
        AgentKind::Household => {
            let entity_id = binding.entity_id.as_deref()?;
            let own = world.households.get(entity_id)?;
            let own_value = serde_json::to_value(own).expect("household serializes");
            (
                json!({
                    "households": { entity_id: own_value.clone() },
                    "macro": macro_stats,
                    "market": market,
                }),
                own_value,
            )
        }
        AgentKind::Firm => {
            let own = serde_json::to_value(&world.firm).expect("firm serializes");
            (
                json!({ "firm": own.clone(), "macro": macro_stats, "market": market }),
                own,
            )
        }
        AgentKind::Bank => {
            let own = serde_json::to_value(&world.bank).expect("bank serializes");
            (
                json!({ "bank": own.clone(), "macro": macro_stats, "market": market }),
                own,
            )
        }
        AgentKind::CentralBank => {
            let own = serde_json::to_value(&world.central_bank).expect("central bank serializes");
            (
                json!({ "central_bank": own.clone(), "macro": macro_stats, "market": market }),
                own,
            )
        }
        AgentKind::Government => {
            let own = serde_json::to_value(&world.government).expect("government serializes");
            (
                json!({ "government": own.clone(), "macro": macro_stats, "market": market }),
                own,
            )
        }
    };

    Some(json!({
        "world_state": world_view,
        "entity_state": entity_state,
        "config": public_config(config),
        "script_api_version": SCRIPT_API_VERSION,
        "agent_kind": binding.agent_kind.as_str(),
        "entity_id": binding.entity_id,
        "tick": world.tick,
        "day": world.day,
        "features": {
            "shock_enabled": config.features.shock_enabled,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> WorldState {
        WorldState::initial("sim-1", &SimulationConfig::default())
    }

    #[test]
    fn household_sees_only_its_own_record() {
        let world = world();
        let cfg = SimulationConfig::default();
        let ctx = build_context(
            &world,
            &cfg,
            &BindingRef {
                agent_kind: AgentKind::Household,
                entity_id: Some("001".to_string()),
            },
        )
        .unwrap();

        let households = ctx["world_state"]["households"].as_object().unwrap();
        assert_eq!(households.len(), 1);
        assert!(households.contains_key("001"));
        assert!(ctx["world_state"].get("firm").is_none());
        assert!(ctx["world_state"].get("bank").is_none());
        // Public aggregates are present.
        assert!(ctx["world_state"]["market"]["firm_price"].is_number());
        assert!(ctx["world_state"]["macro"]["unemployment_rate"].is_number());
    }

    #[test]
    fn singleton_sees_its_record_and_aggregates() {
        let world = world();
        let cfg = SimulationConfig::default();
        let ctx = build_context(
            &world,
            &cfg,
            &BindingRef {
                agent_kind: AgentKind::Firm,
                entity_id: None,
            },
        )
        .unwrap();
        assert!(ctx["world_state"]["firm"]["inventory"].is_number());
        assert!(ctx["world_state"].get("households").is_none());
        assert_eq!(ctx["agent_kind"], "firm");
        assert_eq!(ctx["script_api_version"], 1);
    }

    #[test]
    fn unknown_household_yields_none() {
        let world = world();
        let cfg = SimulationConfig::default();
        assert!(build_context(
            &world,
            &cfg,
            &BindingRef {
                agent_kind: AgentKind::Household,
                entity_id: Some("999".to_string()),
            },
        )
        .is_none());
    }

    #[test]
    fn tick_and_day_are_exposed() {
        let mut world = world();
        world.tick = 7;
        world.day = 2;
        let cfg = SimulationConfig::default();
        let ctx = build_context(
            &world,
            &cfg,
            &BindingRef {
                agent_kind: AgentKind::Government,
                entity_id: None,
            },
        )
        .unwrap();
        assert_eq!(ctx["tick"], 7);
        assert_eq!(ctx["day"], 2);
    }
}
