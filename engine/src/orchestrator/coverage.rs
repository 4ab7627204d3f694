//! Coverage guard: the pre-tick invariant that every required agent has a
//! decision source.
//!
//! Each singleton kind needs exactly one active binding and every household
//! id present in the world needs its own. Missing bindings are tolerated
//! only when the simulation allows baseline fallback for absent scripts;
//! otherwise the tick is rejected before any state changes, listing the
//! unbound agents.

use crate::models::{AgentKind, WorldState};
use crate::registry::ScriptRecord;
use std::collections::BTreeMap;

/// Check coverage; on failure returns the sorted list of unbound agents
/// (labels like `firm` or `household:000`).
pub fn check(
    world: &WorldState,
    bindings: &BTreeMap<(AgentKind, Option<String>), ScriptRecord>,
    allow_fallback_for_missing: bool,
) -> Result<(), Vec<String>> {
    if allow_fallback_for_missing {
        return Ok(());
    }

    let mut missing = Vec::new();
    for kind in AgentKind::SINGLETONS {
        if !bindings.contains_key(&(kind, None)) {
            missing.push(kind.as_str().to_string());
        }
    }
    for id in world.households.keys() {
        if !bindings.contains_key(&(AgentKind::Household, Some(id.clone()))) {
            missing.push(format!("household:{}", id));
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        missing.sort();
        Err(missing)
    }
}
