//! Concurrency tests for the script registry.
//!
//! Scenario: many clients race to attach distinct scripts to the same
//! `(simulation, agent_kind, entity)` triple. The registry-wide lock with
//! rollback-on-durable-failure must admit exactly one winner.

use econ_simulator_core_rs::registry::ScriptRegistry;
use econ_simulator_core_rs::store::SqliteStore;
use econ_simulator_core_rs::{AgentKind, EngineError};
use std::sync::Arc;

const SCRIPT: &str = "def generate_decisions(context):\n    return {}\n";

#[test]
fn concurrent_attach_admits_exactly_one_winner() {
    let durable = Arc::new(SqliteStore::open_in_memory().unwrap());
    let registry = Arc::new(ScriptRegistry::new(durable, 32).unwrap());

    // Ten distinct library scripts, one per "user".
    let script_ids: Vec<_> = (0..10)
        .map(|i| {
            registry
                .register_script(
                    &format!("user-{}", i),
                    SCRIPT,
                    AgentKind::Household,
                    None,
                    None,
                    "",
                )
                .unwrap()
        })
        .collect();

    let mut successes = 0;
    let mut conflicts = 0;
    std::thread::scope(|scope| {
        let handles: Vec<_> = script_ids
            .iter()
            .map(|script_id| {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    registry.attach_script(*script_id, "sim-1", Some("000".to_string()))
                })
            })
            .collect();
        for handle in handles {
            match handle.join().unwrap() {
                Ok(()) => successes += 1,
                Err(EngineError::ConflictingBinding { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }
    });

    assert_eq!(successes, 1);
    assert_eq!(conflicts, 9);

    let bound = registry.list_simulation_scripts("sim-1");
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].entity_id.as_deref(), Some("000"));
}

#[test]
fn concurrent_registration_respects_binding_uniqueness() {
    let durable = Arc::new(SqliteStore::open_in_memory().unwrap());
    let registry = Arc::new(ScriptRegistry::new(durable, 32).unwrap());

    let mut successes = 0;
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    registry.register_script(
                        &format!("user-{}", i),
                        SCRIPT,
                        AgentKind::Firm,
                        None,
                        Some("sim-1".to_string()),
                        "",
                    )
                })
            })
            .collect();
        for handle in handles {
            if handle.join().unwrap().is_ok() {
                successes += 1;
            }
        }
    });
    assert_eq!(successes, 1);
    assert_eq!(registry.list_simulation_scripts("sim-1").len(), 1);
}

#[test]
fn index_survives_process_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("econ.db");

    let script_id = {
        let durable = Arc::new(SqliteStore::open(&db_path).unwrap());
        let registry = ScriptRegistry::new(durable, 32).unwrap();
        registry
            .register_script(
                "user-a",
                SCRIPT,
                AgentKind::Household,
                Some("000".to_string()),
                Some("sim-1".to_string()),
                "persistent",
            )
            .unwrap()
    };

    // Fresh store over the same database file, as after a restart.
    let durable = Arc::new(SqliteStore::open(&db_path).unwrap());
    let registry = ScriptRegistry::new(durable, 32).unwrap();
    let bindings = registry.resolve_bindings("sim-1");
    assert_eq!(bindings.len(), 1);
    let record = bindings
        .get(&(AgentKind::Household, Some("000".to_string())))
        .unwrap();
    assert_eq!(record.script_id, script_id);
    assert_eq!(record.description, "persistent");
}

#[test]
fn detach_after_attach_restores_availability() {
    let durable = Arc::new(SqliteStore::open_in_memory().unwrap());
    let registry = Arc::new(ScriptRegistry::new(durable, 32).unwrap());
    let first = registry
        .register_script("user-a", SCRIPT, AgentKind::Bank, None, None, "")
        .unwrap();
    let second = registry
        .register_script("user-b", SCRIPT, AgentKind::Bank, None, None, "")
        .unwrap();

    registry.attach_script(first, "sim-1", None).unwrap();
    assert!(matches!(
        registry.attach_script(second, "sim-1", None),
        Err(EngineError::ConflictingBinding { .. })
    ));
    registry.detach_script(first).unwrap();
    registry.attach_script(second, "sim-1", None).unwrap();
}
