//! State store: write-through composition of the cache and durable tiers.
//!
//! All world-state reads are read-through (cache hit, else durable backfill)
//! and all writes land in the cache atomically before being propagated to
//! the durable tier with bounded exponential-backoff retry. Exhausting the
//! retry budget surfaces `EngineError::Persistence`, which the orchestrator
//! treats as fatal for the simulation.
//!
//! The orchestrator is the only writer per simulation, so propagating
//! synchronously inside `apply_updates` is observationally equivalent to a
//! background flush: the next tick cannot begin before the previous tick's
//! durable write has either settled or exhausted its budget.

pub mod cache;
pub mod durable;

pub use cache::{CacheError, CacheOp, CacheTier, MemoryCache};
pub use durable::{DurableStoreError, SnapshotMeta, SqliteStore, TickLogQuery};

use crate::config::SimulationConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{apply_commands, StateUpdateCommand, TickLogEntry, WorldState};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

fn world_key(simulation_id: &str) -> String {
    format!("sim:{}:world", simulation_id)
}

fn logs_key(simulation_id: &str) -> String {
    format!("sim:{}:logs", simulation_id)
}

fn participants_key(simulation_id: &str) -> String {
    format!("sim:{}:participants", simulation_id)
}

/// SHA-256 digest of a config's canonical JSON, attached to snapshots so a
/// restore can verify it is replaying against the same economy.
pub fn config_digest(config: &SimulationConfig) -> String {
    let serialized = serde_json::to_string(config).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct StateStore {
    cache: Arc<dyn CacheTier>,
    durable: Arc<SqliteStore>,
}

impl StateStore {
    pub fn new(cache: Arc<dyn CacheTier>, durable: Arc<SqliteStore>) -> Self {
        Self { cache, durable }
    }

    /// Shared handle to the durable tier (the script registry persists into
    /// the same database).
    pub fn durable(&self) -> Arc<SqliteStore> {
        Arc::clone(&self.durable)
    }

    fn parse_world(key: &str, text: &str) -> EngineResult<WorldState> {
        serde_json::from_str(text).map_err(|e| {
            EngineError::Cache(CacheError::Corrupt {
                key: key.to_string(),
                detail: e.to_string(),
            })
        })
    }

    /// Bounded exponential-backoff retry for durable writes.
    fn with_retry<F>(&self, simulation_id: &str, config: &SimulationConfig, mut write: F) -> EngineResult<()>
    where
        F: FnMut() -> Result<(), DurableStoreError>,
    {
        let budget = config.durable_retry_budget;
        for attempt in 0..=budget {
            match write() {
                Ok(()) => return Ok(()),
                Err(err) if attempt < budget => {
                    let backoff = config
                        .durable_retry_base_ms
                        .saturating_mul(1u64 << attempt.min(16));
                    warn!(
                        simulation_id,
                        attempt,
                        backoff_ms = backoff,
                        %err,
                        "durable write failed; retrying"
                    );
                    std::thread::sleep(Duration::from_millis(backoff));
                }
                Err(err) => {
                    warn!(simulation_id, %err, "durable write retry budget exhausted");
                    return Err(EngineError::Persistence(simulation_id.to_string()));
                }
            }
        }
        unreachable!("retry loop returns on final attempt");
    }

    // --- Lifecycle ---------------------------------------------------------

    /// Idempotent: create the initial world from config if absent, return
    /// the existing world otherwise.
    pub fn ensure_simulation(
        &self,
        simulation_id: &str,
        config: &SimulationConfig,
    ) -> EngineResult<WorldState> {
        let key = world_key(simulation_id);
        if let Some(text) = self.cache.get_text(&key)? {
            return Self::parse_world(&key, &text);
        }
        if let Some(text) = self.durable.load_world(simulation_id)? {
            debug!(simulation_id, "cache miss; backfilling world from durable tier");
            self.cache.put_text(&key, text.clone())?;
            return Self::parse_world(&key, &text);
        }

        config.validate()?;
        let world = WorldState::initial(simulation_id, config);
        let text = serde_json::to_string(&world).expect("world state serializes");
        self.with_retry(simulation_id, config, || {
            self.durable.upsert_world(simulation_id, world.tick, &text)
        })?;
        self.cache.put_text(&key, text)?;
        Ok(world)
    }

    /// Read-through world fetch. `NotFound` when neither tier has the world.
    pub fn get_world_state(&self, simulation_id: &str) -> EngineResult<WorldState> {
        let key = world_key(simulation_id);
        if let Some(text) = self.cache.get_text(&key)? {
            return Self::parse_world(&key, &text);
        }
        if let Some(text) = self.durable.load_world(simulation_id)? {
            self.cache.put_text(&key, text.clone())?;
            return Self::parse_world(&key, &text);
        }
        Err(EngineError::NotFound(format!(
            "simulation {}",
            simulation_id
        )))
    }

    /// Apply one tick's command batch all-or-nothing.
    ///
    /// The batch is applied to a scratch copy, re-typed, and invariant
    /// checked before the cache is touched; the cache therefore never
    /// exposes a partial tick. Returns the updated world.
    pub fn apply_updates(
        &self,
        simulation_id: &str,
        commands: &[StateUpdateCommand],
        config: &SimulationConfig,
    ) -> EngineResult<WorldState> {
        let key = world_key(simulation_id);
        let current = self.get_world_state(simulation_id)?;
        let mut scratch = serde_json::to_value(&current).expect("world state serializes");

        apply_commands(&mut scratch, commands).map_err(|e| EngineError::InvariantViolation {
            simulation_id: simulation_id.to_string(),
            detail: e.to_string(),
        })?;

        let updated: WorldState =
            serde_json::from_value(scratch).map_err(|e| EngineError::InvariantViolation {
                simulation_id: simulation_id.to_string(),
                detail: format!("command batch broke the world schema: {}", e),
            })?;
        updated
            .check_invariants(config.ticks_per_day)
            .map_err(|detail| EngineError::InvariantViolation {
                simulation_id: simulation_id.to_string(),
                detail,
            })?;

        let text = serde_json::to_string(&updated).expect("world state serializes");
        self.cache.put_text(&key, text.clone())?;
        self.with_retry(simulation_id, config, || {
            self.durable.upsert_world(simulation_id, updated.tick, &text)
        })?;
        Ok(updated)
    }

    /// Append tick logs to the cached recent window and the durable history.
    pub fn record_tick(
        &self,
        simulation_id: &str,
        entries: &[TickLogEntry],
        config: &SimulationConfig,
    ) -> EngineResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let key = logs_key(simulation_id);
        let ops = entries
            .iter()
            .map(|entry| CacheOp::PushList {
                key: key.clone(),
                entry: serde_json::to_string(entry).expect("tick log serializes"),
                cap: config.log_cache_entries,
            })
            .collect();
        self.cache.apply_batch(ops)?;
        self.with_retry(simulation_id, config, || {
            self.durable.append_tick_logs(entries)
        })
    }

    /// Recent cached tick logs, oldest first.
    pub fn recent_tick_logs(&self, simulation_id: &str) -> EngineResult<Vec<TickLogEntry>> {
        let raw = self.cache.list(&logs_key(simulation_id))?;
        let mut entries = Vec::with_capacity(raw.len());
        for text in raw {
            entries.push(
                serde_json::from_str(&text).map_err(|e| CacheError::Corrupt {
                    key: logs_key(simulation_id),
                    detail: e.to_string(),
                })?,
            );
        }
        Ok(entries)
    }

    /// Full-history log query against the durable tier.
    pub fn list_tick_logs(
        &self,
        simulation_id: &str,
        query: &TickLogQuery,
    ) -> EngineResult<Vec<TickLogEntry>> {
        Ok(self.durable.query_tick_logs(simulation_id, query)?)
    }

    /// Persist a snapshot of the current world with the config digest.
    pub fn snapshot_world(
        &self,
        simulation_id: &str,
        config: &SimulationConfig,
    ) -> EngineResult<()> {
        let world = self.get_world_state(simulation_id)?;
        let text = serde_json::to_string(&world).expect("world state serializes");
        let digest = config_digest(config);
        self.with_retry(simulation_id, config, || {
            self.durable
                .insert_snapshot(simulation_id, world.tick, &text, &digest)
        })
    }

    pub fn list_snapshots(&self, simulation_id: &str) -> EngineResult<Vec<SnapshotMeta>> {
        Ok(self.durable.list_snapshots(simulation_id)?)
    }

    /// Delete world state from both tiers; scripts keep their bindings and
    /// the durable log history is retained (append-only).
    pub fn reset_simulation(
        &self,
        simulation_id: &str,
        config: &SimulationConfig,
    ) -> EngineResult<()> {
        self.cache.apply_batch(vec![
            CacheOp::Delete {
                key: world_key(simulation_id),
            },
            CacheOp::Delete {
                key: logs_key(simulation_id),
            },
        ])?;
        self.with_retry(simulation_id, config, || {
            self.durable.delete_world(simulation_id)
        })?;
        self.with_retry(simulation_id, config, || {
            self.durable.delete_snapshots(simulation_id)
        })
    }

    /// Remove the world and release the participant set. Script detachment
    /// is the registry's responsibility; the orchestrator coordinates both.
    pub fn delete_simulation(
        &self,
        simulation_id: &str,
        config: &SimulationConfig,
    ) -> EngineResult<()> {
        self.cache.apply_batch(vec![
            CacheOp::Delete {
                key: world_key(simulation_id),
            },
            CacheOp::Delete {
                key: logs_key(simulation_id),
            },
            CacheOp::Delete {
                key: participants_key(simulation_id),
            },
        ])?;
        self.with_retry(simulation_id, config, || {
            self.durable.delete_world(simulation_id)
        })?;
        self.with_retry(simulation_id, config, || {
            self.durable.delete_snapshots(simulation_id)
        })
    }

    // --- Participants ------------------------------------------------------

    pub fn register_participant(
        &self,
        simulation_id: &str,
        user_id: &str,
    ) -> EngineResult<()> {
        self.cache.apply_batch(vec![CacheOp::AddMember {
            key: participants_key(simulation_id),
            member: user_id.to_string(),
        }])?;
        Ok(())
    }

    pub fn list_participants(&self, simulation_id: &str) -> EngineResult<Vec<String>> {
        Ok(self.cache.members(&participants_key(simulation_id))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StateUpdateCommand;

    fn test_config() -> SimulationConfig {
        SimulationConfig {
            ticks_per_day: 3,
            durable_retry_budget: 1,
            durable_retry_base_ms: 0,
            ..Default::default()
        }
    }

    fn store() -> StateStore {
        StateStore::new(
            Arc::new(MemoryCache::new()),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
        )
    }

    #[test]
    fn ensure_is_idempotent() {
        let store = store();
        let cfg = test_config();
        let first = store.ensure_simulation("sim-1", &cfg).unwrap();
        let second = store.ensure_simulation("sim-1", &cfg).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn get_world_read_through_backfills_cache() {
        let store = store();
        let cfg = test_config();
        store.ensure_simulation("sim-1", &cfg).unwrap();
        // Drop the cached copy; the durable tier must repopulate it.
        store.cache.delete(&world_key("sim-1")).unwrap();
        let world = store.get_world_state("sim-1").unwrap();
        assert_eq!(world.simulation_id, "sim-1");
        assert!(store
            .cache
            .get_text(&world_key("sim-1"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn get_world_unknown_simulation_is_not_found() {
        let store = store();
        assert!(matches!(
            store.get_world_state("ghost"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn apply_updates_is_atomic_on_bad_command() {
        let store = store();
        let cfg = test_config();
        store.ensure_simulation("sim-1", &cfg).unwrap();
        let before = store.get_world_state("sim-1").unwrap();
        let commands = vec![
            StateUpdateCommand::delta("households.000.cash", -10.0),
            StateUpdateCommand::delta("households.zzz.cash", 10.0), // bad path
        ];
        let err = store.apply_updates("sim-1", &commands, &cfg).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation { .. }));
        assert_eq!(store.get_world_state("sim-1").unwrap(), before);
    }

    #[test]
    fn apply_updates_rejects_negative_balances() {
        let store = store();
        let cfg = test_config();
        store.ensure_simulation("sim-1", &cfg).unwrap();
        let commands = vec![StateUpdateCommand::delta("households.000.cash", -1e9)];
        assert!(matches!(
            store.apply_updates("sim-1", &commands, &cfg),
            Err(EngineError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn persistence_error_after_retry_budget() {
        let store = store();
        let cfg = test_config();
        store.ensure_simulation("sim-1", &cfg).unwrap();
        store.durable.set_fail_writes(true);
        let commands = vec![StateUpdateCommand::delta("households.000.cash", -1.0)];
        let err = store.apply_updates("sim-1", &commands, &cfg).unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        // The cache write already succeeded (write-through semantics).
        let cached = store.get_world_state("sim-1").unwrap();
        assert!((cached.households["000"].cash - 99.0).abs() < 1e-9);
    }

    #[test]
    fn reset_preserves_nothing_of_the_world() {
        let store = store();
        let cfg = test_config();
        store.ensure_simulation("sim-1", &cfg).unwrap();
        store.reset_simulation("sim-1", &cfg).unwrap();
        assert!(matches!(
            store.get_world_state("sim-1"),
            Err(EngineError::NotFound(_))
        ));
        // Re-ensuring with the same config recreates the initial world.
        let world = store.ensure_simulation("sim-1", &cfg).unwrap();
        assert_eq!(world.tick, 0);
    }

    #[test]
    fn record_tick_feeds_cache_ring_and_durable_history() {
        let store = store();
        let cfg = test_config();
        store.ensure_simulation("sim-1", &cfg).unwrap();
        let entries = vec![TickLogEntry::new(
            "sim-1",
            1,
            0,
            "goods_market",
            serde_json::json!({ "cleared_quantity": 1.0 }),
        )];
        store.record_tick("sim-1", &entries, &cfg).unwrap();

        let recent = store.recent_tick_logs("sim-1").unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "goods_market");

        let history = store
            .list_tick_logs(
                "sim-1",
                &TickLogQuery {
                    limit: 10,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].recorded_at.is_some());
    }

    #[test]
    fn participants_are_a_set() {
        let store = store();
        store.register_participant("sim-1", "user-a").unwrap();
        store.register_participant("sim-1", "user-a").unwrap();
        store.register_participant("sim-1", "user-b").unwrap();
        assert_eq!(
            store.list_participants("sim-1").unwrap(),
            vec!["user-a", "user-b"]
        );
    }
}
