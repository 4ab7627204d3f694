//! Script registry: catalog, bindings, quotas, versioning.
//!
//! The registry keeps an in-memory index of every script and binding,
//! protected by a single registry-wide lock. Mutations write to the durable
//! tier *inside* the critical section and roll the in-memory change back if
//! the durable write fails, so the availability check and the index update are
//! therefore atomic with respect to concurrent attaches, which is what rules
//! out double-bound triples.
//!
//! A binding is the association of one script with a
//! `(simulation_id, agent_kind, entity_id)` triple. Personal-library scripts
//! (`simulation_id = None`) carry no entity binding.

pub mod validation;

pub use validation::{validate_script, ScriptValidationError, ValidationResult, IMPORT_WHITELIST};

use crate::error::{EngineError, EngineResult};
use crate::models::AgentKind;
use crate::store::SqliteStore;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// One stored script with its (optional) simulation binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptRecord {
    pub script_id: Uuid,
    pub user_id: String,
    pub simulation_id: Option<String>,
    pub agent_kind: AgentKind,
    /// Household id for household bindings; `None` for singleton kinds and
    /// for personal-library scripts.
    pub entity_id: Option<String>,
    pub description: String,
    pub code: String,
    /// Regenerated only when the source digest changes; the sandbox keys
    /// compiled-code caches on this.
    pub code_version: Uuid,
    pub code_digest: String,
    pub created_at: String,
    pub updated_at: String,
}

type BindingKey = (String, AgentKind, Option<String>);

#[derive(Default)]
struct RegistryIndex {
    scripts: HashMap<Uuid, ScriptRecord>,
    bindings: HashMap<BindingKey, Uuid>,
    per_user: HashMap<String, u32>,
}

impl RegistryIndex {
    fn binding_key(record: &ScriptRecord) -> Option<BindingKey> {
        record
            .simulation_id
            .as_ref()
            .map(|sim| (sim.clone(), record.agent_kind, record.entity_id.clone()))
    }

    fn insert(&mut self, record: ScriptRecord) {
        if let Some(key) = Self::binding_key(&record) {
            self.bindings.insert(key, record.script_id);
        }
        *self.per_user.entry(record.user_id.clone()).or_default() += 1;
        self.scripts.insert(record.script_id, record);
    }

    fn remove(&mut self, script_id: Uuid) -> Option<ScriptRecord> {
        let record = self.scripts.remove(&script_id)?;
        if let Some(key) = Self::binding_key(&record) {
            self.bindings.remove(&key);
        }
        if let Some(count) = self.per_user.get_mut(&record.user_id) {
            *count = count.saturating_sub(1);
        }
        Some(record)
    }
}

pub struct ScriptRegistry {
    index: Mutex<RegistryIndex>,
    durable: Arc<SqliteStore>,
    default_script_limit: u32,
}

fn code_digest(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn join_validation_errors(errors: Vec<ScriptValidationError>) -> EngineError {
    let detail = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    EngineError::InvalidScript(detail)
}

fn conflicting(simulation_id: &str, agent_kind: AgentKind, entity_id: &Option<String>) -> EngineError {
    EngineError::ConflictingBinding {
        simulation_id: simulation_id.to_string(),
        agent_kind: agent_kind.as_str().to_string(),
        entity: entity_id.clone().unwrap_or_else(|| "-".to_string()),
    }
}

/// Binding rules shared by register and attach.
fn check_entity_shape(
    agent_kind: AgentKind,
    entity_id: &Option<String>,
) -> EngineResult<()> {
    match agent_kind {
        AgentKind::Household if entity_id.is_none() => Err(EngineError::InvalidConfig(
            "household bindings require an entity_id".to_string(),
        )),
        AgentKind::Household => Ok(()),
        _ if entity_id.is_some() => Err(EngineError::InvalidConfig(format!(
            "{} bindings must not carry an entity_id",
            agent_kind
        ))),
        _ => Ok(()),
    }
}

impl ScriptRegistry {
    /// Build a registry over the shared durable store, hydrating the index
    /// from the `scripts` table.
    pub fn new(durable: Arc<SqliteStore>, default_script_limit: u32) -> EngineResult<Self> {
        let mut index = RegistryIndex::default();
        for record in durable.load_all_scripts()? {
            index.insert(record);
        }
        Ok(Self {
            index: Mutex::new(index),
            durable,
            default_script_limit,
        })
    }

    fn script_limit_for(&self, simulation_id: &str) -> u32 {
        self.durable
            .get_script_limit(simulation_id)
            .ok()
            .flatten()
            .unwrap_or(self.default_script_limit)
    }

    /// Validate, quota-check and persist a new script. Returns its id.
    pub fn register_script(
        &self,
        user_id: &str,
        code: &str,
        agent_kind: AgentKind,
        entity_id: Option<String>,
        simulation_id: Option<String>,
        description: &str,
    ) -> EngineResult<Uuid> {
        validate_script(code).map_err(join_validation_errors)?;
        if simulation_id.is_some() {
            check_entity_shape(agent_kind, &entity_id)?;
        } else if entity_id.is_some() {
            return Err(EngineError::InvalidConfig(
                "entity_id requires a simulation_id".to_string(),
            ));
        }

        let mut index = self.index.lock();

        let owned = index.per_user.get(user_id).copied().unwrap_or(0);
        if owned >= self.default_script_limit {
            return Err(EngineError::QuotaExceeded {
                user_id: user_id.to_string(),
                limit: self.default_script_limit,
            });
        }
        if let Some(sim) = &simulation_id {
            let per_sim_limit = self.script_limit_for(sim);
            let bound_here = index
                .scripts
                .values()
                .filter(|s| s.user_id == user_id && s.simulation_id.as_deref() == Some(sim.as_str()))
                .count() as u32;
            if bound_here >= per_sim_limit {
                return Err(EngineError::QuotaExceeded {
                    user_id: user_id.to_string(),
                    limit: per_sim_limit,
                });
            }
            let key = (sim.clone(), agent_kind, entity_id.clone());
            if index.bindings.contains_key(&key) {
                return Err(conflicting(sim, agent_kind, &entity_id));
            }
        }

        let timestamp = now();
        let record = ScriptRecord {
            script_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            simulation_id,
            agent_kind,
            entity_id,
            description: description.to_string(),
            code: code.to_string(),
            code_version: Uuid::new_v4(),
            code_digest: code_digest(code),
            created_at: timestamp.clone(),
            updated_at: timestamp,
        };
        let script_id = record.script_id;

        index.insert(record.clone());
        if let Err(err) = self.durable.insert_script(&record) {
            index.remove(script_id);
            return Err(err.into());
        }
        info!(user_id, %script_id, kind = %agent_kind, "script registered");
        Ok(script_id)
    }

    /// Bind a personal-library script to a simulation triple.
    ///
    /// Availability check, index update and durable write all happen under
    /// the registry lock; a durable failure rolls the index back before the
    /// lock is released.
    pub fn attach_script(
        &self,
        script_id: Uuid,
        simulation_id: &str,
        entity_id: Option<String>,
    ) -> EngineResult<()> {
        let mut index = self.index.lock();

        let record = index
            .scripts
            .get(&script_id)
            .ok_or_else(|| EngineError::NotFound(format!("script {}", script_id)))?
            .clone();
        if let Some(existing) = &record.simulation_id {
            return Err(conflicting(existing, record.agent_kind, &record.entity_id));
        }
        check_entity_shape(record.agent_kind, &entity_id)?;

        let key = (simulation_id.to_string(), record.agent_kind, entity_id.clone());
        if index.bindings.contains_key(&key) {
            return Err(conflicting(simulation_id, record.agent_kind, &entity_id));
        }

        let mut updated = record.clone();
        updated.simulation_id = Some(simulation_id.to_string());
        updated.entity_id = entity_id;
        updated.updated_at = now();

        index.bindings.insert(key.clone(), script_id);
        index.scripts.insert(script_id, updated.clone());
        if let Err(err) = self.durable.update_script(&updated) {
            // Roll back before releasing the lock.
            index.bindings.remove(&key);
            index.scripts.insert(script_id, record);
            return Err(err.into());
        }
        Ok(())
    }

    /// Return a bound script to the personal library.
    pub fn detach_script(&self, script_id: Uuid) -> EngineResult<()> {
        let mut index = self.index.lock();
        let record = index
            .scripts
            .get(&script_id)
            .ok_or_else(|| EngineError::NotFound(format!("script {}", script_id)))?
            .clone();
        let Some(key) = RegistryIndex::binding_key(&record) else {
            return Ok(()); // already a library script
        };

        let mut updated = record.clone();
        updated.simulation_id = None;
        updated.entity_id = None;
        updated.updated_at = now();

        index.bindings.remove(&key);
        index.scripts.insert(script_id, updated.clone());
        if let Err(err) = self.durable.update_script(&updated) {
            index.bindings.insert(key, script_id);
            index.scripts.insert(script_id, record);
            return Err(err.into());
        }
        Ok(())
    }

    pub fn delete_script(&self, script_id: Uuid) -> EngineResult<()> {
        let mut index = self.index.lock();
        let record = index
            .remove(script_id)
            .ok_or_else(|| EngineError::NotFound(format!("script {}", script_id)))?;
        if let Err(err) = self.durable.delete_script(script_id) {
            index.insert(record);
            return Err(err.into());
        }
        Ok(())
    }

    /// Replace a script's source. A fresh `code_version` is generated only
    /// when the source digest actually changes. The day-boundary gate for
    /// bound scripts is enforced by the orchestrator, which sees the
    /// simulation clock.
    pub fn update_script_code(&self, script_id: Uuid, new_code: &str) -> EngineResult<Uuid> {
        validate_script(new_code).map_err(join_validation_errors)?;
        let mut index = self.index.lock();
        let record = index
            .scripts
            .get(&script_id)
            .ok_or_else(|| EngineError::NotFound(format!("script {}", script_id)))?
            .clone();

        let digest = code_digest(new_code);
        let mut updated = record.clone();
        if digest != record.code_digest {
            updated.code_version = Uuid::new_v4();
        }
        updated.code = new_code.to_string();
        updated.code_digest = digest;
        updated.updated_at = now();
        let version = updated.code_version;

        index.scripts.insert(script_id, updated.clone());
        if let Err(err) = self.durable.update_script(&updated) {
            index.scripts.insert(script_id, record);
            return Err(err.into());
        }
        Ok(version)
    }

    pub fn get_script(&self, script_id: Uuid) -> EngineResult<ScriptRecord> {
        self.index
            .lock()
            .scripts
            .get(&script_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("script {}", script_id)))
    }

    pub fn list_user_scripts(&self, user_id: &str) -> Vec<ScriptRecord> {
        let index = self.index.lock();
        let mut scripts: Vec<ScriptRecord> = index
            .scripts
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        scripts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.script_id.cmp(&b.script_id)));
        scripts
    }

    pub fn list_simulation_scripts(&self, simulation_id: &str) -> Vec<ScriptRecord> {
        let index = self.index.lock();
        let mut scripts: Vec<ScriptRecord> = index
            .scripts
            .values()
            .filter(|s| s.simulation_id.as_deref() == Some(simulation_id))
            .cloned()
            .collect();
        scripts.sort_by(|a, b| {
            (a.agent_kind, &a.entity_id).cmp(&(b.agent_kind, &b.entity_id))
        });
        scripts
    }

    /// Binding resolution used by the orchestrator every tick.
    pub fn resolve_bindings(
        &self,
        simulation_id: &str,
    ) -> BTreeMap<(AgentKind, Option<String>), ScriptRecord> {
        let index = self.index.lock();
        index
            .bindings
            .iter()
            .filter(|((sim, _, _), _)| sim == simulation_id)
            .filter_map(|((_, kind, entity), id)| {
                index
                    .scripts
                    .get(id)
                    .map(|record| ((*kind, entity.clone()), record.clone()))
            })
            .collect()
    }

    /// Detach every script bound to a simulation (used by delete).
    pub fn detach_all_for_simulation(&self, simulation_id: &str) -> EngineResult<usize> {
        let mut index = self.index.lock();
        let bound: Vec<Uuid> = index
            .bindings
            .iter()
            .filter(|((sim, _, _), _)| sim == simulation_id)
            .map(|(_, id)| *id)
            .collect();

        let mut previous = Vec::with_capacity(bound.len());
        for id in &bound {
            if let Some(record) = index.scripts.get(id).cloned() {
                previous.push(record.clone());
                if let Some(key) = RegistryIndex::binding_key(&record) {
                    index.bindings.remove(&key);
                }
                let mut updated = record;
                updated.simulation_id = None;
                updated.entity_id = None;
                updated.updated_at = now();
                index.scripts.insert(*id, updated);
            }
        }
        if let Err(err) = self.durable.detach_scripts_for_simulation(simulation_id) {
            for record in previous {
                index.insert(record.clone());
                // insert() bumps the per-user count; compensate.
                if let Some(count) = index.per_user.get_mut(&record.user_id) {
                    *count = count.saturating_sub(1);
                }
            }
            return Err(err.into());
        }
        Ok(bound.len())
    }
}
