//! Durable tier: the relational store backing the cache.
//!
//! Tables:
//! - `scripts`: script catalog with a partial unique index on the
//!   `(simulation_id, agent_kind, entity_id)` binding triple.
//! - `tick_logs`: append-only tick log history, indexed by `(simulation, tick)`.
//! - `simulation_limits`: per-simulation script quota overrides.
//! - `world_current`: one row per simulation with the latest persisted world.
//! - `world_snapshots`: day-boundary world snapshots with a config digest.
//!
//! Writes can be forced to fail via [`SqliteStore::set_fail_writes`]; the
//! persistence-failure integration tests use this to exercise the retry
//! budget and the `Failed` lifecycle transition.

use crate::models::{AgentKind, TickLogEntry};
use crate::registry::ScriptRecord;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DurableStoreError {
    #[error("durable store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Injected by the test write-failure switch.
    #[error("durable store writes are unavailable")]
    WritesUnavailable,

    #[error("durable row for '{key}' is corrupt: {detail}")]
    Corrupt { key: String, detail: String },
}

/// Snapshot row metadata (the serialized world is fetched separately).
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotMeta {
    pub tick: u64,
    pub config_digest: String,
    pub recorded_at: String,
}

/// Filters for [`SqliteStore::query_tick_logs`].
#[derive(Debug, Clone, Default)]
pub struct TickLogQuery {
    pub tick_range: Option<(u64, u64)>,
    pub day_range: Option<(u64, u64)>,
    /// Substring match on `message`.
    pub message_filter: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    fail_writes: AtomicBool,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, DurableStoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, DurableStoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DurableStoreError> {
        let store = Self {
            conn: Mutex::new(conn),
            fail_writes: AtomicBool::new(false),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), DurableStoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scripts (
                script_id TEXT PRIMARY KEY,
                simulation_id TEXT,
                user_id TEXT NOT NULL,
                agent_kind TEXT NOT NULL,
                entity_id TEXT,
                description TEXT NOT NULL DEFAULT '',
                code TEXT NOT NULL,
                code_version TEXT NOT NULL,
                code_digest TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_scripts_binding
                ON scripts (simulation_id, agent_kind, entity_id)
                WHERE simulation_id IS NOT NULL;
            CREATE TABLE IF NOT EXISTS tick_logs (
                simulation_id TEXT NOT NULL,
                tick INTEGER NOT NULL,
                day INTEGER NOT NULL,
                message TEXT NOT NULL,
                context TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tick_logs_sim_tick
                ON tick_logs (simulation_id, tick);
            CREATE TABLE IF NOT EXISTS simulation_limits (
                simulation_id TEXT PRIMARY KEY,
                script_limit INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS world_current (
                simulation_id TEXT PRIMARY KEY,
                tick INTEGER NOT NULL,
                state_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS world_snapshots (
                simulation_id TEXT NOT NULL,
                tick INTEGER NOT NULL,
                state_json TEXT NOT NULL,
                config_digest TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_world_snapshots_sim
                ON world_snapshots (simulation_id, tick);",
        )?;
        Ok(())
    }

    /// Test switch: make every subsequent write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), DurableStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(DurableStoreError::WritesUnavailable)
        } else {
            Ok(())
        }
    }

    fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }

    // --- World state -------------------------------------------------------

    pub fn upsert_world(
        &self,
        simulation_id: &str,
        tick: u64,
        state_json: &str,
    ) -> Result<(), DurableStoreError> {
        self.check_writable()?;
        self.conn.lock().execute(
            "INSERT INTO world_current (simulation_id, tick, state_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (simulation_id) DO UPDATE
             SET tick = excluded.tick,
                 state_json = excluded.state_json,
                 updated_at = excluded.updated_at",
            params![simulation_id, tick as i64, state_json, Self::now()],
        )?;
        Ok(())
    }

    pub fn load_world(&self, simulation_id: &str) -> Result<Option<String>, DurableStoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT state_json FROM world_current WHERE simulation_id = ?1",
                params![simulation_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete_world(&self, simulation_id: &str) -> Result<(), DurableStoreError> {
        self.check_writable()?;
        self.conn.lock().execute(
            "DELETE FROM world_current WHERE simulation_id = ?1",
            params![simulation_id],
        )?;
        Ok(())
    }

    // --- Snapshots ---------------------------------------------------------

    pub fn insert_snapshot(
        &self,
        simulation_id: &str,
        tick: u64,
        state_json: &str,
        config_digest: &str,
    ) -> Result<(), DurableStoreError> {
        self.check_writable()?;
        self.conn.lock().execute(
            "INSERT INTO world_snapshots
                (simulation_id, tick, state_json, config_digest, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                simulation_id,
                tick as i64,
                state_json,
                config_digest,
                Self::now()
            ],
        )?;
        Ok(())
    }

    pub fn list_snapshots(
        &self,
        simulation_id: &str,
    ) -> Result<Vec<SnapshotMeta>, DurableStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT tick, config_digest, recorded_at FROM world_snapshots
             WHERE simulation_id = ?1 ORDER BY tick ASC",
        )?;
        let rows = stmt
            .query_map(params![simulation_id], |row| {
                Ok(SnapshotMeta {
                    tick: row.get::<_, i64>(0)? as u64,
                    config_digest: row.get(1)?,
                    recorded_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_snapshots(&self, simulation_id: &str) -> Result<(), DurableStoreError> {
        self.check_writable()?;
        self.conn.lock().execute(
            "DELETE FROM world_snapshots WHERE simulation_id = ?1",
            params![simulation_id],
        )?;
        Ok(())
    }

    // --- Tick logs ---------------------------------------------------------

    /// Append entries, stamping `recorded_at`.
    pub fn append_tick_logs(&self, entries: &[TickLogEntry]) -> Result<(), DurableStoreError> {
        self.check_writable()?;
        let now = Self::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO tick_logs
                    (simulation_id, tick, day, message, context, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for entry in entries {
                stmt.execute(params![
                    entry.simulation_id,
                    entry.tick as i64,
                    entry.day as i64,
                    entry.message,
                    entry.context.to_string(),
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn query_tick_logs(
        &self,
        simulation_id: &str,
        query: &TickLogQuery,
    ) -> Result<Vec<TickLogEntry>, DurableStoreError> {
        let mut sql = String::from(
            "SELECT tick, day, message, context, recorded_at FROM tick_logs
             WHERE simulation_id = ?1",
        );
        let mut bindings: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(simulation_id.to_string())];

        if let Some((lo, hi)) = query.tick_range {
            sql.push_str(&format!(
                " AND tick >= ?{} AND tick <= ?{}",
                bindings.len() + 1,
                bindings.len() + 2
            ));
            bindings.push(Box::new(lo as i64));
            bindings.push(Box::new(hi as i64));
        }
        if let Some((lo, hi)) = query.day_range {
            sql.push_str(&format!(
                " AND day >= ?{} AND day <= ?{}",
                bindings.len() + 1,
                bindings.len() + 2
            ));
            bindings.push(Box::new(lo as i64));
            bindings.push(Box::new(hi as i64));
        }
        if let Some(filter) = &query.message_filter {
            sql.push_str(&format!(" AND message LIKE ?{}", bindings.len() + 1));
            bindings.push(Box::new(format!("%{}%", filter)));
        }
        sql.push_str(&format!(
            " ORDER BY rowid ASC LIMIT ?{} OFFSET ?{}",
            bindings.len() + 1,
            bindings.len() + 2
        ));
        let limit = if query.limit == 0 { 100 } else { query.limit };
        bindings.push(Box::new(limit as i64));
        bindings.push(Box::new(query.offset as i64));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(bindings.iter().map(|b| b.as_ref()));
        let rows = stmt
            .query_map(params, |row| {
                let context: String = row.get(3)?;
                Ok(TickLogEntry {
                    simulation_id: simulation_id.to_string(),
                    tick: row.get::<_, i64>(0)? as u64,
                    day: row.get::<_, i64>(1)? as u64,
                    message: row.get(2)?,
                    context: serde_json::from_str(&context)
                        .unwrap_or(serde_json::Value::Null),
                    recorded_at: Some(row.get(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- Scripts -----------------------------------------------------------

    pub fn insert_script(&self, record: &ScriptRecord) -> Result<(), DurableStoreError> {
        self.check_writable()?;
        self.conn.lock().execute(
            "INSERT INTO scripts
                (script_id, simulation_id, user_id, agent_kind, entity_id,
                 description, code, code_version, code_digest, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.script_id.to_string(),
                record.simulation_id,
                record.user_id,
                record.agent_kind.as_str(),
                record.entity_id,
                record.description,
                record.code,
                record.code_version.to_string(),
                record.code_digest,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_script(&self, record: &ScriptRecord) -> Result<(), DurableStoreError> {
        self.check_writable()?;
        self.conn.lock().execute(
            "UPDATE scripts SET
                simulation_id = ?2, entity_id = ?3, code = ?4,
                code_version = ?5, code_digest = ?6, updated_at = ?7
             WHERE script_id = ?1",
            params![
                record.script_id.to_string(),
                record.simulation_id,
                record.entity_id,
                record.code,
                record.code_version.to_string(),
                record.code_digest,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn delete_script(&self, script_id: Uuid) -> Result<(), DurableStoreError> {
        self.check_writable()?;
        self.conn.lock().execute(
            "DELETE FROM scripts WHERE script_id = ?1",
            params![script_id.to_string()],
        )?;
        Ok(())
    }

    /// Null out the simulation binding of every script attached to a
    /// simulation. Used by `delete_simulation`.
    pub fn detach_scripts_for_simulation(
        &self,
        simulation_id: &str,
    ) -> Result<usize, DurableStoreError> {
        self.check_writable()?;
        let changed = self.conn.lock().execute(
            "UPDATE scripts SET simulation_id = NULL, updated_at = ?2
             WHERE simulation_id = ?1",
            params![simulation_id, Self::now()],
        )?;
        Ok(changed)
    }

    /// Hydrate the registry's in-memory index at startup.
    pub fn load_all_scripts(&self) -> Result<Vec<ScriptRecord>, DurableStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT script_id, simulation_id, user_id, agent_kind, entity_id,
                    description, code, code_version, code_digest, created_at, updated_at
             FROM scripts",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let script_id: String = row.get(0)?;
                let agent_kind: String = row.get(3)?;
                let code_version: String = row.get(7)?;
                Ok((script_id, row.get::<_, Option<String>>(1)?, row.get::<_, String>(2)?, agent_kind, row.get::<_, Option<String>>(4)?, row.get::<_, String>(5)?, row.get::<_, String>(6)?, code_version, row.get::<_, String>(8)?, row.get::<_, String>(9)?, row.get::<_, String>(10)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (
            script_id,
            simulation_id,
            user_id,
            agent_kind,
            entity_id,
            description,
            code,
            code_version,
            code_digest,
            created_at,
            updated_at,
        ) in rows
        {
            let parse_err = |detail: String| DurableStoreError::Corrupt {
                key: format!("scripts/{}", script_id),
                detail,
            };
            records.push(ScriptRecord {
                script_id: Uuid::parse_str(&script_id)
                    .map_err(|e| parse_err(e.to_string()))?,
                simulation_id,
                user_id,
                agent_kind: AgentKind::parse(&agent_kind)
                    .ok_or_else(|| parse_err(format!("unknown agent_kind '{}'", agent_kind)))?,
                entity_id,
                description,
                code,
                code_version: Uuid::parse_str(&code_version)
                    .map_err(|e| parse_err(e.to_string()))?,
                code_digest,
                created_at,
                updated_at,
            });
        }
        Ok(records)
    }

    // --- Simulation limits -------------------------------------------------

    pub fn get_script_limit(
        &self,
        simulation_id: &str,
    ) -> Result<Option<u32>, DurableStoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT script_limit FROM simulation_limits WHERE simulation_id = ?1",
                params![simulation_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(row.map(|v| v as u32))
    }

    pub fn set_script_limit(
        &self,
        simulation_id: &str,
        limit: u32,
    ) -> Result<(), DurableStoreError> {
        self.check_writable()?;
        self.conn.lock().execute(
            "INSERT INTO simulation_limits (simulation_id, script_limit, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (simulation_id) DO UPDATE
             SET script_limit = excluded.script_limit,
                 updated_at = excluded.updated_at",
            params![simulation_id, limit as i64, Self::now()],
        )?;
        Ok(())
    }
}
