//! Cache tier: a low-latency keyed store.
//!
//! Keys follow the `sim:{id}:world` / `sim:{id}:logs` / `sim:{id}:participants`
//! layout. Three slot shapes exist: text (serialized world state), bounded
//! list (recent tick logs) and set (participants). [`CacheTier::apply_batch`]
//! is all-or-nothing: every operation is type-checked against the existing
//! slots before any mutation happens, so a failed batch leaves the cache
//! untouched.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, VecDeque};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CacheError {
    #[error("cache key '{0}' holds a different value type")]
    WrongType(String),

    #[error("cache entry for '{key}' is corrupt: {detail}")]
    Corrupt { key: String, detail: String },
}

/// One mutation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum CacheOp {
    /// Set a text slot.
    Put { key: String, value: String },
    /// Remove a slot of any shape (absent keys are fine).
    Delete { key: String },
    /// Append to a bounded list slot, evicting from the front at `cap`.
    PushList {
        key: String,
        entry: String,
        cap: usize,
    },
    /// Add a member to a set slot.
    AddMember { key: String, member: String },
}

pub trait CacheTier: Send + Sync {
    fn get_text(&self, key: &str) -> Result<Option<String>, CacheError>;
    /// Full contents of a list slot, oldest first. Missing key yields empty.
    fn list(&self, key: &str) -> Result<Vec<String>, CacheError>;
    /// Members of a set slot in sorted order. Missing key yields empty.
    fn members(&self, key: &str) -> Result<Vec<String>, CacheError>;
    /// Apply a batch atomically: on error, nothing was written.
    fn apply_batch(&self, ops: Vec<CacheOp>) -> Result<(), CacheError>;

    fn put_text(&self, key: &str, value: String) -> Result<(), CacheError> {
        self.apply_batch(vec![CacheOp::Put {
            key: key.to_string(),
            value,
        }])
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.apply_batch(vec![CacheOp::Delete {
            key: key.to_string(),
        }])
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Text(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
}

/// In-process cache tier.
#[derive(Default)]
pub struct MemoryCache {
    slots: RwLock<HashMap<String, Slot>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheTier for MemoryCache {
    fn get_text(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.slots.read().get(key) {
            None => Ok(None),
            Some(Slot::Text(value)) => Ok(Some(value.clone())),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    fn list(&self, key: &str) -> Result<Vec<String>, CacheError> {
        match self.slots.read().get(key) {
            None => Ok(Vec::new()),
            Some(Slot::List(entries)) => Ok(entries.iter().cloned().collect()),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    fn members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        match self.slots.read().get(key) {
            None => Ok(Vec::new()),
            Some(Slot::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    fn apply_batch(&self, ops: Vec<CacheOp>) -> Result<(), CacheError> {
        let mut slots = self.slots.write();

        // Validate every op against current slot shapes before mutating.
        for op in &ops {
            let (key, compatible) = match op {
                CacheOp::Put { key, .. } => (key, matches!(slots.get(key), None | Some(Slot::Text(_)))),
                CacheOp::Delete { key } => (key, true),
                CacheOp::PushList { key, .. } => {
                    (key, matches!(slots.get(key), None | Some(Slot::List(_))))
                }
                CacheOp::AddMember { key, .. } => {
                    (key, matches!(slots.get(key), None | Some(Slot::Set(_))))
                }
            };
            if !compatible {
                return Err(CacheError::WrongType(key.clone()));
            }
        }

        for op in ops {
            match op {
                CacheOp::Put { key, value } => {
                    slots.insert(key, Slot::Text(value));
                }
                CacheOp::Delete { key } => {
                    slots.remove(&key);
                }
                CacheOp::PushList { key, entry, cap } => {
                    let slot = slots
                        .entry(key)
                        .or_insert_with(|| Slot::List(VecDeque::new()));
                    if let Slot::List(entries) = slot {
                        entries.push_back(entry);
                        while entries.len() > cap {
                            entries.pop_front();
                        }
                    }
                }
                CacheOp::AddMember { key, member } => {
                    let slot = slots.entry(key).or_insert_with(|| Slot::Set(BTreeSet::new()));
                    if let Slot::Set(members) = slot {
                        members.insert(member);
                    }
                }
            }
        }
        Ok(())
    }
}
