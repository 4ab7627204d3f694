//! State update commands.
//!
//! Logic modules never touch `WorldState` directly; they emit
//! [`StateUpdateCommand`]s that the state store applies as one atomic batch.
//! Paths are dot-separated field paths into the world's JSON form
//! (`households.000.cash`, `bank.loans.001`, `macro.gdp`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("path '{0}' does not resolve to an existing field")]
    PathNotFound(String),

    #[error("path '{0}' is not numeric; delta requires a numeric leaf")]
    NotNumeric(String),

    #[error("path '{0}' traverses a non-object value")]
    NotAnObject(String),
}

/// A single mutation of one world-state leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateUpdateCommand {
    /// Overwrite a leaf. The final path segment may be created (used for
    /// inserting new map entries such as `bank.loans.{id}`); every parent
    /// segment must already exist.
    Assign { path: String, value: Value },
    /// Atomic numeric increment of an existing leaf.
    Delta { path: String, amount: f64 },
}

impl StateUpdateCommand {
    pub fn assign(path: impl Into<String>, value: impl Into<Value>) -> Self {
        StateUpdateCommand::Assign {
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn delta(path: impl Into<String>, amount: f64) -> Self {
        StateUpdateCommand::Delta {
            path: path.into(),
            amount,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            StateUpdateCommand::Assign { path, .. } => path,
            StateUpdateCommand::Delta { path, .. } => path,
        }
    }
}

/// Apply a batch of commands to a world's JSON form, in order.
///
/// The caller is responsible for all-or-nothing semantics: apply against a
/// scratch copy and only commit the copy on success.
pub fn apply_commands(world: &mut Value, commands: &[StateUpdateCommand]) -> Result<(), CommandError> {
    for command in commands {
        match command {
            StateUpdateCommand::Assign { path, value } => {
                let (parent, leaf) = navigate_parent(world, path)?;
                parent.insert(leaf.to_string(), value.clone());
            }
            StateUpdateCommand::Delta { path, amount } => {
                let (parent, leaf) = navigate_parent(world, path)?;
                let slot = parent
                    .get_mut(&leaf)
                    .ok_or_else(|| CommandError::PathNotFound(path.clone()))?;
                let current = slot
                    .as_f64()
                    .ok_or_else(|| CommandError::NotNumeric(path.clone()))?;
                *slot = json_number(current + amount);
            }
        }
    }
    Ok(())
}

/// Walk to the object containing the final path segment.
fn navigate_parent<'a>(
    world: &'a mut Value,
    path: &str,
) -> Result<(&'a mut serde_json::Map<String, Value>, String), CommandError> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments
        .pop()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CommandError::PathNotFound(path.to_string()))?;

    let mut cursor = world;
    for segment in segments {
        cursor = cursor
            .as_object_mut()
            .ok_or_else(|| CommandError::NotAnObject(path.to_string()))?
            .get_mut(segment)
            .ok_or_else(|| CommandError::PathNotFound(path.to_string()))?;
    }
    let parent = cursor
        .as_object_mut()
        .ok_or_else(|| CommandError::NotAnObject(path.to_string()))?;
    Ok((parent, leaf.to_string()))
}

fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
