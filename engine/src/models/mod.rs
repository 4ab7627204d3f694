//! Domain types: world state, decisions, update commands, tick logs.
//!
//! # Critical Invariants
//!
//! 1. World state is mutated only through `StateUpdateCommand` batches
//!    applied by the state store; everything else reads snapshots.
//! 2. All keyed collections are `BTreeMap`s so iteration order (and thus
//!    every clearing pass) is deterministic.
//! 3. `household.employer_id` is the single source of truth for employment;
//!    the employer-side rosters are co-updated in the same command batch and
//!    verified by the post-apply invariant check.

pub mod command;
pub mod decisions;
pub mod log;
pub mod world;

pub use command::{apply_commands, CommandError, StateUpdateCommand};
pub use decisions::{
    BankDecision, BankDecisionOverride, CentralBankDecision, CentralBankDecisionOverride,
    FirmDecision, FirmDecisionOverride, GovernmentDecision, GovernmentDecisionOverride,
    HouseholdDecision, HouseholdDecisionOverride, Provenance, TickDecisionOverrides,
    TickDecisions,
};
pub use log::TickLogEntry;
pub use world::{
    BankState, CentralBankState, EmploymentStatus, FirmState, GovernmentState, HouseholdState,
    MacroStats, WorldState, FIRM_ID, GOVERNMENT_ID,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The five agent roles a script can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Household,
    Firm,
    Bank,
    CentralBank,
    Government,
}

impl AgentKind {
    /// The four roles that exist exactly once per simulation.
    pub const SINGLETONS: [AgentKind; 4] = [
        AgentKind::Firm,
        AgentKind::Bank,
        AgentKind::CentralBank,
        AgentKind::Government,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Household => "household",
            AgentKind::Firm => "firm",
            AgentKind::Bank => "bank",
            AgentKind::CentralBank => "central_bank",
            AgentKind::Government => "government",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "household" => Some(AgentKind::Household),
            "firm" => Some(AgentKind::Firm),
            "bank" => Some(AgentKind::Bank),
            "central_bank" => Some(AgentKind::CentralBank),
            "government" => Some(AgentKind::Government),
            _ => None,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_kind_round_trips_through_str() {
        for kind in [
            AgentKind::Household,
            AgentKind::Firm,
            AgentKind::Bank,
            AgentKind::CentralBank,
            AgentKind::Government,
        ] {
            assert_eq!(AgentKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(AgentKind::parse("treasury"), None);
    }
}
