//! The Suzuki-Kasami token.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;

/// The mobile structure whose possession confers the right to enter the
/// critical section. Exactly one exists per resource; it travels inside
/// `Propagate` envelopes as an archive (see [`crate::codec`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    /// Highest request number already granted per agent (`LN` in the
    /// literature).
    pub last_request_number: BTreeMap<AgentId, u64>,
    /// Agents waiting for the token, in grant order.
    pub queue: VecDeque<AgentId>,
}

impl Token {
    /// `LN[agent]`, defaulting to 0 for agents never granted.
    #[must_use]
    pub fn last_granted(&self, agent: &AgentId) -> u64 {
        self.last_request_number.get(agent).copied().unwrap_or(0)
    }
}
