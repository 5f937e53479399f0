//! Per-resource lock state as observed by the host.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The lock state of a single resource, per agent.
///
/// `Unreachable` is terminal: once failure analysis marks a resource
/// unreachable there is no transition out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockState {
    #[default]
    NotInterested,
    Interested,
    Locked,
    Unreachable,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockState::NotInterested => "not-interested",
            LockState::Interested => "interested",
            LockState::Locked => "locked",
            LockState::Unreachable => "unreachable",
        };
        f.write_str(name)
    }
}
