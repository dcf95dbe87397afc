use serde::{Deserialize, Serialize};
use std::fmt;

use super::Payload;

/// How a single conflict gets settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    UseLocal,
    UseServer,
    Merge,
    Manual,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictStrategy::UseLocal => "use_local",
            ConflictStrategy::UseServer => "use_server",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Result of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ConflictStrategy,
    /// Record that should end up on both sides. `None` for manual resolution.
    pub payload: Option<Payload>,
}

impl ConflictResolution {
    pub fn use_local(local: Payload) -> Self {
        Self {
            strategy: ConflictStrategy::UseLocal,
            payload: Some(local),
        }
    }

    pub fn use_server(remote: Payload) -> Self {
        Self {
            strategy: ConflictStrategy::UseServer,
            payload: Some(remote),
        }
    }

    pub fn merge(merged: Payload) -> Self {
        Self {
            strategy: ConflictStrategy::Merge,
            payload: Some(merged),
        }
    }

    pub fn manual() -> Self {
        Self {
            strategy: ConflictStrategy::Manual,
            payload: None,
        }
    }
}
