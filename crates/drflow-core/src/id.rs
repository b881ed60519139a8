//! Strongly-typed identifiers for drflow entities.
//!
//! Execution identifiers are ULIDs: lexicographically sortable by creation
//! time and globally unique without coordination, so two orchestrator
//! processes can create executions concurrently without a shared counter.
//!
//! # Example
//!
//! ```rust
//! use drflow_core::id::ExecutionId;
//!
//! let id = ExecutionId::generate();
//! let parsed: ExecutionId = id.to_string().parse().unwrap();
//! assert_eq!(id, parsed);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for one run of a recovery plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Ulid);

impl ExecutionId {
    /// Generates a new unique execution ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid execution ID '{s}': {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_id_roundtrip() {
        let id = ExecutionId::generate();
        let parsed: ExecutionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(ExecutionId::generate(), ExecutionId::generate());
    }

    #[test]
    fn invalid_id_returns_error() {
        let result: Result<ExecutionId> = "not-a-valid-ulid".parse();
        assert!(matches!(result, Err(Error::InvalidId { .. })));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ExecutionId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
