//! In-memory execution registry for testing and single-process deployments.
//!
//! ## Limitations
//!
//! - **No durability**: all executions are lost when the process exits
//! - **Single-process only**: state is not shared across process boundaries

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{CasResult, ExecutionRegistry};
use crate::error::{Error, Result};
use crate::execution::{Execution, ExecutionStatus};
use crate::ids::ExecutionId;

/// Thread-safe in-memory [`ExecutionRegistry`].
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    executions: RwLock<HashMap<ExecutionId, Execution>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored executions.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn execution_count(&self) -> Result<usize> {
        Ok(self.executions.read().map_err(poison_err)?.len())
    }
}

#[async_trait]
impl ExecutionRegistry for InMemoryRegistry {
    async fn create(&self, execution: &Execution) -> Result<()> {
        let mut executions = self.executions.write().map_err(poison_err)?;
        if executions.contains_key(&execution.execution_id) {
            return Err(Error::ExecutionExists {
                execution_id: execution.execution_id,
            });
        }
        executions.insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn get(&self, execution_id: &ExecutionId) -> Result<Option<Execution>> {
        let executions = self.executions.read().map_err(poison_err)?;
        Ok(executions.get(execution_id).cloned())
    }

    async fn update(&self, execution: &Execution) -> Result<CasResult> {
        let mut executions = self.executions.write().map_err(poison_err)?;
        let Some(stored) = executions.get_mut(&execution.execution_id) else {
            return Ok(CasResult::NotFound);
        };
        if stored.version != execution.version {
            return Ok(CasResult::VersionConflict {
                actual: stored.version,
            });
        }

        let version = execution.version + 1;
        *stored = execution.clone();
        stored.version = version;
        Ok(CasResult::Success { version })
    }

    async fn list_by_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<Execution>> {
        let executions = self.executions.read().map_err(poison_err)?;
        let mut matching: Vec<Execution> = executions
            .values()
            .filter(|e| statuses.contains(&e.status))
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.execution_id);
        Ok(matching)
    }
}
