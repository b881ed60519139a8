//! Execution registry over object storage.
//!
//! Each execution is one JSON document at `executions/{execution_id}.json`.
//! The document embeds the execution's logical `version`; the storage
//! backend's own version token guards the conditional write, so two writers
//! that read the same logical version cannot both succeed.

use async_trait::async_trait;
use bytes::Bytes;

use drflow_core::{StorageBackend, WritePrecondition, WriteResult};

use super::{CasResult, ExecutionRegistry};
use crate::error::{Error, Result};
use crate::execution::{Execution, ExecutionStatus};
use crate::ids::ExecutionId;

const PREFIX: &str = "executions/";

fn execution_path(execution_id: &ExecutionId) -> String {
    format!("{PREFIX}{execution_id}.json")
}

fn encode(execution: &Execution) -> Result<Bytes> {
    serde_json::to_vec(execution)
        .map(Bytes::from)
        .map_err(|e| Error::serialization(format!("failed to encode execution: {e}")))
}

fn decode(path: &str, data: &[u8]) -> Result<Execution> {
    serde_json::from_slice(data)
        .map_err(|e| Error::serialization(format!("failed to decode {path}: {e}")))
}

/// [`ExecutionRegistry`] backed by any [`StorageBackend`].
#[derive(Debug, Clone)]
pub struct StorageRegistry<B> {
    backend: B,
}

impl<B: StorageBackend> StorageRegistry<B> {
    /// Creates a registry over `backend`.
    #[must_use]
    pub const fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Returns the underlying backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    async fn read(&self, path: &str) -> Result<Option<Execution>> {
        match self.backend.get(path).await {
            Ok(data) => decode(path, &data).map(Some),
            Err(drflow_core::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<B: StorageBackend> ExecutionRegistry for StorageRegistry<B> {
    async fn create(&self, execution: &Execution) -> Result<()> {
        let path = execution_path(&execution.execution_id);
        let result = self
            .backend
            .put(&path, encode(execution)?, WritePrecondition::DoesNotExist)
            .await?;
        match result {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => Err(Error::ExecutionExists {
                execution_id: execution.execution_id,
            }),
        }
    }

    async fn get(&self, execution_id: &ExecutionId) -> Result<Option<Execution>> {
        self.read(&execution_path(execution_id)).await
    }

    async fn update(&self, execution: &Execution) -> Result<CasResult> {
        let path = execution_path(&execution.execution_id);
        let Some(meta) = self.backend.head(&path).await? else {
            return Ok(CasResult::NotFound);
        };
        // Read after head: if the object moved on in between, the stale token
        // below makes the conditional write fail.
        let Some(stored) = self.read(&path).await? else {
            return Ok(CasResult::NotFound);
        };
        if stored.version != execution.version {
            return Ok(CasResult::VersionConflict {
                actual: stored.version,
            });
        }

        let version = execution.version + 1;
        let mut next = execution.clone();
        next.version = version;
        let result = self
            .backend
            .put(
                &path,
                encode(&next)?,
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await?;

        match result {
            WriteResult::Success { .. } => Ok(CasResult::Success { version }),
            WriteResult::PreconditionFailed { .. } => match self.read(&path).await? {
                Some(current) => Ok(CasResult::VersionConflict {
                    actual: current.version,
                }),
                None => Ok(CasResult::NotFound),
            },
        }
    }

    async fn list_by_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<Execution>> {
        let mut objects = self.backend.list(PREFIX).await?;
        objects.sort_by(|a, b| a.path.cmp(&b.path));

        let mut matching = Vec::new();
        for object in objects {
            if !object.path.ends_with(".json") {
                continue;
            }
            if let Some(execution) = self.read(&object.path).await? {
                if statuses.contains(&execution.status) {
                    matching.push(execution);
                }
            }
        }
        Ok(matching)
    }
}
