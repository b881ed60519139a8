//! Durable storage for execution records.
//!
//! The registry is a pure persistence contract; no business logic lives here.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: every update names the version it read; a stale
//!   version is rejected with [`CasResult::VersionConflict`]
//! - **Never force-overwrite**: callers resolve conflicts by re-reading and
//!   either retrying the same logical operation or discarding it as redundant
//!   (see [`update_with_retry`])
//! - **No deletes**: terminal records stay for audit and history

pub mod memory;
pub mod storage;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Error, Result};
use crate::execution::{Execution, ExecutionStatus};
use crate::ids::ExecutionId;
use crate::metrics::DrMetrics;

pub use memory::InMemoryRegistry;
pub use storage::StorageRegistry;

/// Result of a compare-and-swap update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    /// The write was applied.
    Success {
        /// The version now stored.
        version: u64,
    },
    /// No execution with that ID exists.
    NotFound,
    /// The stored version differs from the caller's.
    VersionConflict {
        /// The version actually stored.
        actual: u64,
    },
}

impl CasResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Storage abstraction for execution records.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync`; the Finder, the Poller, and the control
/// surface call them concurrently for the same execution.
#[async_trait]
pub trait ExecutionRegistry: Send + Sync {
    /// Stores a new execution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutionExists`] if the ID is already taken.
    async fn create(&self, execution: &Execution) -> Result<()>;

    /// Gets an execution by ID.
    ///
    /// Returns `None` if the execution does not exist.
    async fn get(&self, execution_id: &ExecutionId) -> Result<Option<Execution>>;

    /// Replaces an execution if its stored version equals `execution.version`.
    ///
    /// On success the stored version is `execution.version + 1`.
    async fn update(&self, execution: &Execution) -> Result<CasResult>;

    /// Lists executions whose status is one of `statuses`.
    async fn list_by_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<Execution>>;
}

/// What a read-modify-write closure decided.
#[derive(Debug)]
pub enum Mutation<T> {
    /// Persist the modified execution.
    Apply(T),
    /// Nothing to write; the stored state already reflects the operation.
    Skip(T),
}

/// Runs a read-modify-write cycle under optimistic concurrency.
///
/// Each attempt reads the latest execution, hands a copy to `mutate`, and
/// writes it back with a version check. A lost race re-reads and calls
/// `mutate` again with fresh state, so the closure must derive everything it
/// writes from the execution it is given.
///
/// Returns the execution as stored after the attempt (the unmodified read on
/// [`Mutation::Skip`]) together with the closure's value.
///
/// # Errors
///
/// - [`Error::ExecutionNotFound`] if the execution does not exist
/// - [`Error::RegistryConflict`] if every attempt lost its race
/// - any error returned by `mutate`, which aborts without writing
pub async fn update_with_retry<T, F>(
    registry: &dyn ExecutionRegistry,
    execution_id: &ExecutionId,
    attempts: u32,
    mut mutate: F,
) -> Result<(Execution, T)>
where
    F: FnMut(&mut Execution) -> Result<Mutation<T>> + Send,
    T: Send,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        let current = registry
            .get(execution_id)
            .await?
            .ok_or(Error::ExecutionNotFound {
                execution_id: *execution_id,
            })?;

        let mut draft = current.clone();
        let value = match mutate(&mut draft)? {
            Mutation::Skip(value) => return Ok((current, value)),
            Mutation::Apply(value) => value,
        };
        draft.updated_at = Utc::now();

        match registry.update(&draft).await? {
            CasResult::Success { version } => {
                draft.version = version;
                return Ok((draft, value));
            }
            CasResult::NotFound => {
                return Err(Error::ExecutionNotFound {
                    execution_id: *execution_id,
                });
            }
            CasResult::VersionConflict { actual } => {
                DrMetrics::new().record_registry_conflict();
                tracing::debug!(
                    execution_id = %execution_id,
                    expected = current.version,
                    actual,
                    attempt,
                    "registry write lost the race; re-reading"
                );
            }
        }
    }

    Err(Error::RegistryConflict {
        execution_id: *execution_id,
        attempts,
    })
}
