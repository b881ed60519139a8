//! Error types for the orchestration domain.
//!
//! The variants mirror how callers must react:
//!
//! - [`Error::Conflict`] and [`Error::InvalidState`] are caller mistakes or
//!   races the caller must see; they are never retried silently.
//! - [`Error::ExternalService`] is transient from the orchestrator's point of
//!   view: the next Finder sweep re-queries the durable external job.
//! - [`Error::RegistryConflict`] is raised only after the re-read/retry loop
//!   gave up; stale writes are never forced through.

use drflow_core::ExecutionId;

use crate::ids::ServerId;

/// The result type used throughout drflow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A server is already committed to another active wave of the same execution.
    #[error(
        "wave {wave_number} conflicts with active wave {active_wave}: servers {server_ids:?} are already being recovered"
    )]
    Conflict {
        /// The wave that was asked to start.
        wave_number: u32,
        /// The wave whose active job already references the servers.
        active_wave: u32,
        /// The overlapping servers.
        server_ids: Vec<ServerId>,
    },

    /// The operation is not permitted in the execution's current state.
    #[error("invalid state for execution {execution_id}: {message}")]
    InvalidState {
        /// The execution the operation targeted.
        execution_id: ExecutionId,
        /// What made the state unsuitable.
        message: String,
    },

    /// A state machine transition was rejected.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A call to an external collaborator failed or timed out.
    #[error("external service error during {operation}: {message}")]
    ExternalService {
        /// The external operation (e.g. `start_job`).
        operation: String,
        /// Description of the failure.
        message: String,
    },

    /// An optimistic-concurrency write kept losing races.
    #[error("registry conflict on execution {execution_id} after {attempts} attempts")]
    RegistryConflict {
        /// The contended execution.
        execution_id: ExecutionId,
        /// How many read-modify-write attempts were made.
        attempts: u32,
    },

    /// An execution was not found.
    #[error("execution not found: {execution_id}")]
    ExecutionNotFound {
        /// The execution ID that was not found.
        execution_id: ExecutionId,
    },

    /// An execution already exists with this ID.
    #[error("execution already exists: {execution_id}")]
    ExecutionExists {
        /// The duplicated execution ID.
        execution_id: ExecutionId,
    },

    /// A recovery plan was not found.
    #[error("recovery plan not found: {plan_id}")]
    PlanNotFound {
        /// The plan ID that was not found.
        plan_id: String,
    },

    /// A wave number is not part of the execution.
    #[error("wave {wave_number} not found in execution {execution_id}")]
    WaveNotFound {
        /// The execution that was searched.
        execution_id: ExecutionId,
        /// The missing wave number.
        wave_number: u32,
    },

    /// A recovery plan failed validation.
    #[error("invalid recovery plan {plan_id}: {message}")]
    InvalidPlan {
        /// The rejected plan.
        plan_id: String,
        /// Description of the problem.
        message: String,
    },

    /// Another caller holds a live start claim on the wave and did not finish in time.
    #[error("wave {wave_number} of execution {execution_id} is still being started by another caller")]
    StartInProgress {
        /// The execution being started.
        execution_id: ExecutionId,
        /// The claimed wave.
        wave_number: u32,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Configuration was missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from drflow-core.
    #[error("core error: {0}")]
    Core(#[from] drflow_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new invalid-state error.
    #[must_use]
    pub fn invalid_state(execution_id: ExecutionId, message: impl Into<String>) -> Self {
        Self::InvalidState {
            execution_id,
            message: message.into(),
        }
    }

    /// Creates a new external service error.
    #[must_use]
    pub fn external(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalService {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Returns true if a later sweep may succeed without any caller action.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ExternalService { .. }
                | Self::RegistryConflict { .. }
                | Self::StartInProgress { .. }
        )
    }
}
