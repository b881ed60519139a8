//! # drflow-core
//!
//! Core abstractions shared by the drflow disaster-recovery orchestrator.
//!
//! This crate provides the foundational types and traits used across drflow components:
//!
//! - **Identifiers**: Strongly-typed, sortable execution IDs
//! - **Storage Traits**: Conditional-write object storage contract and its
//!   in-memory and `object_store` backends
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use drflow_core::prelude::*;
//!
//! let execution_id = ExecutionId::generate();
//! assert_eq!(execution_id.to_string().len(), 26);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::ExecutionId;
    pub use crate::observability::{LogFormat, init_logging};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend, WritePrecondition,
        WriteResult,
    };
}

pub use error::{Error, Result};
pub use id::ExecutionId;
pub use observability::{LogFormat, execution_span, init_logging};
pub use storage::{
    MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend, WritePrecondition, WriteResult,
};
