//! # drflow
//!
//! Wave-based disaster-recovery orchestration over an external replication
//! service that only offers a poll-based job API.
//!
//! A declarative [`plan::RecoveryPlan`] (ordered waves of protection groups)
//! becomes a sequenced, resumable, partially-failable [`execution::Execution`]:
//!
//! - **Wave Scheduler**: the execution state machine, pause gates, and the
//!   partial-failure policy
//! - **Job Initiator**: one external job per wave, even under duplicate or
//!   concurrent start calls
//! - **Execution Finder / Poller**: a periodic sweep that stands in for
//!   completion callbacks
//! - **Control Surface**: start, pause, resume, and terminate
//!
//! ## Guarantees
//!
//! - **Monotonic**: an execution's current wave never moves backwards
//! - **Idempotent starts**: a wave's job ID is assigned once
//! - **Gated**: a wave with `pauseBeforeExecution` never starts without a resume
//! - **Final**: terminal executions are never written to again
//!
//! All of these rest on one mechanism: every registry write is a
//! compare-and-swap on the execution's version.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use drflow::prelude::*;
//!
//! # async fn demo() -> drflow::Result<()> {
//! let plans = InMemoryPlanSource::from_plans([RecoveryPlan::builder("web-tier")
//!     .wave(WaveDefinition::new(1, ["pg-db"]))
//!     .wave(WaveDefinition::new(2, ["pg-app"]).paused())
//!     .build()?])?;
//!
//! let ctx = OrchestratorContext::new(
//!     Arc::new(InMemoryRegistry::new()),
//!     Arc::new(StaticServerResolver::new()),
//!     Arc::new(InMemoryJobClient::new()),
//!     Arc::new(plans),
//! );
//!
//! let control = ControlSurface::new(ctx.clone());
//! let execution_id = control
//!     .start_execution("web-tier", ExecutionType::Drill, "ops@example.com")
//!     .await?;
//!
//! // Periodic trigger.
//! ExecutionFinder::new(ctx).sweep().await?;
//! let execution = control.get_execution(&execution_id).await?;
//! println!("{}", execution.status);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod execution;
pub mod finder;
pub mod ids;
pub mod initiator;
pub mod job_client;
pub mod metrics;
pub mod plan;
pub mod poller;
pub mod registry;
pub mod resolver;
pub mod scheduler;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::OrchestratorConfig;
    pub use crate::context::OrchestratorContext;
    pub use crate::control::{ControlSurface, PauseAck, Termination};
    pub use crate::error::{Error, Result};
    pub use crate::execution::{
        Execution, ExecutionStatus, ExecutionType, LaunchStatus, ServerStatus,
        WaveExecutionState, WaveStatus,
    };
    pub use crate::finder::{ExecutionFinder, SweepSummary};
    pub use crate::ids::{ExecutionId, JobId, ServerId};
    pub use crate::initiator::{JobInitiator, WaveStart};
    pub use crate::job_client::memory::InMemoryJobClient;
    pub use crate::job_client::{JobSnapshot, JobStatus, RecoveryJobClient};
    pub use crate::metrics::DrMetrics;
    pub use crate::plan::{
        InMemoryPlanSource, PlanSource, RecoveryPlan, WaveDefinition, WaveFailurePolicy,
    };
    pub use crate::poller::{ExecutionPoller, PollOutcome};
    pub use crate::registry::{CasResult, ExecutionRegistry, InMemoryRegistry};
    pub use crate::resolver::{ServerResolver, StaticServerResolver};
    pub use crate::scheduler::{Advance, Handoff, WaveScheduler};
}

pub use error::{Error, Result};
