//! Execution records and the execution state machine.
//!
//! An [`Execution`] is one run of a [`RecoveryPlan`]. It embeds one
//! [`WaveExecutionState`] per plan wave, each of which embeds the per-server
//! launch results reported by the external job service.
//!
//! ## State Machine
//!
//! ```text
//! PENDING ──> POLLING ──> COMPLETED
//!    │          │  ▲
//!    │          ▼  │
//!    └──────> PAUSED
//!
//! FAILED and CANCELLED are reachable from every non-terminal state.
//! ```
//!
//! `PENDING → PAUSED` is taken only when the first wave is gated.
//!
//! ## Invariants
//!
//! - `current_wave` never decreases.
//! - At most one wave is active (`starting` or `running`) at a time.
//! - A wave's job ID is assigned once and is never replaced.
//! - Once terminal, no wave or server state changes.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::{ExecutionId, JobId, ServerId};
use crate::job_client::ServerLaunchReport;
use crate::plan::{RecoveryPlan, WaveDefinition, WaveFailurePolicy};

/// Drill or production failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    /// Non-production test recovery.
    Drill,
    /// Production failover.
    Recovery,
}

impl ExecutionType {
    /// Returns true for drills.
    #[must_use]
    pub const fn is_drill(&self) -> bool {
        matches!(self, Self::Drill)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Drill => "drill",
            Self::Recovery => "recovery",
        }
    }
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl std::str::FromStr for ExecutionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drill" => Ok(Self::Drill),
            "recovery" => Ok(Self::Recovery),
            other => Err(Error::configuration(format!(
                "unknown execution type '{other}' (expected drill or recovery)"
            ))),
        }
    }
}

/// Execution state machine states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created; the first wave has not been handed off yet.
    #[default]
    Pending,
    /// A wave job is in flight (or a deferred wave start is owed).
    Polling,
    /// Waiting at a pause gate for an explicit resume.
    Paused,
    /// Every wave completed.
    Completed,
    /// A wave failed; no further waves run.
    Failed,
    /// Terminated by an operator.
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(
                target,
                Self::Polling | Self::Paused | Self::Failed | Self::Cancelled
            ),
            Self::Polling => matches!(
                target,
                Self::Paused | Self::Completed | Self::Failed | Self::Cancelled
            ),
            Self::Paused => matches!(target, Self::Polling | Self::Failed | Self::Cancelled),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Polling => "polling",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Polling => write!(f, "POLLING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Launch status of one server, in drflow's vocabulary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchStatus {
    /// Not yet launching.
    #[default]
    Pending,
    /// Recovery instance is being launched.
    InProgress,
    /// Recovery instance is up.
    Launched,
    /// Launch failed.
    Failed,
}

impl LaunchStatus {
    /// Maps the external service's per-server status string.
    ///
    /// Unknown values map to [`LaunchStatus::Pending`] so an unrecognised
    /// status never looks like a terminal result.
    #[must_use]
    pub fn from_external(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "NOT_STARTED" | "WAITING" => Self::Pending,
            "IN_PROGRESS" | "STARTED" | "LAUNCHING" => Self::InProgress,
            "LAUNCHED" | "COMPLETED" | "SUCCEEDED" => Self::Launched,
            "FAILED" | "TERMINATED" | "ERROR" => Self::Failed,
            other => {
                tracing::warn!(launch_status = other, "unrecognised external launch status");
                Self::Pending
            }
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Launched => "launched",
            Self::Failed => "failed",
        }
    }
}

/// Per-server state inside a wave. Written only from external job reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    /// The source server.
    pub server_id: ServerId,
    /// Mapped launch status.
    pub launch_status: LaunchStatus,
    /// Recovery instance, once launched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_instance_id: Option<String>,
    /// Failure description, if the launch failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerStatus {
    /// Creates a pending entry for a server about to be recovered.
    #[must_use]
    pub fn pending(server_id: ServerId) -> Self {
        Self {
            server_id,
            launch_status: LaunchStatus::Pending,
            recovery_instance_id: None,
            error: None,
        }
    }

    /// Builds an entry from an external per-server report.
    #[must_use]
    pub fn from_report(report: &ServerLaunchReport) -> Self {
        Self {
            server_id: report.server_id.clone(),
            launch_status: LaunchStatus::from_external(&report.launch_status),
            recovery_instance_id: report.recovery_instance_id.clone(),
            error: report.error.clone(),
        }
    }
}

/// Status of one wave.
///
/// The job ID lives only in the variants that have one, so "running without
/// a job" is unrepresentable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WaveStatus {
    /// No job has been requested.
    #[default]
    NotStarted,
    /// Gated; waiting for an explicit resume.
    Paused,
    /// A caller holds the start claim and is creating the external job.
    Starting {
        /// Identifies the claim holder.
        claim_token: String,
        /// When the claim was taken; stale claims may be taken over.
        claimed_at: DateTime<Utc>,
    },
    /// The external job is in flight.
    Running {
        /// The wave's job.
        job_id: JobId,
    },
    /// The job finished and the wave succeeded.
    Completed {
        /// The wave's job.
        job_id: JobId,
    },
    /// The wave failed.
    Failed {
        /// The wave's job, if one was started.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
        /// Human-readable reason.
        reason: String,
    },
    /// The execution was terminated while this wave was in flight.
    Cancelled {
        /// The wave's job, if one was started.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
    },
}

impl WaveStatus {
    /// Returns the wave's job ID, if one has been assigned.
    #[must_use]
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::Running { job_id } | Self::Completed { job_id } => Some(job_id),
            Self::Failed { job_id, .. } | Self::Cancelled { job_id } => job_id.as_ref(),
            Self::NotStarted | Self::Paused | Self::Starting { .. } => None,
        }
    }

    /// Returns true while a start claim is held or a job is in flight.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Starting { .. } | Self::Running { .. })
    }

    /// Returns true once the wave will not change any further.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Paused => "paused",
            Self::Starting { .. } => "starting",
            Self::Running { .. } => "running",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Per-wave record embedded in an [`Execution`].
///
/// Carries a snapshot of the wave definition taken when the execution was
/// created, so plan edits never affect a run in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveExecutionState {
    /// Ordering key from the plan.
    pub wave_number: u32,
    /// Current wave status.
    pub status: WaveStatus,
    /// When the wave's job was started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the wave finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Servers recovered by this wave.
    #[serde(default)]
    pub servers: Vec<ServerStatus>,
    /// Protection groups recovered by this wave.
    pub protection_group_ids: Vec<String>,
    /// Whether the wave needs an explicit resume before starting.
    #[serde(default)]
    pub pause_before_execution: bool,
    /// Auto-advance delay into this wave.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_time_secs: Option<u64>,
}

impl WaveExecutionState {
    /// Creates a not-started wave from its plan definition.
    #[must_use]
    pub fn from_definition(definition: &WaveDefinition) -> Self {
        Self {
            wave_number: definition.wave_number,
            status: WaveStatus::NotStarted,
            start_time: None,
            end_time: None,
            servers: Vec::new(),
            protection_group_ids: definition.protection_group_ids.clone(),
            pause_before_execution: definition.pause_before_execution,
            wait_time_secs: definition.wait_time_secs,
        }
    }

    /// Returns the wave's job ID, if one has been assigned.
    #[must_use]
    pub fn job_id(&self) -> Option<&JobId> {
        self.status.job_id()
    }

    /// Returns the auto-advance delay (zero when unset).
    #[must_use]
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs.unwrap_or(0))
    }
}

/// A wave start the orchestrator owes, not before a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledWave {
    /// The wave to start.
    pub wave_number: u32,
    /// Earliest start time.
    pub not_before: DateTime<Utc>,
}

impl ScheduledWave {
    /// Returns true if the start may happen at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before
    }
}

/// One run of a recovery plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    /// Unique execution identifier.
    pub execution_id: ExecutionId,
    /// The plan being executed.
    pub plan_id: String,
    /// Drill or recovery.
    pub execution_type: ExecutionType,
    /// Current state.
    pub status: ExecutionStatus,
    /// Index of the most recently started wave, `None` before the first start.
    pub current_wave: Option<usize>,
    /// Number of waves in the plan.
    pub total_waves: usize,
    /// Creation time.
    pub start_time: DateTime<Utc>,
    /// Time the execution reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Who requested the execution.
    pub initiated_by: String,
    /// Wave number currently held at a pause gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_before_wave: Option<u32>,
    /// Reason for a terminal failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// True while the Finder must keep polling this execution.
    pub has_active_drs_jobs: bool,
    /// Deferred wave start owed by the orchestrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_wave: Option<ScheduledWave>,
    /// Last transient polling error. Never terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll_error: Option<String>,
    /// Partial-failure policy in force for this run.
    pub failure_policy: WaveFailurePolicy,
    /// Per-wave state, in plan order.
    pub waves: Vec<WaveExecutionState>,
    /// Optimistic-concurrency version, bumped by every registry write.
    pub version: u64,
    /// Time of the last registry write.
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Creates a `PENDING` execution for a plan.
    ///
    /// The plan's failure policy wins over `default_policy`.
    #[must_use]
    pub fn from_plan(
        plan: &RecoveryPlan,
        execution_type: ExecutionType,
        initiated_by: impl Into<String>,
        default_policy: WaveFailurePolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: ExecutionId::generate(),
            plan_id: plan.plan_id.clone(),
            execution_type,
            status: ExecutionStatus::Pending,
            current_wave: None,
            total_waves: plan.waves.len(),
            start_time: now,
            end_time: None,
            initiated_by: initiated_by.into(),
            paused_before_wave: None,
            error_message: None,
            has_active_drs_jobs: true,
            scheduled_wave: None,
            last_poll_error: None,
            failure_policy: plan.failure_policy.unwrap_or(default_policy),
            waves: plan
                .waves
                .iter()
                .map(WaveExecutionState::from_definition)
                .collect(),
            version: 0,
            updated_at: now,
        }
    }

    /// Returns true if the execution is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transitions to a new state.
    ///
    /// Maintains `end_time` and `has_active_drs_jobs`, and drops any owed
    /// wave start when the execution becomes terminal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the transition is invalid.
    pub fn transition_to(&mut self, target: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: "invalid execution state transition".into(),
            });
        }

        if target.is_terminal() {
            self.end_time = Some(Utc::now());
            self.scheduled_wave = None;
        }
        self.has_active_drs_jobs =
            matches!(target, ExecutionStatus::Pending | ExecutionStatus::Polling);
        self.status = target;
        Ok(())
    }

    /// Fails the execution with a human-readable reason.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the execution is terminal.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition_to(ExecutionStatus::Failed)?;
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// Returns the index of a wave in plan order.
    #[must_use]
    pub fn wave_index(&self, wave_number: u32) -> Option<usize> {
        self.waves.iter().position(|w| w.wave_number == wave_number)
    }

    /// Returns the state of a wave.
    #[must_use]
    pub fn wave(&self, wave_number: u32) -> Option<&WaveExecutionState> {
        self.waves.iter().find(|w| w.wave_number == wave_number)
    }

    /// Returns the mutable state of a wave.
    pub fn wave_mut(&mut self, wave_number: u32) -> Option<&mut WaveExecutionState> {
        self.waves.iter_mut().find(|w| w.wave_number == wave_number)
    }

    /// Returns the state of a wave or a [`Error::WaveNotFound`] error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WaveNotFound`] if the wave is not part of the execution.
    pub fn require_wave_mut(&mut self, wave_number: u32) -> Result<&mut WaveExecutionState> {
        let execution_id = self.execution_id;
        self.wave_mut(wave_number).ok_or(Error::WaveNotFound {
            execution_id,
            wave_number,
        })
    }

    /// Returns the first wave in plan order.
    #[must_use]
    pub fn first_wave(&self) -> Option<&WaveExecutionState> {
        self.waves.first()
    }

    /// Returns the wave that follows `wave_number` in plan order.
    #[must_use]
    pub fn wave_after(&self, wave_number: u32) -> Option<&WaveExecutionState> {
        let index = self.wave_index(wave_number)?;
        self.waves.get(index + 1)
    }

    /// Returns the wave whose job is in flight.
    #[must_use]
    pub fn running_wave(&self) -> Option<&WaveExecutionState> {
        self.waves
            .iter()
            .find(|w| matches!(w.status, WaveStatus::Running { .. }))
    }

    /// Returns the wave holding a start claim or running a job.
    #[must_use]
    pub fn active_wave(&self) -> Option<&WaveExecutionState> {
        self.waves.iter().find(|w| w.status.is_active())
    }

    /// Advances `current_wave` to the wave at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if `index` is behind the current wave.
    pub fn advance_current_wave(&mut self, index: usize) -> Result<()> {
        if let Some(current) = self.current_wave {
            if index < current {
                return Err(Error::invalid_state(
                    self.execution_id,
                    format!("current wave cannot move backwards ({current} -> {index})"),
                ));
            }
        }
        self.current_wave = Some(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> RecoveryPlan {
        RecoveryPlan::builder("plan-1")
            .wave(WaveDefinition::new(1, ["pg-1"]))
            .wave(WaveDefinition::new(2, ["pg-2"]).paused())
            .build()
            .unwrap()
    }

    fn execution() -> Execution {
        Execution::from_plan(
            &plan(),
            ExecutionType::Drill,
            "alice",
            WaveFailurePolicy::AnyLaunched,
        )
    }

    #[test]
    fn new_execution_is_pending_and_pollable() {
        let exec = execution();
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert!(exec.has_active_drs_jobs);
        assert_eq!(exec.total_waves, 2);
        assert!(exec.current_wave.is_none());
        assert!(exec.wave(2).is_some_and(|w| w.pause_before_execution));
    }

    #[test]
    fn status_transitions_follow_state_machine() {
        use ExecutionStatus::*;

        assert!(Pending.can_transition_to(Polling));
        assert!(Pending.can_transition_to(Paused));
        assert!(Polling.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Polling));
        assert!(Polling.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Completed));

        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for target in [Pending, Polling, Paused, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn terminal_transition_clears_polling_flag() {
        let mut exec = execution();
        exec.transition_to(ExecutionStatus::Polling).unwrap();
        exec.scheduled_wave = Some(ScheduledWave {
            wave_number: 2,
            not_before: Utc::now(),
        });
        exec.fail("wave 1 failed: boom").unwrap();

        assert!(!exec.has_active_drs_jobs);
        assert!(exec.end_time.is_some());
        assert!(exec.scheduled_wave.is_none());
        assert!(matches!(
            exec.transition_to(ExecutionStatus::Polling),
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn paused_is_not_polled() {
        let mut exec = execution();
        exec.transition_to(ExecutionStatus::Paused).unwrap();
        assert!(!exec.has_active_drs_jobs);
        exec.transition_to(ExecutionStatus::Polling).unwrap();
        assert!(exec.has_active_drs_jobs);
    }

    #[test]
    fn current_wave_never_decreases() {
        let mut exec = execution();
        exec.advance_current_wave(1).unwrap();
        assert!(exec.advance_current_wave(0).is_err());
        exec.advance_current_wave(1).unwrap();
        assert_eq!(exec.current_wave, Some(1));
    }

    #[test]
    fn launch_status_maps_external_vocabulary() {
        assert_eq!(LaunchStatus::from_external("LAUNCHED"), LaunchStatus::Launched);
        assert_eq!(LaunchStatus::from_external("succeeded"), LaunchStatus::Launched);
        assert_eq!(LaunchStatus::from_external("IN_PROGRESS"), LaunchStatus::InProgress);
        assert_eq!(LaunchStatus::from_external("TERMINATED"), LaunchStatus::Failed);
        assert_eq!(LaunchStatus::from_external("WAITING"), LaunchStatus::Pending);
        assert_eq!(LaunchStatus::from_external("MYSTERY"), LaunchStatus::Pending);
    }

    #[test]
    fn wave_status_serializes_as_tagged_variant() {
        let status = WaveStatus::Running {
            job_id: JobId::new("drsjob-1"),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["jobId"], "drsjob-1");

        let failed: WaveStatus =
            serde_json::from_str(r#"{"state":"failed","reason":"no servers"}"#).unwrap();
        assert!(failed.job_id().is_none());
        assert!(failed.is_finished());
    }

    #[test]
    fn execution_round_trips_through_json() {
        let mut exec = execution();
        exec.waves[0].status = WaveStatus::Running {
            job_id: JobId::new("drsjob-7"),
        };
        let json = serde_json::to_string(&exec).unwrap();
        assert!(json.contains("\"hasActiveDrsJobs\":true"));
        let back: Execution = serde_json::from_str(&json).unwrap();
        assert_eq!(back, exec);
        assert_eq!(
            back.running_wave().and_then(WaveExecutionState::job_id),
            Some(&JobId::new("drsjob-7"))
        );
    }
}
