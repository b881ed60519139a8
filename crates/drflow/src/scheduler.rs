//! Wave Scheduler: owns the per-execution wave sequence.
//!
//! The scheduler decides what happens after a wave's external job reaches a
//! terminal state:
//!
//! | Job result | Next wave | Outcome |
//! |------------|-----------|---------|
//! | success | none | execution → `COMPLETED` |
//! | success | gated | execution → `PAUSED`, `paused_before_wave` set, no job started |
//! | success | ungated | next start scheduled after its wait time; execution stays `POLLING` |
//! | failure | - | wave `failed`, execution → `FAILED` with a reason |
//!
//! "Success" is decided by the execution's [`WaveFailurePolicy`]: a job that
//! terminally errored always fails the wave; a completed job fails it when
//! the policy's launch threshold is not met.
//!
//! The decision and the final per-server results are persisted in a single
//! registry write, so no reader ever sees servers finished while the wave
//! has not advanced.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::context::OrchestratorContext;
use crate::error::{Error, Result};
use crate::execution::{
    Execution, ExecutionStatus, LaunchStatus, ScheduledWave, ServerStatus, WaveExecutionState,
    WaveStatus,
};
use crate::ids::{ExecutionId, ServerId};
use crate::initiator::{JobInitiator, WaveStart};
use crate::job_client::{JobSnapshot, JobStatus, ServerLaunchReport};
use crate::plan::WaveFailurePolicy;
use crate::registry::Mutation;

/// What the scheduler decided after a wave's job finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The final wave succeeded.
    Completed,
    /// The next wave is gated; waiting for resume.
    Paused {
        /// The gated wave.
        before_wave: u32,
    },
    /// The next wave's start is owed.
    StartNext {
        /// The wave to start.
        wave_number: u32,
        /// Earliest start time (now plus the wave's wait time).
        not_before: DateTime<Utc>,
    },
    /// The wave failed and the execution with it.
    Failed {
        /// Human-readable reason.
        reason: String,
    },
}

impl Advance {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Paused { .. } => "paused",
            Self::StartNext { .. } => "start_next",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Result of [`WaveScheduler::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// The first wave's job is running.
    Started(WaveStart),
    /// The first wave is gated; the execution is `PAUSED`.
    Gated {
        /// The gated first wave.
        wave_number: u32,
    },
    /// The execution had already left `PENDING`.
    AlreadyBegun,
}

/// Merges external per-server reports into a wave's server list.
///
/// Servers absent from the report keep their last known status; servers the
/// service reports but the wave never listed are appended. Returns true if
/// anything changed.
pub fn reconcile_servers(wave: &mut WaveExecutionState, reports: &[ServerLaunchReport]) -> bool {
    let mut by_server: HashMap<&ServerId, &ServerLaunchReport> =
        reports.iter().map(|r| (&r.server_id, r)).collect();

    let mut changed = false;
    for server in &mut wave.servers {
        if let Some(report) = by_server.remove(&server.server_id) {
            let updated = ServerStatus::from_report(report);
            if *server != updated {
                *server = updated;
                changed = true;
            }
        }
    }
    for report in reports {
        if by_server.remove(&report.server_id).is_some() {
            wave.servers.push(ServerStatus::from_report(report));
            changed = true;
        }
    }
    changed
}

fn judge_wave(
    policy: WaveFailurePolicy,
    servers: &[ServerStatus],
    snapshot: &JobSnapshot,
) -> std::result::Result<(), String> {
    if snapshot.status == JobStatus::Failed {
        return Err(snapshot
            .error
            .clone()
            .unwrap_or_else(|| format!("job {} failed", snapshot.job_id)));
    }

    let total = servers.len();
    let launched = servers
        .iter()
        .filter(|s| s.launch_status == LaunchStatus::Launched)
        .count();
    if launched == 0 {
        return Err(format!("all {total} servers failed to launch"));
    }
    if policy == WaveFailurePolicy::AllLaunched && launched < total {
        return Err(format!(
            "{} of {total} servers failed to launch",
            total - launched
        ));
    }
    Ok(())
}

/// Applies a terminal job result to the running wave and decides what follows.
///
/// Mutates `execution` in place; the caller persists it.
///
/// # Errors
///
/// Returns [`Error::InvalidState`] if the wave is not running the snapshot's
/// job, or a transition error if the execution is terminal.
pub fn apply_job_result(
    execution: &mut Execution,
    wave_number: u32,
    snapshot: &JobSnapshot,
    now: DateTime<Utc>,
) -> Result<Advance> {
    let execution_id = execution.execution_id;
    let policy = execution.failure_policy;
    let wave = execution.require_wave_mut(wave_number)?;
    let job_id = match &wave.status {
        WaveStatus::Running { job_id } if *job_id == snapshot.job_id => job_id.clone(),
        other => {
            return Err(Error::invalid_state(
                execution_id,
                format!(
                    "wave {wave_number} is {} and not running job {}",
                    other.label(),
                    snapshot.job_id
                ),
            ));
        }
    };

    reconcile_servers(wave, &snapshot.per_server);
    wave.end_time = Some(now);

    if let Err(reason) = judge_wave(policy, &wave.servers, snapshot) {
        wave.status = WaveStatus::Failed {
            job_id: Some(job_id),
            reason: reason.clone(),
        };
        execution.fail(format!("wave {wave_number} failed: {reason}"))?;
        return Ok(Advance::Failed { reason });
    }

    wave.status = WaveStatus::Completed { job_id };

    let Some(next) = execution.wave_after(wave_number) else {
        execution.transition_to(ExecutionStatus::Completed)?;
        return Ok(Advance::Completed);
    };
    let next_number = next.wave_number;

    if next.pause_before_execution {
        if let Some(next) = execution.wave_mut(next_number) {
            next.status = WaveStatus::Paused;
        }
        execution.paused_before_wave = Some(next_number);
        execution.transition_to(ExecutionStatus::Paused)?;
        return Ok(Advance::Paused {
            before_wave: next_number,
        });
    }

    let wait =
        chrono::Duration::from_std(next.wait_time()).unwrap_or_else(|_| chrono::Duration::zero());
    let not_before = now + wait;
    execution.scheduled_wave = Some(ScheduledWave {
        wave_number: next_number,
        not_before,
    });
    Ok(Advance::StartNext {
        wave_number: next_number,
        not_before,
    })
}

/// Drives executions from one wave to the next. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WaveScheduler {
    ctx: OrchestratorContext,
    initiator: JobInitiator,
}

impl WaveScheduler {
    /// Creates a scheduler over the shared context.
    #[must_use]
    pub fn new(ctx: OrchestratorContext) -> Self {
        let initiator = JobInitiator::new(ctx.clone());
        Self { ctx, initiator }
    }

    /// Returns the job initiator used for wave starts.
    #[must_use]
    pub const fn initiator(&self) -> &JobInitiator {
        &self.initiator
    }

    /// Moves a `PENDING` execution onto its first wave.
    ///
    /// Gates the execution if the first wave requires a resume; otherwise
    /// starts the first wave's job. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns any error from the first wave start.
    #[tracing::instrument(skip(self, execution_id), fields(execution_id = %execution_id))]
    pub async fn begin(&self, execution_id: &ExecutionId) -> Result<Handoff> {
        let execution = self.ctx.load(execution_id).await?;
        if execution.status != ExecutionStatus::Pending {
            return Ok(Handoff::AlreadyBegun);
        }
        let Some(first) = execution.first_wave() else {
            return Err(Error::invalid_state(*execution_id, "execution has no waves"));
        };
        let wave_number = first.wave_number;

        if !first.pause_before_execution {
            let started = self.initiator.start_wave(execution_id, wave_number).await?;
            return Ok(Handoff::Started(started));
        }

        let (_, gated) = self
            .ctx
            .update(execution_id, |execution| {
                if execution.status != ExecutionStatus::Pending {
                    return Ok(Mutation::Skip(false));
                }
                let wave = execution.require_wave_mut(wave_number)?;
                if wave.status != WaveStatus::NotStarted {
                    return Ok(Mutation::Skip(false));
                }
                wave.status = WaveStatus::Paused;
                execution.paused_before_wave = Some(wave_number);
                execution.transition_to(ExecutionStatus::Paused)?;
                Ok(Mutation::Apply(true))
            })
            .await?;

        if !gated {
            return Ok(Handoff::AlreadyBegun);
        }
        self.ctx.metrics.record_transition(
            ExecutionStatus::Pending.as_label(),
            ExecutionStatus::Paused.as_label(),
        );
        tracing::info!(wave_number, "first wave is gated; execution paused");
        Ok(Handoff::Gated { wave_number })
    }

    /// Persists a terminal job result and acts on the decision.
    ///
    /// Returns `None` if the result is stale (the wave is no longer running
    /// that job, or the execution is already terminal). When the next wave
    /// is due immediately its job is started here; if that start fails the
    /// owed start stays recorded and the next poll retries it.
    ///
    /// # Errors
    ///
    /// Returns registry errors from persisting the decision.
    #[tracing::instrument(
        skip(self, execution_id, snapshot),
        fields(execution_id = %execution_id, job_id = %snapshot.job_id)
    )]
    pub async fn on_job_terminal(
        &self,
        execution_id: &ExecutionId,
        wave_number: u32,
        snapshot: &JobSnapshot,
    ) -> Result<Option<Advance>> {
        let (execution, decided) = self
            .ctx
            .update(execution_id, |execution| {
                let still_running = execution.wave(wave_number).is_some_and(|w| match &w.status {
                    WaveStatus::Running { job_id } => *job_id == snapshot.job_id,
                    _ => false,
                });
                if execution.is_terminal() || !still_running {
                    return Ok(Mutation::Skip(None));
                }
                let from = execution.status;
                execution.last_poll_error = None;
                let advance = apply_job_result(execution, wave_number, snapshot, Utc::now())?;
                Ok(Mutation::Apply(Some((from, advance))))
            })
            .await?;

        let Some((from, advance)) = decided else {
            return Ok(None);
        };

        self.ctx
            .metrics
            .record_transition(from.as_label(), execution.status.as_label());
        let wave_outcome = if matches!(advance, Advance::Failed { .. }) {
            "failed"
        } else {
            "completed"
        };
        self.ctx.metrics.record_wave_outcome(wave_outcome);

        match &advance {
            Advance::Completed => {
                tracing::info!(wave_number, "final wave completed; execution completed");
            }
            Advance::Paused { before_wave } => {
                tracing::info!(
                    wave_number,
                    before_wave,
                    "wave completed; paused before gated wave"
                );
            }
            Advance::Failed { reason } => {
                tracing::warn!(wave_number, %reason, "wave failed; execution failed");
            }
            Advance::StartNext {
                wave_number: next,
                not_before,
            } => {
                tracing::info!(
                    wave_number,
                    next_wave = next,
                    %not_before,
                    "wave completed; next wave scheduled"
                );
                if *not_before <= Utc::now() {
                    if let Err(err) = self.initiator.start_wave(execution_id, *next).await {
                        tracing::warn!(
                            next_wave = next,
                            error = %err,
                            "next wave start failed; will retry on next poll"
                        );
                    }
                }
            }
        }

        Ok(Some(advance))
    }
}
