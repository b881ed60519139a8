//! Execution Poller: reconciles one execution with the external job service.
//!
//! There are no completion callbacks; this is the only way drflow learns that
//! a wave's job progressed. Every write is guarded by optimistic concurrency,
//! so overlapping polls of the same execution are harmless: at most one of
//! them wins each write and the others re-read or skip.

use chrono::Utc;

use crate::context::OrchestratorContext;
use crate::error::Result;
use crate::execution::{Execution, ExecutionStatus, WaveStatus};
use crate::ids::{ExecutionId, JobId};
use crate::initiator::{WaveStart, claim_is_live};
use crate::registry::Mutation;
use crate::scheduler::{Advance, Handoff, WaveScheduler, reconcile_servers};

/// Result of one [`ExecutionPoller::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing to do for this execution right now.
    Skipped {
        /// Why the poll was a no-op.
        reason: String,
    },
    /// The running job has not finished; per-server state was refreshed.
    InProgress,
    /// An owed wave start was performed.
    WaveStarted(WaveStart),
    /// The running job finished and the scheduler acted on it.
    Advanced(Advance),
    /// A lost hand-off for a `PENDING` execution was re-driven.
    HandoffResumed(Handoff),
}

impl PollOutcome {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Skipped { .. } => "skipped",
            Self::InProgress => "in_progress",
            Self::WaveStarted(_) => "wave_started",
            Self::Advanced(_) => "advanced",
            Self::HandoffResumed(_) => "handoff_resumed",
        }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

/// Polls single executions. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ExecutionPoller {
    ctx: OrchestratorContext,
    scheduler: WaveScheduler,
}

impl ExecutionPoller {
    /// Creates a poller over the shared context.
    #[must_use]
    pub fn new(ctx: OrchestratorContext) -> Self {
        let scheduler = WaveScheduler::new(ctx.clone());
        Self { ctx, scheduler }
    }

    /// Reconciles one execution with the job service.
    ///
    /// Tolerates executions that need no polling (terminal, paused, or
    /// pending within the hand-off grace) by returning
    /// [`PollOutcome::Skipped`]. A wave whose start claim expired is started
    /// again, taking the claim over.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ExternalService`] when the job status query
    /// failed or timed out. The error is also recorded as the execution's
    /// `last_poll_error`; the execution is not failed and the next sweep
    /// re-queries.
    #[tracing::instrument(skip(self, execution_id), fields(execution_id = %execution_id))]
    pub async fn poll(&self, execution_id: &ExecutionId) -> Result<PollOutcome> {
        let result = self.poll_inner(execution_id).await;
        let label = result.as_ref().map_or("error", PollOutcome::label);
        self.ctx.metrics.record_poll(label);
        result
    }

    async fn poll_inner(&self, execution_id: &ExecutionId) -> Result<PollOutcome> {
        let execution = self.ctx.load(execution_id).await?;

        match execution.status {
            status if status.is_terminal() => {
                return Ok(PollOutcome::skipped(format!("execution is {status}")));
            }
            ExecutionStatus::Paused => {
                return Ok(PollOutcome::skipped("execution is paused at a gate"));
            }
            ExecutionStatus::Pending => return self.recover_handoff(&execution).await,
            _ => {}
        }

        if let Some(wave) = execution.running_wave() {
            let Some(job_id) = wave.job_id().cloned() else {
                return Ok(PollOutcome::skipped("running wave has no job"));
            };
            return self.poll_job(execution_id, wave.wave_number, job_id).await;
        }

        if let Some(wave) = execution.active_wave() {
            let abandoned = match &wave.status {
                WaveStatus::Starting { claimed_at, .. } => {
                    !claim_is_live(*claimed_at, Utc::now(), self.ctx.config.start_claim_ttl)
                }
                _ => false,
            };
            if !abandoned {
                return Ok(PollOutcome::skipped(format!(
                    "wave {} is being started",
                    wave.wave_number
                )));
            }
            tracing::warn!(
                wave_number = wave.wave_number,
                "start claim expired; re-driving wave start"
            );
            let started = self
                .scheduler
                .initiator()
                .start_wave(execution_id, wave.wave_number)
                .await?;
            return Ok(PollOutcome::WaveStarted(started));
        }

        match execution.scheduled_wave {
            Some(scheduled) if scheduled.is_due(Utc::now()) => {
                let started = self
                    .scheduler
                    .initiator()
                    .start_wave(execution_id, scheduled.wave_number)
                    .await?;
                Ok(PollOutcome::WaveStarted(started))
            }
            Some(scheduled) => Ok(PollOutcome::skipped(format!(
                "wave {} scheduled for {}",
                scheduled.wave_number, scheduled.not_before
            ))),
            None => Ok(PollOutcome::skipped("no running wave")),
        }
    }

    async fn recover_handoff(&self, execution: &Execution) -> Result<PollOutcome> {
        let age = Utc::now()
            .signed_duration_since(execution.start_time)
            .to_std()
            .unwrap_or_default();
        if age < self.ctx.config.pending_handoff_grace {
            return Ok(PollOutcome::skipped("hand-off still within grace period"));
        }

        tracing::info!(age_secs = age.as_secs(), "re-driving lost hand-off");
        let handoff = self.scheduler.begin(&execution.execution_id).await?;
        Ok(PollOutcome::HandoffResumed(handoff))
    }

    async fn poll_job(
        &self,
        execution_id: &ExecutionId,
        wave_number: u32,
        job_id: JobId,
    ) -> Result<PollOutcome> {
        let snapshot = match self
            .ctx
            .bounded("get_job_status", self.ctx.jobs.get_job_status(&job_id))
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(
                    wave_number,
                    job_id = %job_id,
                    error = %err,
                    "job status query failed"
                );
                self.record_poll_error(execution_id, &job_id, &err.to_string())
                    .await;
                return Err(err);
            }
        };

        if snapshot.status.is_terminal() {
            return Ok(
                match self
                    .scheduler
                    .on_job_terminal(execution_id, wave_number, &snapshot)
                    .await?
                {
                    Some(advance) => PollOutcome::Advanced(advance),
                    None => PollOutcome::skipped("job result already applied"),
                },
            );
        }

        self.ctx
            .update(execution_id, |execution| {
                if execution.is_terminal() {
                    return Ok(Mutation::Skip(()));
                }
                let had_error = execution.last_poll_error.take().is_some();
                let Some(wave) = execution.wave_mut(wave_number) else {
                    return Ok(Mutation::Skip(()));
                };
                let polled_job_running = match &wave.status {
                    WaveStatus::Running { job_id: running } => *running == job_id,
                    _ => false,
                };
                if !polled_job_running {
                    return Ok(Mutation::Skip(()));
                }
                if reconcile_servers(wave, &snapshot.per_server) || had_error {
                    Ok(Mutation::Apply(()))
                } else {
                    Ok(Mutation::Skip(()))
                }
            })
            .await?;

        tracing::debug!(
            wave_number,
            job_id = %job_id,
            status = snapshot.status.as_label(),
            "job still in progress"
        );
        Ok(PollOutcome::InProgress)
    }

    async fn record_poll_error(&self, execution_id: &ExecutionId, job_id: &JobId, message: &str) {
        let recorded = self
            .ctx
            .update(execution_id, |execution| {
                let still_running = execution
                    .running_wave()
                    .and_then(|w| w.job_id())
                    .is_some_and(|running| running == job_id);
                if execution.is_terminal()
                    || !still_running
                    || execution.last_poll_error.as_deref() == Some(message)
                {
                    return Ok(Mutation::Skip(()));
                }
                execution.last_poll_error = Some(message.to_string());
                Ok(Mutation::Apply(()))
            })
            .await;
        if let Err(err) = recorded {
            tracing::debug!(error = %err, "could not record poll error");
        }
    }
}
