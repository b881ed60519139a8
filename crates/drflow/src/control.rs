//! Control Surface: start, inspect, pause, resume, and terminate executions.
//!
//! Errors from these operations are returned to the caller synchronously.
//! Every mutation goes through the same optimistic-concurrency path as the
//! scheduler and the poller; there is no other lock.

use chrono::Utc;
use tracing::Instrument;

use crate::context::OrchestratorContext;
use crate::error::{Error, Result};
use crate::execution::{Execution, ExecutionStatus, ExecutionType, ScheduledWave, WaveStatus};
use crate::ids::{ExecutionId, JobId};
use crate::initiator::WaveStart;
use crate::registry::Mutation;
use crate::scheduler::WaveScheduler;

/// Acknowledgement of [`ControlSurface::pause_execution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseAck {
    /// The execution is already held at this wave's gate.
    AlreadyPaused {
        /// The gated wave.
        wave: u32,
    },
    /// The next wave is gated; the execution will pause when the running wave finishes.
    GateArmed {
        /// The gated wave.
        wave: u32,
    },
}

/// Result of [`ControlSurface::terminate_execution`].
#[derive(Debug, Clone)]
pub struct Termination {
    /// The execution as stored after termination.
    pub execution: Execution,
    /// Why the best-effort external cancel failed, if it did.
    pub cancel_error: Option<String>,
}

/// Operator-facing operations on executions. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ControlSurface {
    ctx: OrchestratorContext,
    scheduler: WaveScheduler,
}

impl ControlSurface {
    /// Creates a control surface over the shared context.
    #[must_use]
    pub fn new(ctx: OrchestratorContext) -> Self {
        let scheduler = WaveScheduler::new(ctx.clone());
        Self { ctx, scheduler }
    }

    /// Creates a `PENDING` execution and hands it to the scheduler.
    ///
    /// Returns as soon as the record exists; the first wave starts in the
    /// background. A lost hand-off is re-driven by the poller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PlanNotFound`] or [`Error::InvalidPlan`] if the plan
    /// cannot be run, or a registry error if the record cannot be created.
    #[tracing::instrument(skip(self))]
    pub async fn start_execution(
        &self,
        plan_id: &str,
        execution_type: ExecutionType,
        initiated_by: &str,
    ) -> Result<ExecutionId> {
        let plan = self
            .ctx
            .plans
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| Error::PlanNotFound {
                plan_id: plan_id.to_string(),
            })?;
        plan.validate()?;

        let execution = Execution::from_plan(
            &plan,
            execution_type,
            initiated_by,
            self.ctx.config.default_failure_policy,
        );
        let execution_id = execution.execution_id;
        self.ctx.registry.create(&execution).await?;
        self.ctx
            .metrics
            .record_execution_started(execution_type.as_label());
        tracing::info!(
            execution_id = %execution_id,
            waves = execution.total_waves,
            "execution created"
        );

        let scheduler = self.scheduler.clone();
        let span = drflow_core::execution_span("handoff", &execution_id.to_string(), plan_id);
        tokio::spawn(
            async move {
                if let Err(err) = scheduler.begin(&execution_id).await {
                    tracing::warn!(error = %err, "hand-off failed; the finder will retry");
                }
            }
            .instrument(span),
        );

        Ok(execution_id)
    }

    /// Returns the latest persisted state, including waves and servers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutionNotFound`] if the execution does not exist.
    pub async fn get_execution(&self, execution_id: &ExecutionId) -> Result<Execution> {
        self.ctx.load(execution_id).await
    }

    /// Acknowledges a pause request.
    ///
    /// Pausing only happens at pause gates defined in the plan. A request is
    /// accepted when the execution is already held at a gate, or when the
    /// next wave after the current one is gated; anything else is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if no pause gate has been reached.
    #[tracing::instrument(skip(self, execution_id), fields(execution_id = %execution_id))]
    pub async fn pause_execution(&self, execution_id: &ExecutionId) -> Result<PauseAck> {
        let execution = self.ctx.load(execution_id).await?;

        let upcoming = match execution.status {
            ExecutionStatus::Paused => {
                let wave = execution.paused_before_wave.ok_or_else(|| {
                    Error::invalid_state(*execution_id, "paused execution has no gated wave")
                })?;
                return Ok(PauseAck::AlreadyPaused { wave });
            }
            ExecutionStatus::Pending => execution.first_wave(),
            ExecutionStatus::Polling => execution
                .active_wave()
                .and_then(|w| execution.wave_after(w.wave_number)),
            status => {
                return Err(Error::invalid_state(
                    *execution_id,
                    format!("cannot pause a {status} execution"),
                ));
            }
        };

        match upcoming {
            Some(wave) if wave.pause_before_execution => Ok(PauseAck::GateArmed {
                wave: wave.wave_number,
            }),
            _ => Err(Error::invalid_state(
                *execution_id,
                "pause only takes effect at a pause gate and the next wave has none",
            )),
        }
    }

    /// Releases a pause gate and starts the gated wave.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the execution is `PAUSED`. If
    /// the wave start itself fails, the execution stays `POLLING` with the
    /// start owed, and the next sweep retries it.
    #[tracing::instrument(skip(self, execution_id), fields(execution_id = %execution_id))]
    pub async fn resume_execution(&self, execution_id: &ExecutionId) -> Result<WaveStart> {
        let (_, wave_number) = self
            .ctx
            .update(execution_id, |execution| {
                if execution.status != ExecutionStatus::Paused {
                    return Err(Error::invalid_state(
                        execution.execution_id,
                        format!("cannot resume a {} execution", execution.status),
                    ));
                }
                let execution_id = execution.execution_id;
                let wave_number = execution.paused_before_wave.ok_or_else(|| {
                    Error::invalid_state(execution_id, "paused execution has no gated wave")
                })?;
                let wave = execution.require_wave_mut(wave_number)?;
                if wave.status == WaveStatus::Paused {
                    wave.status = WaveStatus::NotStarted;
                }
                execution.paused_before_wave = None;
                execution.scheduled_wave = Some(ScheduledWave {
                    wave_number,
                    not_before: Utc::now(),
                });
                execution.transition_to(ExecutionStatus::Polling)?;
                Ok(Mutation::Apply(wave_number))
            })
            .await?;

        self.ctx.metrics.record_transition(
            ExecutionStatus::Paused.as_label(),
            ExecutionStatus::Polling.as_label(),
        );
        tracing::info!(wave_number, "execution resumed");
        self.scheduler
            .initiator()
            .start_wave(execution_id, wave_number)
            .await
    }

    /// Cancels the execution.
    ///
    /// `CANCELLED` is persisted first. The in-flight external job (if any)
    /// then gets one bounded, best-effort cancel attempt whose failure is
    /// reported in [`Termination::cancel_error`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the execution already finished.
    #[tracing::instrument(skip(self, execution_id), fields(execution_id = %execution_id))]
    pub async fn terminate_execution(&self, execution_id: &ExecutionId) -> Result<Termination> {
        let execution = self.ctx.load(execution_id).await?;
        if execution.is_terminal() {
            return Err(Error::invalid_state(
                *execution_id,
                format!("cannot terminate a {} execution", execution.status),
            ));
        }

        let (execution, cancelled) = self
            .ctx
            .update(execution_id, |execution| {
                if execution.status == ExecutionStatus::Cancelled {
                    return Ok(Mutation::Skip(None));
                }
                if execution.is_terminal() {
                    return Err(Error::invalid_state(
                        execution.execution_id,
                        format!(
                            "execution became {} before it could be terminated",
                            execution.status
                        ),
                    ));
                }
                let from = execution.status;
                let now = Utc::now();
                let mut jobs: Vec<JobId> = Vec::new();
                for wave in &mut execution.waves {
                    if !wave.status.is_active() {
                        continue;
                    }
                    let job_id = wave.status.job_id().cloned();
                    jobs.extend(job_id.clone());
                    wave.status = WaveStatus::Cancelled { job_id };
                    wave.end_time = Some(now);
                }
                execution.paused_before_wave = None;
                execution.transition_to(ExecutionStatus::Cancelled)?;
                Ok(Mutation::Apply(Some((from, jobs))))
            })
            .await?;

        let mut cancel_error = None;
        if let Some((from, jobs)) = cancelled {
            self.ctx
                .metrics
                .record_transition(from.as_label(), ExecutionStatus::Cancelled.as_label());
            self.ctx.metrics.record_wave_outcome("cancelled");
            // Status is already CANCELLED; the Finder no longer polls it.
            for job_id in jobs {
                if let Some(err) = self.cancel_best_effort(&job_id).await {
                    cancel_error.get_or_insert(err);
                }
            }
        }

        tracing::info!(
            cancel_failed = cancel_error.is_some(),
            "execution terminated"
        );
        Ok(Termination {
            execution,
            cancel_error,
        })
    }

    async fn cancel_best_effort(&self, job_id: &JobId) -> Option<String> {
        match self
            .ctx
            .bounded("cancel_job", self.ctx.jobs.cancel_job(job_id))
            .await
        {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err, "best-effort job cancel failed");
                Some(err.to_string())
            }
        }
    }
}
