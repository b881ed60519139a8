//! Execution Finder: the periodic sweep that replaces completion callbacks.
//!
//! A sweep lists every `PENDING` or `POLLING` execution that still has
//! active jobs and polls each one, at most `max_concurrent_polls` at a time
//! and each under `poll_timeout`. Paused and terminal executions are never
//! listed, so a cancelled execution stops being polled on the very next
//! sweep.
//!
//! Sweeps may overlap (one overrunning the next trigger); every poll write
//! is version-checked, so overlapping polls of one execution only repeat
//! reads.

use std::future::Future;

use futures::StreamExt;
use serde::Serialize;
use tokio::time::MissedTickBehavior;

use crate::context::OrchestratorContext;
use crate::error::Result;
use crate::execution::ExecutionStatus;
use crate::metrics::TimingGuard;
use crate::poller::{ExecutionPoller, PollOutcome};

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    /// Executions polled.
    pub examined: usize,
    /// Jobs still running.
    pub in_progress: usize,
    /// Waves whose jobs finished and were acted on.
    pub advanced: usize,
    /// Owed wave starts performed.
    pub waves_started: usize,
    /// Lost hand-offs re-driven.
    pub handoffs_resumed: usize,
    /// Polls that had nothing to do.
    pub skipped: usize,
    /// Polls that failed or timed out; retried next sweep.
    pub errors: usize,
}

impl SweepSummary {
    fn tally(&mut self, outcome: &Result<PollOutcome>) {
        match outcome {
            Ok(PollOutcome::InProgress) => self.in_progress += 1,
            Ok(PollOutcome::Advanced(_)) => self.advanced += 1,
            Ok(PollOutcome::WaveStarted(_)) => self.waves_started += 1,
            Ok(PollOutcome::HandoffResumed(_)) => self.handoffs_resumed += 1,
            Ok(PollOutcome::Skipped { .. }) => self.skipped += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Discovers executions that need a status check. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ExecutionFinder {
    ctx: OrchestratorContext,
    poller: ExecutionPoller,
}

impl ExecutionFinder {
    /// Creates a finder over the shared context.
    #[must_use]
    pub fn new(ctx: OrchestratorContext) -> Self {
        let poller = ExecutionPoller::new(ctx.clone());
        Self { ctx, poller }
    }

    /// Runs one sweep. Takes no arguments so it can be driven by any
    /// external scheduler.
    ///
    /// # Errors
    ///
    /// Returns an error only if listing executions fails; individual poll
    /// failures are counted in the summary.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepSummary> {
        let metrics = self.ctx.metrics.clone();
        let candidates = self
            .ctx
            .registry
            .list_by_status(&[ExecutionStatus::Pending, ExecutionStatus::Polling])
            .await?;
        let ids: Vec<_> = candidates
            .into_iter()
            .filter(|e| e.has_active_drs_jobs)
            .map(|e| e.execution_id)
            .collect();

        let examined = ids.len();
        let _guard = TimingGuard::new(move |elapsed| metrics.record_sweep(examined, elapsed));

        let poll_timeout = self.ctx.config.poll_timeout;
        let outcomes: Vec<Result<PollOutcome>> = futures::stream::iter(ids)
            .map(|execution_id| {
                let poller = self.poller.clone();
                async move {
                    match tokio::time::timeout(poll_timeout, poller.poll(&execution_id)).await {
                        Ok(outcome) => {
                            if let Err(err) = &outcome {
                                tracing::warn!(
                                    execution_id = %execution_id,
                                    error = %err,
                                    "poll failed"
                                );
                            }
                            outcome
                        }
                        Err(_) => {
                            tracing::warn!(execution_id = %execution_id, "poll timed out");
                            Err(crate::Error::external(
                                "poll",
                                format!("poll exceeded {}s", poll_timeout.as_secs()),
                            ))
                        }
                    }
                }
            })
            .buffer_unordered(self.ctx.config.max_concurrent_polls)
            .collect()
            .await;

        let mut summary = SweepSummary {
            examined,
            ..SweepSummary::default()
        };
        for outcome in &outcomes {
            summary.tally(outcome);
        }

        tracing::info!(
            examined = summary.examined,
            in_progress = summary.in_progress,
            advanced = summary.advanced,
            errors = summary.errors,
            "sweep complete"
        );
        Ok(summary)
    }

    /// Sweeps every `sweep_interval` until `shutdown` resolves.
    ///
    /// Missed ticks are skipped rather than bursted.
    pub async fn run_periodic<S>(&self, shutdown: S)
    where
        S: Future<Output = ()> + Send,
    {
        let mut ticker = tokio::time::interval(self.ctx.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("finder shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        tracing::error!(error = %err, "sweep failed");
                    }
                }
            }
        }
    }
}
