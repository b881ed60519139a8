//! Job Initiator: starts exactly one external recovery job per wave.
//!
//! ## Start Protocol
//!
//! A wave start runs as three registry writes around the external call:
//!
//! 1. **Claim**: `not_started → starting{token}` under optimistic
//!    concurrency. A wave that already has a job ID returns it unchanged; a
//!    live claim held by someone else makes the caller wait and re-read until
//!    the holder's job ID appears. A claim older than `start_claim_ttl` is
//!    abandoned and may be taken over.
//! 2. **Start**: resolve every protection group concurrently under one
//!    bounded call (fresh, never cached across waves), union the servers, and
//!    call `start_job` with traceability tags. Both steps must finish before
//!    the claim expires; on failure or expiry the claim is released.
//! 3. **Persist**: `starting{token} → running{job_id}`, execution →
//!    `POLLING`. The write only lands while the caller's own token is still
//!    on the wave. A job whose claim was lost, whose wave already has another
//!    job, or whose execution became terminal is orphaned and cancelled
//!    best-effort.
//!
//! Only the claim holder talks to the job service, and a holder finishes
//! within `2 × external_call_timeout`, which
//! [`crate::config::OrchestratorConfig::validate`] keeps below
//! `start_claim_ttl`. Concurrent `start_wave` calls for one wave therefore
//! create one external job.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tokio::time::Instant;

use crate::context::OrchestratorContext;
use crate::error::{Error, Result};
use crate::execution::{Execution, ExecutionStatus, ExecutionType, ServerStatus, WaveStatus};
use crate::ids::{ExecutionId, JobId, ServerId};
use crate::job_client::{StartJobRequest, tags};
use crate::registry::Mutation;

/// Result of [`JobInitiator::start_wave`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveStart {
    /// The wave that is running.
    pub wave_number: u32,
    /// The wave's external job.
    pub job_id: JobId,
    /// False when the job already existed (idempotent path).
    pub created: bool,
}

/// What the claim step decided.
enum Claim {
    Existing(JobId),
    Wait,
    Blocked {
        active_wave: u32,
        active_servers: Vec<ServerId>,
        protection_group_ids: Vec<String>,
    },
    Claimed(ClaimedWave),
}

struct ClaimedWave {
    token: String,
    plan_id: String,
    execution_type: ExecutionType,
    protection_group_ids: Vec<String>,
}

/// What the launch step produced.
enum Launch {
    Started { job_id: JobId, request: StartJobRequest },
    Unresolvable,
}

/// What the persist step found.
enum Persisted {
    Assigned { from: ExecutionStatus },
    AlreadyAssigned(JobId),
    ClaimLost,
    Terminal(ExecutionStatus),
}

pub(crate) fn claim_is_live(claimed_at: DateTime<Utc>, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
    now.signed_duration_since(claimed_at)
        .to_std()
        .map_or(true, |age| age < ttl)
}

/// Starts wave jobs. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobInitiator {
    ctx: OrchestratorContext,
}

impl JobInitiator {
    /// Creates an initiator over the shared context.
    #[must_use]
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self { ctx }
    }

    /// Starts the external job for a wave, or returns the one it already has.
    ///
    /// # Errors
    ///
    /// - [`Error::Conflict`] if a server is already committed to another active wave
    /// - [`Error::InvalidState`] if the execution or wave does not permit a start
    /// - [`Error::ExternalService`] if resolution or `start_job` failed
    /// - [`Error::StartInProgress`] if another caller's claim never resolved
    #[tracing::instrument(skip(self, execution_id), fields(execution_id = %execution_id))]
    pub async fn start_wave(
        &self,
        execution_id: &ExecutionId,
        wave_number: u32,
    ) -> Result<WaveStart> {
        // Backstop for a claim holder that neither finishes nor goes stale.
        let deadline = Instant::now() + self.ctx.config.start_claim_ttl * 2;

        loop {
            let attempt = Instant::now();
            match self.claim(execution_id, wave_number).await? {
                Claim::Existing(job_id) => {
                    return Ok(WaveStart {
                        wave_number,
                        job_id,
                        created: false,
                    });
                }
                Claim::Wait => {
                    if Instant::now() >= deadline {
                        return Err(Error::StartInProgress {
                            execution_id: *execution_id,
                            wave_number,
                        });
                    }
                    tokio::time::sleep(self.ctx.config.claim_wait_interval).await;
                }
                Claim::Blocked {
                    active_wave,
                    active_servers,
                    protection_group_ids,
                } => {
                    let servers = self.resolve(&protection_group_ids).await?;
                    let overlap: Vec<ServerId> = active_servers
                        .into_iter()
                        .filter(|s| servers.contains(s))
                        .collect();
                    if overlap.is_empty() {
                        return Err(Error::invalid_state(
                            *execution_id,
                            format!(
                                "wave {active_wave} is still active; only one wave may run at a time"
                            ),
                        ));
                    }
                    return Err(Error::Conflict {
                        wave_number,
                        active_wave,
                        server_ids: overlap,
                    });
                }
                Claim::Claimed(claimed) => {
                    // The claim was stamped after `attempt`, so this never
                    // outlives it.
                    let expires = attempt + self.ctx.config.start_claim_ttl;
                    if let Some(started) = self
                        .start_claimed(execution_id, wave_number, claimed, expires)
                        .await?
                    {
                        return Ok(started);
                    }
                }
            }
        }
    }

    async fn claim(&self, execution_id: &ExecutionId, wave_number: u32) -> Result<Claim> {
        let ttl = self.ctx.config.start_claim_ttl;
        let (_, claim) = self
            .ctx
            .update(execution_id, |execution| {
                let now = Utc::now();
                decide_claim(execution, wave_number, now, ttl)
            })
            .await?;
        Ok(claim)
    }

    async fn start_claimed(
        &self,
        execution_id: &ExecutionId,
        wave_number: u32,
        claimed: ClaimedWave,
        expires: Instant,
    ) -> Result<Option<WaveStart>> {
        let launched = tokio::time::timeout_at(
            expires,
            self.launch(execution_id, wave_number, &claimed),
        )
        .await
        .unwrap_or_else(|_| {
            Err(Error::external(
                "start_wave",
                format!("start claim for wave {wave_number} expired before the job started"),
            ))
        });

        let (job_id, request) = match launched {
            Ok(Launch::Started { job_id, request }) => (job_id, request),
            Ok(Launch::Unresolvable) => {
                return self
                    .fail_unresolvable(execution_id, wave_number, &claimed)
                    .await
                    .map(Some);
            }
            Err(err) => {
                tracing::warn!(wave_number, error = %err, "wave start failed; releasing claim");
                self.release_claim(execution_id, wave_number, &claimed.token).await;
                return Err(err);
            }
        };

        let new_job = job_id.clone();
        let (_, persisted) = self
            .ctx
            .update(execution_id, |execution| {
                persist_job(
                    execution,
                    wave_number,
                    &claimed.token,
                    &new_job,
                    &request.server_ids,
                )
            })
            .await?;

        match persisted {
            Persisted::Assigned { from } => {
                self.ctx.metrics.record_wave_outcome("started");
                self.ctx
                    .metrics
                    .record_transition(from.as_label(), ExecutionStatus::Polling.as_label());
                tracing::info!(
                    wave_number,
                    job_id = %job_id,
                    servers = request.server_ids.len(),
                    "wave job started"
                );
                Ok(Some(WaveStart {
                    wave_number,
                    job_id,
                    created: true,
                }))
            }
            Persisted::AlreadyAssigned(existing) => {
                self.abandon_job(wave_number, &job_id, "wave already has a job")
                    .await;
                Ok(Some(WaveStart {
                    wave_number,
                    job_id: existing,
                    created: false,
                }))
            }
            Persisted::ClaimLost => {
                self.abandon_job(wave_number, &job_id, "start claim was taken over")
                    .await;
                Ok(None)
            }
            Persisted::Terminal(status) => {
                self.abandon_job(wave_number, &job_id, "execution is terminal")
                    .await;
                Err(Error::invalid_state(
                    *execution_id,
                    format!("execution became {status} while wave {wave_number} was starting"),
                ))
            }
        }
    }

    async fn launch(
        &self,
        execution_id: &ExecutionId,
        wave_number: u32,
        claimed: &ClaimedWave,
    ) -> Result<Launch> {
        let servers = self.resolve(&claimed.protection_group_ids).await?;
        if servers.is_empty() {
            return Ok(Launch::Unresolvable);
        }

        let request = StartJobRequest::new(
            servers.into_iter().collect(),
            claimed.execution_type.is_drill(),
        )
        .with_tag(tags::EXECUTION_ID, execution_id.to_string())
        .with_tag(tags::WAVE_NUMBER, wave_number.to_string())
        .with_tag(tags::PLAN_ID, claimed.plan_id.clone())
        .with_tag(tags::EXECUTION_TYPE, claimed.execution_type.as_label());

        let job_id = self
            .ctx
            .bounded("start_job", self.ctx.jobs.start_job(&request))
            .await?;
        Ok(Launch::Started { job_id, request })
    }

    async fn abandon_job(&self, wave_number: u32, job_id: &JobId, reason: &str) {
        self.ctx.metrics.record_orphaned_job();
        tracing::warn!(wave_number, orphaned_job_id = %job_id, reason, "cancelling orphaned job");
        if let Err(err) = self
            .ctx
            .bounded("cancel_job", self.ctx.jobs.cancel_job(job_id))
            .await
        {
            tracing::warn!(job_id = %job_id, error = %err, "failed to cancel orphaned job");
        }
    }

    async fn resolve(&self, protection_group_ids: &[String]) -> Result<BTreeSet<ServerId>> {
        let resolver = &self.ctx.resolver;
        let lookups = protection_group_ids
            .iter()
            .map(|group| resolver.resolve_servers(group));
        let resolved = self
            .ctx
            .bounded("resolve_servers", try_join_all(lookups))
            .await?;
        Ok(resolved.into_iter().flatten().collect())
    }

    async fn release_claim(&self, execution_id: &ExecutionId, wave_number: u32, token: &str) {
        let released = self
            .ctx
            .update(execution_id, |execution| {
                let Some(wave) = execution.wave_mut(wave_number) else {
                    return Ok(Mutation::Skip(()));
                };
                match &wave.status {
                    WaveStatus::Starting { claim_token, .. } if claim_token == token => {
                        wave.status = WaveStatus::NotStarted;
                        Ok(Mutation::Apply(()))
                    }
                    _ => Ok(Mutation::Skip(())),
                }
            })
            .await;
        if let Err(err) = released {
            tracing::warn!(
                wave_number,
                error = %err,
                "failed to release start claim; it will expire"
            );
        }
    }

    async fn fail_unresolvable(
        &self,
        execution_id: &ExecutionId,
        wave_number: u32,
        claimed: &ClaimedWave,
    ) -> Result<WaveStart> {
        let reason = format!(
            "no servers resolved for protection groups [{}]",
            claimed.protection_group_ids.join(", ")
        );
        let (execution, from) = self
            .ctx
            .update(execution_id, |execution| {
                if execution.is_terminal() {
                    return Ok(Mutation::Skip(None));
                }
                let from = execution.status;
                let wave = execution.require_wave_mut(wave_number)?;
                match &wave.status {
                    WaveStatus::Starting { claim_token, .. } if *claim_token == claimed.token => {}
                    _ => return Ok(Mutation::Skip(None)),
                }
                wave.status = WaveStatus::Failed {
                    job_id: None,
                    reason: reason.clone(),
                };
                wave.end_time = Some(Utc::now());
                execution.fail(format!("wave {wave_number} failed: {reason}"))?;
                Ok(Mutation::Apply(Some(from)))
            })
            .await?;

        if let Some(from) = from {
            self.ctx.metrics.record_wave_outcome("failed");
            self.ctx
                .metrics
                .record_transition(from.as_label(), ExecutionStatus::Failed.as_label());
            tracing::warn!(wave_number, %reason, "wave failed before start");
        }
        Err(Error::invalid_state(
            execution.execution_id,
            format!("wave {wave_number} cannot start: {reason}"),
        ))
    }
}

fn decide_claim(
    execution: &mut Execution,
    wave_number: u32,
    now: DateTime<Utc>,
    ttl: std::time::Duration,
) -> Result<Mutation<Claim>> {
    let execution_id = execution.execution_id;
    if execution.is_terminal() {
        return Err(Error::invalid_state(
            execution_id,
            format!("execution is {}", execution.status),
        ));
    }

    let index = execution.wave_index(wave_number).ok_or(Error::WaveNotFound {
        execution_id,
        wave_number,
    })?;
    let wave = &execution.waves[index];

    if let Some(job_id) = wave.job_id() {
        return Ok(Mutation::Skip(Claim::Existing(job_id.clone())));
    }
    match &wave.status {
        WaveStatus::Starting { claimed_at, .. } if claim_is_live(*claimed_at, now, ttl) => {
            return Ok(Mutation::Skip(Claim::Wait));
        }
        WaveStatus::Starting { claim_token, .. } => {
            tracing::warn!(
                wave_number,
                stale_claim = %claim_token,
                "taking over abandoned start claim"
            );
        }
        WaveStatus::Paused => {
            return Err(Error::invalid_state(
                execution_id,
                format!("wave {wave_number} is waiting at a pause gate; resume the execution"),
            ));
        }
        WaveStatus::NotStarted => {}
        finished => {
            return Err(Error::invalid_state(
                execution_id,
                format!("wave {wave_number} is {}", finished.label()),
            ));
        }
    }

    if let Some(active) = execution
        .waves
        .iter()
        .find(|w| w.wave_number != wave_number && w.status.is_active())
    {
        return Ok(Mutation::Skip(Claim::Blocked {
            active_wave: active.wave_number,
            active_servers: active.servers.iter().map(|s| s.server_id.clone()).collect(),
            protection_group_ids: wave.protection_group_ids.clone(),
        }));
    }

    if execution.status == ExecutionStatus::Paused {
        return Err(Error::invalid_state(
            execution_id,
            "execution is paused; resume it to continue",
        ));
    }
    let released = execution
        .scheduled_wave
        .is_some_and(|s| s.wave_number == wave_number);
    if wave.pause_before_execution && !released {
        return Err(Error::invalid_state(
            execution_id,
            format!("wave {wave_number} requires an explicit resume"),
        ));
    }
    if let Some(blocking) = execution.waves[..index]
        .iter()
        .find(|w| !matches!(w.status, WaveStatus::Completed { .. }))
    {
        return Err(Error::invalid_state(
            execution_id,
            format!(
                "wave {wave_number} cannot start before wave {} completes",
                blocking.wave_number
            ),
        ));
    }

    let claimed = ClaimedWave {
        token: ulid::Ulid::new().to_string(),
        plan_id: execution.plan_id.clone(),
        execution_type: execution.execution_type,
        protection_group_ids: wave.protection_group_ids.clone(),
    };
    execution.waves[index].status = WaveStatus::Starting {
        claim_token: claimed.token.clone(),
        claimed_at: now,
    };
    Ok(Mutation::Apply(Claim::Claimed(claimed)))
}

fn persist_job(
    execution: &mut Execution,
    wave_number: u32,
    token: &str,
    job_id: &JobId,
    server_ids: &[ServerId],
) -> Result<Mutation<Persisted>> {
    if execution.is_terminal() {
        return Ok(Mutation::Skip(Persisted::Terminal(execution.status)));
    }
    let index = execution.wave_index(wave_number).ok_or(Error::WaveNotFound {
        execution_id: execution.execution_id,
        wave_number,
    })?;

    let wave = &mut execution.waves[index];
    if let Some(existing) = wave.job_id() {
        return Ok(Mutation::Skip(Persisted::AlreadyAssigned(existing.clone())));
    }
    match &wave.status {
        WaveStatus::Starting { claim_token, .. } if claim_token == token => {}
        WaveStatus::Starting { .. } | WaveStatus::NotStarted => {
            return Ok(Mutation::Skip(Persisted::ClaimLost));
        }
        other => {
            return Err(Error::invalid_state(
                execution.execution_id,
                format!("wave {wave_number} became {} while starting", other.label()),
            ));
        }
    }

    wave.status = WaveStatus::Running {
        job_id: job_id.clone(),
    };
    wave.start_time = Some(Utc::now());
    wave.servers = server_ids.iter().cloned().map(ServerStatus::pending).collect();

    execution.advance_current_wave(index)?;
    if execution
        .scheduled_wave
        .is_some_and(|s| s.wave_number == wave_number)
    {
        execution.scheduled_wave = None;
    }
    execution.last_poll_error = None;
    let from = execution.status;
    if from != ExecutionStatus::Polling {
        execution.transition_to(ExecutionStatus::Polling)?;
    }
    Ok(Mutation::Apply(Persisted::Assigned { from }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ScheduledWave;
    use crate::plan::{RecoveryPlan, WaveDefinition, WaveFailurePolicy};
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(120);

    fn execution() -> Execution {
        let plan = RecoveryPlan::builder("plan-1")
            .wave(WaveDefinition::new(1, ["pg-1"]))
            .wave(WaveDefinition::new(2, ["pg-2"]).paused())
            .build()
            .unwrap();
        Execution::from_plan(&plan, ExecutionType::Drill, "ops", WaveFailurePolicy::default())
    }

    fn claim(execution: &mut Execution, wave_number: u32) -> Result<Mutation<Claim>> {
        decide_claim(execution, wave_number, Utc::now(), TTL)
    }

    #[test]
    fn claims_first_wave_of_pending_execution() {
        let mut exec = execution();
        let decision = claim(&mut exec, 1).unwrap();
        assert!(matches!(decision, Mutation::Apply(Claim::Claimed(_))));
        assert!(matches!(exec.waves[0].status, WaveStatus::Starting { .. }));
    }

    #[test]
    fn existing_job_is_returned_unchanged() {
        let mut exec = execution();
        exec.waves[0].status = WaveStatus::Running {
            job_id: JobId::new("drsjob-1"),
        };
        match claim(&mut exec, 1).unwrap() {
            Mutation::Skip(Claim::Existing(job_id)) => assert_eq!(job_id.as_str(), "drsjob-1"),
            _ => panic!("expected existing job"),
        }
    }

    #[test]
    fn live_claim_waits_and_stale_claim_is_taken_over() {
        let mut exec = execution();
        exec.waves[0].status = WaveStatus::Starting {
            claim_token: "other".into(),
            claimed_at: Utc::now(),
        };
        assert!(matches!(claim(&mut exec, 1).unwrap(), Mutation::Skip(Claim::Wait)));

        exec.waves[0].status = WaveStatus::Starting {
            claim_token: "other".into(),
            claimed_at: Utc::now() - chrono::Duration::seconds(600),
        };
        assert!(matches!(
            claim(&mut exec, 1).unwrap(),
            Mutation::Apply(Claim::Claimed(_))
        ));
    }

    #[test]
    fn gated_wave_needs_release_by_resume() {
        let mut exec = execution();
        exec.waves[0].status = WaveStatus::Completed {
            job_id: JobId::new("drsjob-1"),
        };
        exec.status = ExecutionStatus::Polling;
        assert!(matches!(
            claim(&mut exec, 2),
            Err(Error::InvalidState { .. })
        ));

        exec.scheduled_wave = Some(ScheduledWave {
            wave_number: 2,
            not_before: Utc::now(),
        });
        assert!(matches!(
            claim(&mut exec, 2).unwrap(),
            Mutation::Apply(Claim::Claimed(_))
        ));
    }

    #[test]
    fn later_wave_cannot_skip_ahead() {
        let mut exec = execution();
        exec.scheduled_wave = Some(ScheduledWave {
            wave_number: 2,
            not_before: Utc::now(),
        });
        let err = claim(&mut exec, 2).err().unwrap();
        assert!(err.to_string().contains("before wave 1 completes"));
    }

    #[test]
    fn active_wave_blocks_other_waves() {
        let mut exec = execution();
        exec.waves[0].status = WaveStatus::Running {
            job_id: JobId::new("drsjob-1"),
        };
        exec.waves[0].servers = vec![ServerStatus::pending(ServerId::from("s-1"))];
        match claim(&mut exec, 2).unwrap() {
            Mutation::Skip(Claim::Blocked {
                active_wave,
                active_servers,
                ..
            }) => {
                assert_eq!(active_wave, 1);
                assert_eq!(active_servers, vec![ServerId::from("s-1")]);
            }
            _ => panic!("expected blocked"),
        }
    }

    fn claimed_token(execution: &mut Execution, wave_number: u32) -> String {
        match claim(execution, wave_number).unwrap() {
            Mutation::Apply(Claim::Claimed(claimed)) => claimed.token,
            _ => panic!("expected a fresh claim"),
        }
    }

    #[test]
    fn persist_assigns_job_and_enters_polling() {
        let mut exec = execution();
        let token = claimed_token(&mut exec, 1);
        let servers = [ServerId::from("s-1"), ServerId::from("s-2")];
        let persisted =
            persist_job(&mut exec, 1, &token, &JobId::new("drsjob-1"), &servers).unwrap();

        assert!(matches!(
            persisted,
            Mutation::Apply(Persisted::Assigned {
                from: ExecutionStatus::Pending
            })
        ));
        assert_eq!(exec.status, ExecutionStatus::Polling);
        assert_eq!(exec.current_wave, Some(0));
        assert_eq!(exec.waves[0].servers.len(), 2);
    }

    #[test]
    fn persist_keeps_the_first_job() {
        let mut exec = execution();
        exec.waves[0].status = WaveStatus::Running {
            job_id: JobId::new("drsjob-1"),
        };
        let persisted =
            persist_job(&mut exec, 1, "token", &JobId::new("drsjob-2"), &[]).unwrap();
        match persisted {
            Mutation::Skip(Persisted::AlreadyAssigned(job_id)) => {
                assert_eq!(job_id.as_str(), "drsjob-1");
            }
            _ => panic!("expected already assigned"),
        }
    }

    #[test]
    fn persist_refuses_a_claim_that_was_taken_over() {
        let mut exec = execution();
        let stale = claimed_token(&mut exec, 1);
        exec.waves[0].status = WaveStatus::Starting {
            claim_token: "successor".into(),
            claimed_at: Utc::now(),
        };

        let persisted =
            persist_job(&mut exec, 1, &stale, &JobId::new("drsjob-late"), &[]).unwrap();
        assert!(matches!(persisted, Mutation::Skip(Persisted::ClaimLost)));
        assert!(matches!(
            &exec.waves[0].status,
            WaveStatus::Starting { claim_token, .. } if claim_token == "successor"
        ));
        assert_eq!(exec.status, ExecutionStatus::Pending);

        exec.waves[0].status = WaveStatus::NotStarted;
        let persisted =
            persist_job(&mut exec, 1, &stale, &JobId::new("drsjob-late"), &[]).unwrap();
        assert!(matches!(persisted, Mutation::Skip(Persisted::ClaimLost)));
    }

    #[test]
    fn claim_liveness_uses_ttl() {
        let now = Utc::now();
        assert!(claim_is_live(now, now, TTL));
        assert!(!claim_is_live(now - chrono::Duration::seconds(121), now, TTL));
    }
}
