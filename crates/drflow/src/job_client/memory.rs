//! In-memory recovery job service for testing.
//!
//! [`InMemoryJobClient`] stands in for the external replication service. Tests
//! start jobs through the orchestrator and then script each job's progress
//! (`complete_all_launched`, `set_progress`, ...) the way the real service
//! would report it on the next poll.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: nothing is actually recovered
//! - **Single-process only**: jobs live in this process's memory

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    JobSnapshot, JobStatus, RecoveryJobClient, ServerLaunchReport, StartJobRequest, tags,
};
use crate::error::{Error, Result};
use crate::ids::{JobId, ServerId};

#[derive(Debug)]
struct FakeJob {
    request: StartJobRequest,
    status: JobStatus,
    per_server: Vec<ServerLaunchReport>,
    error: Option<String>,
    cancel_requested: bool,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    jobs: BTreeMap<JobId, FakeJob>,
    started: Vec<JobId>,
    fail_starts: bool,
    fail_status: bool,
    fail_cancels: bool,
    hang_cancels: bool,
}

/// Scriptable fake of the external recovery job service.
#[derive(Debug, Default)]
pub struct InMemoryJobClient {
    state: Mutex<State>,
    start_delay: Duration,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

fn unknown_job(operation: &str, job_id: &JobId) -> Error {
    Error::external(operation, format!("job {job_id} not found"))
}

impl InMemoryJobClient {
    /// Creates an empty fake service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every `start_job` call, widening race windows in tests.
    #[must_use]
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().map_err(poison_err)?;
        f(&mut state)
    }

    fn with_job<T>(&self, job_id: &JobId, f: impl FnOnce(&mut FakeJob) -> T) -> Result<T> {
        self.with_state(|state| {
            state
                .jobs
                .get_mut(job_id)
                .map(f)
                .ok_or_else(|| unknown_job("script", job_id))
        })
    }

    /// Returns every started job ID in start order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn job_ids(&self) -> Result<Vec<JobId>> {
        self.with_state(|state| Ok(state.started.clone()))
    }

    /// Returns how many jobs have been started.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn job_count(&self) -> Result<usize> {
        self.with_state(|state| Ok(state.started.len()))
    }

    /// Returns the request a job was started with.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn request(&self, job_id: &JobId) -> Result<Option<StartJobRequest>> {
        self.with_state(|state| Ok(state.jobs.get(job_id).map(|j| j.request.clone())))
    }

    /// Returns the jobs started for one wave of one execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn jobs_for_wave(&self, execution_id: &str, wave_number: u32) -> Result<Vec<JobId>> {
        let wave = wave_number.to_string();
        self.with_state(|state| {
            Ok(state
                .started
                .iter()
                .filter(|id| {
                    state.jobs.get(*id).is_some_and(|job| {
                        job.request.tag(tags::EXECUTION_ID) == Some(execution_id)
                            && job.request.tag(tags::WAVE_NUMBER) == Some(wave.as_str())
                    })
                })
                .cloned()
                .collect())
        })
    }

    /// Replaces a job's reported status and per-server results.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is unknown.
    pub fn set_progress(
        &self,
        job_id: &JobId,
        status: JobStatus,
        per_server: Vec<ServerLaunchReport>,
    ) -> Result<()> {
        self.with_job(job_id, |job| {
            job.status = status;
            job.per_server = per_server;
        })
    }

    /// Completes a job, assigning each server the external status chosen by `status_for`.
    ///
    /// Launched servers get a recovery instance ID; failed servers get an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is unknown.
    pub fn complete_with(
        &self,
        job_id: &JobId,
        status_for: impl Fn(&ServerId) -> &'static str,
    ) -> Result<()> {
        self.with_job(job_id, |job| {
            job.status = JobStatus::Completed;
            job.per_server = job
                .request
                .server_ids
                .iter()
                .map(|server| {
                    let launch_status = status_for(server);
                    let mut report = ServerLaunchReport::new(server.clone(), launch_status);
                    match launch_status {
                        "LAUNCHED" => {
                            report.recovery_instance_id = Some(format!("i-{server}"));
                        }
                        "FAILED" => report.error = Some(format!("launch of {server} failed")),
                        _ => {}
                    }
                    report
                })
                .collect();
        })
    }

    /// Completes a job with every server launched.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is unknown.
    pub fn complete_all_launched(&self, job_id: &JobId) -> Result<()> {
        self.complete_with(job_id, |_| "LAUNCHED")
    }

    /// Completes a job with every server failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is unknown.
    pub fn complete_all_failed(&self, job_id: &JobId) -> Result<()> {
        self.complete_with(job_id, |_| "FAILED")
    }

    /// Marks every server of a job as in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is unknown.
    pub fn mark_in_progress(&self, job_id: &JobId) -> Result<()> {
        self.with_job(job_id, |job| {
            job.status = JobStatus::Running;
            for report in &mut job.per_server {
                report.launch_status = "IN_PROGRESS".to_string();
            }
        })
    }

    /// Terminally errors a job.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is unknown.
    pub fn fail_job(&self, job_id: &JobId, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.with_job(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(error);
        })
    }

    /// Returns true if `cancel_job` reached the job.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is unknown.
    pub fn cancel_requested(&self, job_id: &JobId) -> Result<bool> {
        self.with_job(job_id, |job| job.cancel_requested)
    }

    /// Makes `start_job` fail until cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_starts(&self, failing: bool) -> Result<()> {
        self.with_state(|state| {
            state.fail_starts = failing;
            Ok(())
        })
    }

    /// Makes `get_job_status` fail until cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_status_queries(&self, failing: bool) -> Result<()> {
        self.with_state(|state| {
            state.fail_status = failing;
            Ok(())
        })
    }

    /// Makes `cancel_job` fail until cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_cancellations(&self, failing: bool) -> Result<()> {
        self.with_state(|state| {
            state.fail_cancels = failing;
            Ok(())
        })
    }

    /// Makes `cancel_job` hang instead of returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn hang_cancellations(&self, hanging: bool) -> Result<()> {
        self.with_state(|state| {
            state.hang_cancels = hanging;
            Ok(())
        })
    }
}

#[async_trait]
impl RecoveryJobClient for InMemoryJobClient {
    async fn start_job(&self, request: &StartJobRequest) -> Result<JobId> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        self.with_state(|state| {
            if state.fail_starts {
                return Err(Error::external("start_job", "service unavailable"));
            }
            state.next_id += 1;
            let job_id = JobId::new(format!("drsjob-{:06}", state.next_id));
            let per_server = request
                .server_ids
                .iter()
                .map(|server| ServerLaunchReport::new(server.clone(), "PENDING"))
                .collect();
            state.jobs.insert(
                job_id.clone(),
                FakeJob {
                    request: request.clone(),
                    status: JobStatus::Pending,
                    per_server,
                    error: None,
                    cancel_requested: false,
                },
            );
            state.started.push(job_id.clone());
            Ok(job_id)
        })
    }

    async fn get_job_status(&self, job_id: &JobId) -> Result<JobSnapshot> {
        self.with_state(|state| {
            if state.fail_status {
                return Err(Error::external("get_job_status", "throttled"));
            }
            let job = state
                .jobs
                .get(job_id)
                .ok_or_else(|| unknown_job("get_job_status", job_id))?;
            Ok(JobSnapshot {
                job_id: job_id.clone(),
                status: job.status,
                per_server: job.per_server.clone(),
                error: job.error.clone(),
            })
        })
    }

    async fn cancel_job(&self, job_id: &JobId) -> Result<()> {
        let hang = self.with_state(|state| Ok(state.hang_cancels))?;
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        self.with_state(|state| {
            if state.fail_cancels {
                return Err(Error::external("cancel_job", "cancel rejected"));
            }
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| unknown_job("cancel_job", job_id))?;
            job.cancel_requested = true;
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.error = Some("job cancelled".to_string());
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(servers: &[&str]) -> StartJobRequest {
        StartJobRequest::new(servers.iter().map(|s| ServerId::from(*s)).collect(), true)
            .with_tag(tags::EXECUTION_ID, "exec-1")
            .with_tag(tags::WAVE_NUMBER, "1")
    }

    #[tokio::test]
    async fn started_job_reports_pending_servers() -> Result<()> {
        let client = InMemoryJobClient::new();
        let job_id = client.start_job(&request(&["s-1", "s-2"])).await?;

        let snapshot = client.get_job_status(&job_id).await?;
        assert_eq!(snapshot.status, JobStatus::Pending);
        assert_eq!(snapshot.per_server.len(), 2);
        assert!(snapshot.per_server.iter().all(|r| r.launch_status == "PENDING"));
        assert_eq!(client.jobs_for_wave("exec-1", 1)?, vec![job_id]);
        Ok(())
    }

    #[tokio::test]
    async fn complete_with_mixed_results() -> Result<()> {
        let client = InMemoryJobClient::new();
        let job_id = client.start_job(&request(&["s-1", "s-2"])).await?;
        client.complete_with(&job_id, |s| if s.as_str() == "s-1" { "LAUNCHED" } else { "FAILED" })?;

        let snapshot = client.get_job_status(&job_id).await?;
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(
            snapshot.per_server[0].recovery_instance_id.as_deref(),
            Some("i-s-1")
        );
        assert!(snapshot.per_server[1].error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn scripted_failures() -> Result<()> {
        let client = InMemoryJobClient::new();
        client.fail_starts(true)?;
        assert!(client.start_job(&request(&["s-1"])).await.is_err());
        client.fail_starts(false)?;

        let job_id = client.start_job(&request(&["s-1"])).await?;
        client.fail_status_queries(true)?;
        assert!(client.get_job_status(&job_id).await.is_err());

        client.fail_cancellations(true)?;
        assert!(client.cancel_job(&job_id).await.is_err());
        assert!(!client.cancel_requested(&job_id)?);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_terminates_running_job() -> Result<()> {
        let client = InMemoryJobClient::new();
        let job_id = client.start_job(&request(&["s-1"])).await?;
        client.cancel_job(&job_id).await?;

        assert!(client.cancel_requested(&job_id)?);
        assert_eq!(client.get_job_status(&job_id).await?.status, JobStatus::Failed);
        Ok(())
    }
}
