//! Observability metrics for wave orchestration.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `drflow_executions_started_total` | Counter | `execution_type` | Executions created |
//! | `drflow_execution_transitions_total` | Counter | `from_state`, `to_state` | Execution state transitions |
//! | `drflow_wave_outcomes_total` | Counter | `outcome` | Waves started, completed, failed, cancelled |
//! | `drflow_polls_total` | Counter | `outcome` | Poller invocations by outcome |
//! | `drflow_sweep_duration_seconds` | Histogram | - | Finder sweep wall time |
//! | `drflow_sweep_executions` | Gauge | - | Executions examined by the last sweep |
//! | `drflow_external_calls_total` | Counter | `operation`, `result` | Calls to the job service and resolver |
//! | `drflow_registry_conflicts_total` | Counter | - | Lost optimistic-concurrency writes |
//! | `drflow_orphaned_jobs_total` | Counter | - | External jobs created by a start that lost its race |
//!
//! Metrics go through the `metrics` facade; the service binary installs the
//! Prometheus recorder and serves `/metrics`.

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: executions created.
    pub const EXECUTIONS_STARTED_TOTAL: &str = "drflow_executions_started_total";
    /// Counter: execution state transitions.
    pub const EXECUTION_TRANSITIONS_TOTAL: &str = "drflow_execution_transitions_total";
    /// Counter: wave outcomes.
    pub const WAVE_OUTCOMES_TOTAL: &str = "drflow_wave_outcomes_total";
    /// Counter: poll outcomes.
    pub const POLLS_TOTAL: &str = "drflow_polls_total";
    /// Histogram: sweep duration in seconds.
    pub const SWEEP_DURATION_SECONDS: &str = "drflow_sweep_duration_seconds";
    /// Gauge: executions examined by the last sweep.
    pub const SWEEP_EXECUTIONS: &str = "drflow_sweep_executions";
    /// Counter: external collaborator calls.
    pub const EXTERNAL_CALLS_TOTAL: &str = "drflow_external_calls_total";
    /// Counter: lost registry writes.
    pub const REGISTRY_CONFLICTS_TOTAL: &str = "drflow_registry_conflicts_total";
    /// Counter: orphaned external jobs.
    pub const ORPHANED_JOBS_TOTAL: &str = "drflow_orphaned_jobs_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Drill or recovery.
    pub const EXECUTION_TYPE: &str = "execution_type";
    /// Previous execution state.
    pub const FROM_STATE: &str = "from_state";
    /// Target execution state.
    pub const TO_STATE: &str = "to_state";
    /// Outcome of a wave or poll.
    pub const OUTCOME: &str = "outcome";
    /// External operation name.
    pub const OPERATION: &str = "operation";
    /// `success`, `error`, or `timeout`.
    pub const RESULT: &str = "result";
}

/// High-level interface for recording orchestration metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct DrMetrics;

impl DrMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a newly created execution.
    pub fn record_execution_started(&self, execution_type: &str) {
        counter!(
            names::EXECUTIONS_STARTED_TOTAL,
            labels::EXECUTION_TYPE => execution_type.to_string(),
        )
        .increment(1);
    }

    /// Records an execution state transition.
    pub fn record_transition(&self, from_state: &str, to_state: &str) {
        if from_state == to_state {
            return;
        }
        counter!(
            names::EXECUTION_TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records a wave outcome (`started`, `completed`, `failed`, `cancelled`).
    pub fn record_wave_outcome(&self, outcome: &str) {
        counter!(
            names::WAVE_OUTCOMES_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records one poll by outcome.
    pub fn record_poll(&self, outcome: &str) {
        counter!(names::POLLS_TOTAL, labels::OUTCOME => outcome.to_string()).increment(1);
    }

    /// Records a finished sweep.
    #[allow(clippy::cast_precision_loss)] // Sweep sizes are small
    pub fn record_sweep(&self, examined: usize, duration: Duration) {
        gauge!(names::SWEEP_EXECUTIONS).set(examined as f64);
        histogram!(names::SWEEP_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records an external collaborator call.
    pub fn record_external_call(&self, operation: &str, result: &str) {
        counter!(
            names::EXTERNAL_CALLS_TOTAL,
            labels::OPERATION => operation.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records an optimistic-concurrency write that lost its race.
    pub fn record_registry_conflict(&self) {
        counter!(names::REGISTRY_CONFLICTS_TOTAL).increment(1);
    }

    /// Records an external job whose bookkeeping was discarded.
    pub fn record_orphaned_job(&self) {
        counter!(names::ORPHANED_JOBS_TOTAL).increment(1);
    }
}

/// Guard that records a sweep's duration when dropped.
///
/// ```rust
/// use drflow::metrics::{DrMetrics, TimingGuard};
///
/// let guard = TimingGuard::new(|elapsed| {
///     DrMetrics::new().record_sweep(0, elapsed);
/// });
/// drop(guard);
/// ```
pub struct TimingGuard<F: FnOnce(Duration)> {
    start: Instant,
    on_drop: Option<F>,
}

impl<F: FnOnce(Duration)> TimingGuard<F> {
    /// Starts timing.
    #[must_use]
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the time elapsed so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F: FnOnce(Duration)> Drop for TimingGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
