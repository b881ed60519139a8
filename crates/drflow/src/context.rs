//! Process-wide dependencies shared by every orchestration component.
//!
//! An [`OrchestratorContext`] is built once at startup and cloned into each
//! component. There is no global client cache: tests build a fresh context
//! around in-memory fakes and nothing leaks between them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::execution::Execution;
use crate::ids::ExecutionId;
use crate::job_client::RecoveryJobClient;
use crate::metrics::DrMetrics;
use crate::plan::PlanSource;
use crate::registry::{ExecutionRegistry, Mutation, update_with_retry};
use crate::resolver::ServerResolver;

/// Shared handles to storage, external collaborators, and tuning.
#[derive(Clone)]
pub struct OrchestratorContext {
    /// Execution storage.
    pub registry: Arc<dyn ExecutionRegistry>,
    /// Protection group resolution.
    pub resolver: Arc<dyn ServerResolver>,
    /// External recovery job service.
    pub jobs: Arc<dyn RecoveryJobClient>,
    /// Recovery plans.
    pub plans: Arc<dyn PlanSource>,
    /// Tuning.
    pub config: OrchestratorConfig,
    /// Metrics recorder.
    pub metrics: DrMetrics,
}

impl fmt::Debug for OrchestratorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OrchestratorContext {
    /// Creates a context with default configuration.
    #[must_use]
    pub fn new(
        registry: Arc<dyn ExecutionRegistry>,
        resolver: Arc<dyn ServerResolver>,
        jobs: Arc<dyn RecoveryJobClient>,
        plans: Arc<dyn PlanSource>,
    ) -> Self {
        Self {
            registry,
            resolver,
            jobs,
            plans,
            config: OrchestratorConfig::default(),
            metrics: DrMetrics::new(),
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs an external call under `external_call_timeout`.
    ///
    /// A timeout becomes [`Error::ExternalService`]. Every call is counted by
    /// operation and result.
    ///
    /// # Errors
    ///
    /// Returns the call's own error, or an external service error on timeout.
    pub async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        let timeout = self.config.external_call_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => {
                self.metrics.record_external_call(operation, "success");
                Ok(value)
            }
            Ok(Err(err)) => {
                self.metrics.record_external_call(operation, "error");
                Err(err)
            }
            Err(_) => {
                self.metrics.record_external_call(operation, "timeout");
                Err(Error::external(
                    operation,
                    format!("timed out after {}ms", timeout.as_millis()),
                ))
            }
        }
    }

    /// Reads an execution that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutionNotFound`] if it does not.
    pub async fn load(&self, execution_id: &ExecutionId) -> Result<Execution> {
        self.registry
            .get(execution_id)
            .await?
            .ok_or(Error::ExecutionNotFound {
                execution_id: *execution_id,
            })
    }

    /// Read-modify-write under optimistic concurrency with the configured
    /// retry limit. See [`update_with_retry`].
    ///
    /// # Errors
    ///
    /// See [`update_with_retry`].
    pub async fn update<T, F>(
        &self,
        execution_id: &ExecutionId,
        mutate: F,
    ) -> Result<(Execution, T)>
    where
        F: FnMut(&mut Execution) -> Result<Mutation<T>> + Send,
        T: Send,
    {
        update_with_retry(
            self.registry.as_ref(),
            execution_id,
            self.config.registry_retry_limit,
            mutate,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::job_client::memory::InMemoryJobClient;
    use crate::plan::InMemoryPlanSource;
    use crate::registry::InMemoryRegistry;
    use crate::resolver::StaticServerResolver;

    fn context(timeout: Duration) -> OrchestratorContext {
        OrchestratorContext::new(
            Arc::new(InMemoryRegistry::new()),
            Arc::new(StaticServerResolver::new()),
            Arc::new(InMemoryJobClient::new()),
            Arc::new(InMemoryPlanSource::new()),
        )
        .with_config(OrchestratorConfig {
            external_call_timeout: timeout,
            ..OrchestratorConfig::default()
        })
    }

    #[tokio::test]
    async fn bounded_times_out_hung_calls() {
        let ctx = context(Duration::from_millis(20));
        let result: Result<()> = ctx
            .bounded("cancel_job", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("cancel_job"));
    }

    #[tokio::test]
    async fn bounded_passes_through_results() -> Result<()> {
        let ctx = context(Duration::from_secs(1));
        assert_eq!(ctx.bounded("resolve_servers", async { Ok(7) }).await?, 7);
        Ok(())
    }

    #[tokio::test]
    async fn load_reports_missing_execution() {
        let ctx = context(Duration::from_secs(1));
        let err = ctx.load(&ExecutionId::generate()).await.unwrap_err();
        assert!(matches!(err, Error::ExecutionNotFound { .. }));
    }
}
