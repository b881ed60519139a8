//! drflow HTTP service.
//!
//! Exposes the Control Surface over HTTP and runs the Execution Finder on a
//! fixed interval. `POST /sweep` triggers a sweep on demand, so an external
//! scheduler can drive the Finder instead (`DRFLOW_SWEEP_ENABLED=false`).
//!
//! Executions live in the object store named by `DRFLOW_STORAGE_BUCKET`
//! (`gs://bucket`). `memory://` keeps them in-process for local runs.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};

use drflow::config::ServiceConfig;
use drflow::context::OrchestratorContext;
use drflow::control::{ControlSurface, PauseAck};
use drflow::execution::{Execution, ExecutionType};
use drflow::finder::{ExecutionFinder, SweepSummary};
use drflow::ids::ExecutionId;
use drflow::initiator::WaveStart;
use drflow::job_client::http::HttpRecoveryJobClient;
use drflow::plan::{InMemoryPlanSource, RecoveryPlan};
use drflow::registry::{ExecutionRegistry, StorageRegistry};
use drflow::resolver::{HttpServerResolver, ServerResolver};
use drflow::{Error, Result};
use drflow_core::ObjectStoreBackend;
use drflow_core::observability::{LogFormat, init_logging};

#[derive(Clone)]
struct AppState {
    control: ControlSurface,
    finder: ExecutionFinder,
    prometheus: PrometheusHandle,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::ExecutionNotFound { .. } | Error::PlanNotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidState { .. }
            | Error::InvalidStateTransition { .. }
            | Error::Conflict { .. }
            | Error::StartInProgress { .. } => StatusCode::CONFLICT,
            Error::InvalidPlan { .. } => StatusCode::BAD_REQUEST,
            Error::ExternalService { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "request failed");
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

fn parse_id(raw: &str) -> std::result::Result<ExecutionId, ApiError> {
    raw.parse().map_err(|e: drflow_core::Error| ApiError {
        status: StatusCode::BAD_REQUEST,
        message: e.to_string(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    plan_id: String,
    execution_type: ExecutionType,
    initiated_by: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    execution_id: ExecutionId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PauseResponse {
    status: &'static str,
    wave_number: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResumeResponse {
    wave_number: u32,
    job_id: String,
    created: bool,
}

impl From<WaveStart> for ResumeResponse {
    fn from(start: WaveStart) -> Self {
        Self {
            wave_number: start.wave_number,
            job_id: start.job_id.to_string(),
            created: start.created,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TerminateResponse {
    execution: Execution,
    #[serde(skip_serializing_if = "Option::is_none")]
    cancel_error: Option<String>,
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.prometheus.render()
}

async fn sweep_handler(
    State(state): State<AppState>,
) -> std::result::Result<Json<SweepSummary>, ApiError> {
    Ok(Json(state.finder.sweep().await?))
}

async fn start_handler(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> std::result::Result<(StatusCode, Json<StartResponse>), ApiError> {
    let execution_id = state
        .control
        .start_execution(
            &request.plan_id,
            request.execution_type,
            &request.initiated_by,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(StartResponse { execution_id })))
}

async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Execution>, ApiError> {
    let execution_id = parse_id(&id)?;
    Ok(Json(state.control.get_execution(&execution_id).await?))
}

async fn pause_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<PauseResponse>, ApiError> {
    let execution_id = parse_id(&id)?;
    let response = match state.control.pause_execution(&execution_id).await? {
        PauseAck::AlreadyPaused { wave } => PauseResponse {
            status: "paused",
            wave_number: wave,
        },
        PauseAck::GateArmed { wave } => PauseResponse {
            status: "pausing",
            wave_number: wave,
        },
    };
    Ok(Json(response))
}

async fn resume_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<ResumeResponse>, ApiError> {
    let execution_id = parse_id(&id)?;
    let started = state.control.resume_execution(&execution_id).await?;
    Ok(Json(started.into()))
}

async fn terminate_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<TerminateResponse>, ApiError> {
    let execution_id = parse_id(&id)?;
    let termination = state.control.terminate_execution(&execution_id).await?;
    Ok(Json(TerminateResponse {
        execution: termination.execution,
        cancel_error: termination.cancel_error,
    }))
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    value.ok_or_else(|| Error::configuration(format!("missing required env var: {name}")))
}

fn build_registry(config: &ServiceConfig) -> Result<Arc<dyn ExecutionRegistry>> {
    let location = required(config.storage_bucket.clone(), "DRFLOW_STORAGE_BUCKET")?;
    let backend = ObjectStoreBackend::from_bucket(&location)?;
    if location == "memory://" {
        tracing::warn!("in-process execution storage; executions are lost on restart");
    } else {
        tracing::info!(location = %location, "execution storage configured");
    }
    Ok(Arc::new(StorageRegistry::new(backend)))
}

async fn load_plans(
    config: &ServiceConfig,
    resolver: &dyn ServerResolver,
) -> Result<InMemoryPlanSource> {
    let Some(path) = &config.plans_path else {
        tracing::warn!("DRFLOW_PLANS_PATH not set; no plans loaded");
        return Ok(InMemoryPlanSource::new());
    };

    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::configuration(format!("failed to read plans from {}: {e}", path.display()))
    })?;
    let plans: Vec<RecoveryPlan> = serde_json::from_str(&raw)
        .map_err(|e| Error::serialization(format!("invalid plans document: {e}")))?;

    for plan in &plans {
        plan.validate()?;
        let conflicts = plan.find_server_conflicts(resolver).await?;
        if let Some(conflict) = conflicts.first() {
            return Err(Error::InvalidPlan {
                plan_id: plan.plan_id.clone(),
                message: format!(
                    "server {} belongs to protection groups {:?} ({} conflicting servers)",
                    conflict.server_id,
                    conflict.protection_group_ids,
                    conflicts.len()
                ),
            });
        }
    }

    tracing::info!(plans = plans.len(), path = %path.display(), "plans loaded");
    InMemoryPlanSource::from_plans(plans)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::from_env()?;
    init_logging(LogFormat::from_name(&config.log_format));

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::configuration(format!("failed to install metrics recorder: {e}")))?;

    let timeout = config.orchestrator.external_call_timeout;
    let mut jobs = HttpRecoveryJobClient::new(
        required(config.job_service_url.clone(), "DRFLOW_JOB_SERVICE_URL")?,
        timeout,
    )?;
    let mut resolver = HttpServerResolver::new(
        required(config.resolver_url.clone(), "DRFLOW_RESOLVER_URL")?,
        timeout,
    )?;
    if let Some(token) = &config.service_token {
        jobs = jobs.with_bearer_token(token.clone());
        resolver = resolver.with_bearer_token(token.clone());
    }

    let registry = build_registry(&config)?;
    let plans = load_plans(&config, &resolver).await?;

    let ctx = OrchestratorContext::new(
        registry,
        Arc::new(resolver),
        Arc::new(jobs),
        Arc::new(plans),
    )
    .with_config(config.orchestrator.clone());

    let finder = ExecutionFinder::new(ctx.clone());
    let state = AppState {
        control: ControlSurface::new(ctx),
        finder: finder.clone(),
        prometheus,
    };

    if config.sweep_enabled {
        tokio::spawn(async move { finder.run_periodic(shutdown_signal()).await });
    }

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/sweep", post(sweep_handler))
        .route("/executions", post(start_handler))
        .route("/executions/:id", get(get_handler))
        .route("/executions/:id/pause", post(pause_handler))
        .route("/executions/:id/resume", post(resume_handler))
        .route("/executions/:id/terminate", post(terminate_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::configuration(format!("failed to bind: {e}")))?;
    tracing::info!(%addr, sweep_enabled = config.sweep_enabled, "drflow service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::configuration(format!("server error: {e}")))
}
