//! Observability infrastructure for drflow.
//!
//! Structured logging with consistent spans. Every orchestrator component
//! logs through `tracing`; this module owns subscriber installation and the
//! span constructor used around per-execution work.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name, falling back to [`LogFormat::Pretty`].
    #[must_use]
    pub fn from_name(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `drflow=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for work performed against a single execution.
///
/// # Example
///
/// ```rust
/// use drflow_core::observability::execution_span;
///
/// let span = execution_span("poll", "01J0000000000000000000000", "plan-web-tier");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn execution_span(operation: &str, execution_id: &str, plan_id: &str) -> Span {
    tracing::info_span!(
        "execution",
        op = operation,
        execution_id = execution_id,
        plan_id = plan_id,
    )
}
