//! Orchestrator and service configuration.
//!
//! Everything has a sensible default; `from_env` overlays `DRFLOW_*`
//! environment variables and rejects values that are present but malformed.
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `DRFLOW_EXTERNAL_CALL_TIMEOUT_SECS` | [`OrchestratorConfig::external_call_timeout`] | 30 |
//! | `DRFLOW_SWEEP_INTERVAL_SECS` | [`OrchestratorConfig::sweep_interval`] | 60 |
//! | `DRFLOW_MAX_CONCURRENT_POLLS` | [`OrchestratorConfig::max_concurrent_polls`] | 16 |
//! | `DRFLOW_POLL_TIMEOUT_SECS` | [`OrchestratorConfig::poll_timeout`] | 120 |
//! | `DRFLOW_REGISTRY_RETRY_LIMIT` | [`OrchestratorConfig::registry_retry_limit`] | 5 |
//! | `DRFLOW_START_CLAIM_TTL_SECS` | [`OrchestratorConfig::start_claim_ttl`] | 120 |
//! | `DRFLOW_CLAIM_WAIT_INTERVAL_MS` | [`OrchestratorConfig::claim_wait_interval`] | 250 |
//! | `DRFLOW_PENDING_HANDOFF_GRACE_SECS` | [`OrchestratorConfig::pending_handoff_grace`] | 120 |
//! | `DRFLOW_DEFAULT_FAILURE_POLICY` | [`OrchestratorConfig::default_failure_policy`] | `any_launched` |

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::plan::WaveFailurePolicy;

/// Tuning for the orchestration core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Bound on every call to the job service or the server resolver.
    pub external_call_timeout: Duration,
    /// Finder cadence when the sweep is self-scheduled.
    pub sweep_interval: Duration,
    /// Maximum concurrent polls in one sweep.
    pub max_concurrent_polls: usize,
    /// Bound on one poll inside a sweep.
    pub poll_timeout: Duration,
    /// Read-modify-write attempts before a registry conflict is surfaced.
    pub registry_retry_limit: u32,
    /// Age after which a wave start claim is considered abandoned.
    pub start_claim_ttl: Duration,
    /// Delay between re-reads while waiting on another caller's start claim.
    pub claim_wait_interval: Duration,
    /// Age after which a `PENDING` execution's hand-off is presumed lost.
    pub pending_handoff_grace: Duration,
    /// Partial-failure policy for plans that do not set one.
    pub default_failure_policy: WaveFailurePolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            external_call_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            max_concurrent_polls: 16,
            poll_timeout: Duration::from_secs(120),
            registry_retry_limit: 5,
            start_claim_ttl: Duration::from_secs(120),
            claim_wait_interval: Duration::from_millis(250),
            pending_handoff_grace: Duration::from_secs(120),
            default_failure_policy: WaveFailurePolicy::AnyLaunched,
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from `DRFLOW_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is present but cannot be parsed, or
    /// if the result fails [`OrchestratorConfig::validate`].
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = env_u64("DRFLOW_EXTERNAL_CALL_TIMEOUT_SECS")? {
            config.external_call_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("DRFLOW_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(width) = env_usize("DRFLOW_MAX_CONCURRENT_POLLS")? {
            config.max_concurrent_polls = width;
        }
        if let Some(secs) = env_u64("DRFLOW_POLL_TIMEOUT_SECS")? {
            config.poll_timeout = Duration::from_secs(secs);
        }
        if let Some(limit) = env_u32("DRFLOW_REGISTRY_RETRY_LIMIT")? {
            config.registry_retry_limit = limit;
        }
        if let Some(secs) = env_u64("DRFLOW_START_CLAIM_TTL_SECS")? {
            config.start_claim_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("DRFLOW_CLAIM_WAIT_INTERVAL_MS")? {
            config.claim_wait_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("DRFLOW_PENDING_HANDOFF_GRACE_SECS")? {
            config.pending_handoff_grace = Duration::from_secs(secs);
        }
        if let Some(policy) = env_string("DRFLOW_DEFAULT_FAILURE_POLICY") {
            config.default_failure_policy = policy.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first unusable field.
    pub fn validate(&self) -> Result<()> {
        if self.external_call_timeout.is_zero() {
            return Err(Error::configuration("external_call_timeout must be positive"));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::configuration("sweep_interval must be positive"));
        }
        if self.max_concurrent_polls == 0 {
            return Err(Error::configuration("max_concurrent_polls must be at least 1"));
        }
        if self.poll_timeout < self.external_call_timeout {
            return Err(Error::configuration(
                "poll_timeout must be at least external_call_timeout",
            ));
        }
        if self.registry_retry_limit == 0 {
            return Err(Error::configuration("registry_retry_limit must be at least 1"));
        }
        // A claim holder makes two bounded calls: group resolution, then start_job.
        if self.start_claim_ttl <= self.external_call_timeout * 2 {
            return Err(Error::configuration(
                "start_claim_ttl must exceed twice external_call_timeout",
            ));
        }
        if self.claim_wait_interval.is_zero() {
            return Err(Error::configuration("claim_wait_interval must be positive"));
        }
        Ok(())
    }
}

/// Settings read by the `drflow-service` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// HTTP listen port (`DRFLOW_PORT`, default 8080).
    pub port: u16,
    /// Base URL of the recovery job service (`DRFLOW_JOB_SERVICE_URL`).
    pub job_service_url: Option<String>,
    /// Base URL of the protection-group membership service (`DRFLOW_RESOLVER_URL`).
    pub resolver_url: Option<String>,
    /// Execution storage: `gs://bucket`, a bare bucket name, or `memory://`
    /// (`DRFLOW_STORAGE_BUCKET`).
    pub storage_bucket: Option<String>,
    /// Bearer token sent to both services (`DRFLOW_SERVICE_TOKEN`).
    pub service_token: Option<String>,
    /// JSON file holding an array of recovery plans (`DRFLOW_PLANS_PATH`).
    pub plans_path: Option<PathBuf>,
    /// `json` or `pretty` (`DRFLOW_LOG_FORMAT`).
    pub log_format: String,
    /// Run the Finder in-process on `sweep_interval` (`DRFLOW_SWEEP_ENABLED`, default true).
    pub sweep_enabled: bool,
    /// Orchestrator tuning.
    pub orchestrator: OrchestratorConfig,
}

impl ServiceConfig {
    /// Loads service settings from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            port: env_u16("DRFLOW_PORT")?.unwrap_or(8080),
            job_service_url: env_string("DRFLOW_JOB_SERVICE_URL"),
            resolver_url: env_string("DRFLOW_RESOLVER_URL"),
            storage_bucket: env_string("DRFLOW_STORAGE_BUCKET"),
            service_token: env_string("DRFLOW_SERVICE_TOKEN"),
            plans_path: env_string("DRFLOW_PLANS_PATH").map(PathBuf::from),
            log_format: env_string("DRFLOW_LOG_FORMAT").unwrap_or_else(|| "pretty".to_string()),
            sweep_enabled: env_bool("DRFLOW_SWEEP_ENABLED")?.unwrap_or(true),
            orchestrator: OrchestratorConfig::from_env()?,
        })
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_env<T>(name: &str, kind: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<T>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a {kind}: {e}")))
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    parse_env(name, "u16")
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    parse_env(name, "u32")
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    parse_env(name, "u64")
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    parse_env(name, "usize")
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.default_failure_policy, WaveFailurePolicy::AnyLaunched);
    }

    #[test]
    fn rejects_claim_ttl_shorter_than_call_timeout() {
        let config = OrchestratorConfig {
            start_claim_ttl: Duration::from_secs(10),
            ..OrchestratorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn claim_ttl_must_cover_resolution_and_start() {
        let config = OrchestratorConfig {
            external_call_timeout: Duration::from_millis(100),
            poll_timeout: Duration::from_millis(100),
            start_claim_ttl: Duration::from_millis(150),
            ..OrchestratorConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("twice external_call_timeout"), "{err}");

        let config = OrchestratorConfig {
            start_claim_ttl: Duration::from_millis(201),
            ..config
        };
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_fan_out() {
        let config = OrchestratorConfig {
            max_concurrent_polls: 0,
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("X", "YES").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn config_deserializes_with_missing_fields() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"max_concurrent_polls": 4}"#).unwrap();
        assert_eq!(config.max_concurrent_polls, 4);
        assert_eq!(config.registry_retry_limit, 5);
    }
}
