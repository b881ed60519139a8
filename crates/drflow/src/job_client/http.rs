//! HTTP adapter for the external recovery job service.
//!
//! Endpoints:
//!
//! | Method | Path | Body / response |
//! |--------|------|-----------------|
//! | `POST` | `{base}/jobs` | [`StartJobRequest`] → `{"jobId": "..."}` |
//! | `GET` | `{base}/jobs/{jobId}` | → [`JobSnapshot`] |
//! | `POST` | `{base}/jobs/{jobId}/cancel` | → any 2xx |

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{JobSnapshot, RecoveryJobClient, StartJobRequest};
use crate::error::{Error, Result};
use crate::ids::JobId;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartJobResponse {
    job_id: JobId,
}

/// [`RecoveryJobClient`] over the replication service's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpRecoveryJobClient {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpRecoveryJobClient {
    /// Creates a client against `base_url` with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout.min(Duration::from_secs(5)))
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
        })
    }

    /// Sends `Authorization: Bearer <token>` with every request.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn job_url(&self, job_id: &JobId) -> String {
        format!("{}/jobs/{job_id}", self.base_url)
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let request = match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| Error::external(operation, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::external(
            operation,
            format!("job service returned {status}: {body}"),
        ))
    }
}

#[async_trait]
impl RecoveryJobClient for HttpRecoveryJobClient {
    async fn start_job(&self, request: &StartJobRequest) -> Result<JobId> {
        let url = format!("{}/jobs", self.base_url);
        let response = self
            .send("start_job", self.client.post(&url).json(request))
            .await?;
        let parsed: StartJobResponse = response
            .json()
            .await
            .map_err(|e| Error::external("start_job", format!("invalid response: {e}")))?;
        Ok(parsed.job_id)
    }

    async fn get_job_status(&self, job_id: &JobId) -> Result<JobSnapshot> {
        let response = self
            .send("get_job_status", self.client.get(self.job_url(job_id)))
            .await?;
        response
            .json()
            .await
            .map_err(|e| Error::external("get_job_status", format!("invalid response: {e}")))
    }

    async fn cancel_job(&self, job_id: &JobId) -> Result<()> {
        let url = format!("{}/cancel", self.job_url(job_id));
        self.send("cancel_job", self.client.post(&url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_job_urls_without_double_slashes() -> Result<()> {
        let client = HttpRecoveryJobClient::new("http://drs.local/api/", Duration::from_secs(2))?;
        assert_eq!(
            client.job_url(&JobId::new("drsjob-1")),
            "http://drs.local/api/jobs/drsjob-1"
        );
        Ok(())
    }

    #[test]
    fn start_response_parses_camel_case() {
        let parsed: StartJobResponse = serde_json::from_str(r#"{"jobId":"drsjob-9"}"#).unwrap();
        assert_eq!(parsed.job_id.as_str(), "drsjob-9");
    }
}
