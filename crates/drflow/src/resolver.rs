//! Server resolution for protection groups.
//!
//! Group membership is tag-driven and can change between calls, so the
//! orchestrator re-resolves at every wave start and never caches results
//! across waves.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::ids::ServerId;

/// Resolves a protection group to the servers it currently contains.
#[async_trait]
pub trait ServerResolver: Send + Sync {
    /// Returns the servers currently in the protection group.
    ///
    /// May return a different set on each call.
    async fn resolve_servers(&self, protection_group_id: &str) -> Result<Vec<ServerId>>;
}

/// Resolver backed by a mutable in-process membership table.
///
/// Unknown groups resolve to an empty list. Groups marked with
/// [`StaticServerResolver::fail_group`] return an external service error.
#[derive(Debug, Default)]
pub struct StaticServerResolver {
    groups: RwLock<HashMap<String, Vec<ServerId>>>,
    failing: RwLock<HashSet<String>>,
    delay: Duration,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl StaticServerResolver {
    /// Creates a resolver with no groups.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every resolution, modelling a slow membership service.
    #[must_use]
    pub fn with_resolve_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Replaces the membership of a group.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_group<I, S>(&self, protection_group_id: &str, servers: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let servers = servers.into_iter().map(ServerId::new).collect();
        self.groups
            .write()
            .map_err(poison_err)?
            .insert(protection_group_id.to_string(), servers);
        Ok(())
    }

    /// Makes resolution of a group fail until cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_group(&self, protection_group_id: &str, failing: bool) -> Result<()> {
        let mut set = self.failing.write().map_err(poison_err)?;
        if failing {
            set.insert(protection_group_id.to_string());
        } else {
            set.remove(protection_group_id);
        }
        Ok(())
    }
}

#[async_trait]
impl ServerResolver for StaticServerResolver {
    async fn resolve_servers(&self, protection_group_id: &str) -> Result<Vec<ServerId>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self
            .failing
            .read()
            .map_err(poison_err)?
            .contains(protection_group_id)
        {
            return Err(Error::external(
                "resolve_servers",
                format!("resolution of {protection_group_id} failed"),
            ));
        }
        let groups = self.groups.read().map_err(poison_err)?;
        Ok(groups.get(protection_group_id).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveResponse {
    server_ids: Vec<ServerId>,
}

/// Resolver that queries an HTTP membership service.
///
/// `GET {base_url}/protection-groups/{id}/servers` must return
/// `{"serverIds": ["..."]}`.
#[derive(Debug, Clone)]
pub struct HttpServerResolver {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpServerResolver {
    /// Creates a resolver against `base_url` with the given request timeout.
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
}

#[async_trait]
impl ServerResolver for HttpServerResolver {
    async fn resolve_servers(&self, protection_group_id: &str) -> Result<Vec<ServerId>> {
        let url = format!(
            "{}/protection-groups/{protection_group_id}/servers",
            self.base_url
        );
        let mut request = self.client.get(&url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::external("resolve_servers", e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::external(
                "resolve_servers",
                format!("membership service returned {status}: {body}"),
            ));
        }

        let parsed: ResolveResponse = response
            .json()
            .await
            .map_err(|e| Error::external("resolve_servers", format!("invalid response: {e}")))?;
        Ok(parsed.server_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_reflects_membership_changes() -> Result<()> {
        let resolver = StaticServerResolver::new();
        resolver.set_group("pg-1", ["s-1", "s-2"])?;
        assert_eq!(resolver.resolve_servers("pg-1").await?.len(), 2);

        resolver.set_group("pg-1", ["s-3"])?;
        assert_eq!(
            resolver.resolve_servers("pg-1").await?,
            vec![ServerId::from("s-3")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn unknown_group_resolves_empty() -> Result<()> {
        let resolver = StaticServerResolver::new();
        assert!(resolver.resolve_servers("nope").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failing_group_returns_external_error() -> Result<()> {
        let resolver = StaticServerResolver::new();
        resolver.fail_group("pg-1", true)?;
        let err = resolver.resolve_servers("pg-1").await.unwrap_err();
        assert!(err.is_transient());

        resolver.fail_group("pg-1", false)?;
        assert!(resolver.resolve_servers("pg-1").await.is_ok());
        Ok(())
    }

    #[test]
    fn http_resolver_trims_trailing_slash() -> Result<()> {
        let resolver = HttpServerResolver::new("http://membership.local/", Duration::from_secs(2))?;
        assert_eq!(resolver.base_url, "http://membership.local");
        Ok(())
    }
}
