//! A live client for one agent instance.

use std::fmt;

use cairn_auth::BearerToken;
use cairn_core::{CairnResult, ResourceLocator};
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::AgentError;

/// An HTTP client that trusts exactly one agent's TLS root and
/// authenticates with a bearer token minted for that agent.
pub struct AgentClient {
    instance: ResourceLocator,
    endpoint: String,
    http: reqwest::Client,
    token: BearerToken,
}

impl AgentClient {
    pub fn new(
        instance: ResourceLocator,
        endpoint: impl Into<String>,
        http: reqwest::Client,
        token: BearerToken,
    ) -> Self {
        Self {
            instance,
            endpoint: endpoint.into(),
            http,
            token,
        }
    }

    pub fn instance(&self) -> &ResourceLocator {
        &self.instance
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn token(&self) -> &BearerToken {
        &self.token
    }

    /// When the bearer token, and with it this client, stops being usable.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.token.claims.expires_at()
    }

    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// A request to `path` on the agent, carrying the bearer token.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.url(path))
            .bearer_auth(&self.token.value)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> CairnResult<T> {
        let response = self
            .request(Method::GET, path)
            .send()
            .await
            .map_err(AgentError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read response body".to_string());
            return Err(AgentError::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        debug!(agent = %self.instance, path, status = status.as_u16(), "Agent call succeeded");
        Ok(response.json().await.map_err(AgentError::from)?)
    }
}

impl fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentClient")
            .field("instance", &self.instance)
            .field("endpoint", &self.endpoint)
            .field("expires_at", &self.expires_at())
            .finish_non_exhaustive()
    }
}
