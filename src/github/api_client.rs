//! GitHub API client for the two App endpoints token issuance needs.
//!
//! Both calls authenticate with the app JWT (not an installation token):
//! - `GET /repos/{owner}/{repo}/installation` finds the app's installation on a repository
//! - `POST /app/installations/{id}/access_tokens` mints an installation access token

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::RepositoryRef;

/// Public GitHub API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Errors from the GitHub API transport.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("GitHub API request timed out")]
    Timeout,

    #[error("GitHub API request failed")]
    Http(#[source] reqwest::Error),

    #[error("GitHub API error: {status} - {body}")]
    Status { status: StatusCode, body: String },

    #[error("Failed to parse GitHub API response")]
    Decode(#[source] reqwest::Error),

    #[error("Invalid GitHub API request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err)
        } else {
            ApiError::Http(err)
        }
    }
}

/// The app's installation on an account or repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    pub id: u64,
    #[serde(default)]
    pub account: Option<InstallationAccount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationAccount {
    pub login: String,
}

/// An installation access token.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for InstallationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Request body for the access token endpoint. Empty options serialize to `{}` and
/// produce a token with all of the installation's repositories and permissions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallationTokenOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repositories: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<serde_json::Value>,
}

/// The remote operations the token broker depends on.
#[async_trait]
pub trait GitHubApi: Send + Sync {
    /// Find the app's installation on `repository`, authenticating with `bearer`.
    async fn find_repository_installation(
        &self,
        bearer: &str,
        repository: &RepositoryRef,
    ) -> Result<Installation, ApiError>;

    /// Mint an access token for `installation_id`, authenticating with `bearer`.
    async fn create_installation_token(
        &self,
        bearer: &str,
        installation_id: u64,
        options: &InstallationTokenOptions,
    ) -> Result<InstallationToken, ApiError>;
}

/// reqwest-backed [`GitHubApi`].
pub struct GitHubClient {
    api_url: String,
    client: reqwest::Client,
}

impl GitHubClient {
    /// Create a client for `api_url` whose requests give up after `timeout`.
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("get-app-token/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(ApiError::Http)?;

        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn request(&self, method: reqwest::Method, url: &str, bearer: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", bearer))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl GitHubApi for GitHubClient {
    async fn find_repository_installation(
        &self,
        bearer: &str,
        repository: &RepositoryRef,
    ) -> Result<Installation, ApiError> {
        let url = format!(
            "{}/repos/{}/{}/installation",
            self.api_url, repository.owner, repository.name
        );
        debug!(%url, "Looking up repository installation");

        self.send(self.request(reqwest::Method::GET, &url, bearer))
            .await
    }

    async fn create_installation_token(
        &self,
        bearer: &str,
        installation_id: u64,
        options: &InstallationTokenOptions,
    ) -> Result<InstallationToken, ApiError> {
        if installation_id == 0 {
            return Err(ApiError::InvalidRequest(
                "installation id must be non-zero".to_string(),
            ));
        }

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url, installation_id
        );
        debug!(%url, "Requesting installation access token");

        self.send(self.request(reqwest::Method::POST, &url, bearer).json(options))
            .await
    }
}
