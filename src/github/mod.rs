//! GitHub App authentication.
//!
//! This module provides:
//! - JWT generation and caching for GitHub App authentication
//! - Installation lookup and installation access token exchange
//! - Secret masking for GitHub Actions logs

pub mod api_client;
pub mod broker;
pub mod clock;
pub mod redaction;
pub mod token_manager;

pub use api_client::{GitHubApi, GitHubClient};
pub use broker::TokenBroker;
pub use token_manager::{generate_app_jwt, CredentialSource};

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::AppConfig;
use clock::{Clock, SystemClock};
use redaction::SecretSink;

/// Wire a broker to the real GitHub API and the wall clock.
pub fn build_broker(config: &AppConfig, sink: Arc<dyn SecretSink>) -> Result<TokenBroker> {
    let api = GitHubClient::new(&config.api_url, config.timeout)
        .context("Failed to create GitHub API client")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let credentials = CredentialSource::new(
        config.app_id.clone(),
        config.private_key.clone(),
        clock.clone(),
        sink.clone(),
    );

    Ok(TokenBroker::new(
        Arc::new(api),
        credentials,
        config.repository.clone(),
        clock,
        sink,
    ))
}
