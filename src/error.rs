//! Error types for token issuance.
//!
//! Every failure from a signing step or a remote call surfaces as a [`TokenError`]
//! with the underlying cause preserved as its `source()`.

use thiserror::Error;

use crate::github::api_client::ApiError;

/// Failure modes of the credential-issuance path.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The private key could not be parsed or the JWT could not be signed.
    #[error("Failed to sign GitHub App JWT")]
    Signing(#[source] jsonwebtoken::errors::Error),

    /// The validity window of a new JWT could not be computed from the current time.
    #[error("Clock error while computing JWT validity window: {0}")]
    Clock(String),

    /// The app's installation on the target repository could not be resolved.
    #[error("Failed to find GitHub App installation for {repository}")]
    Lookup {
        repository: String,
        #[source]
        source: ApiError,
    },

    /// The installation access token exchange was rejected or failed in transit.
    #[error("Failed to create installation access token for installation {installation_id}")]
    Exchange {
        installation_id: u64,
        #[source]
        source: ApiError,
    },
}

impl TokenError {
    /// Whether retrying after a backoff may succeed without operator intervention.
    ///
    /// A `404` from the installation lookup means the app is not installed on the
    /// repository, which no amount of retrying fixes.
    pub fn is_retryable(&self) -> bool {
        match self {
            TokenError::Signing(_) | TokenError::Clock(_) => false,
            TokenError::Lookup { source, .. } => !source.is_not_found(),
            TokenError::Exchange { .. } => true,
        }
    }
}
