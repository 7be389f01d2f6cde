//! App JWT signing for GitHub App authentication.
//!
//! GitHub Apps use two types of authentication:
//! 1. App JWT - Short-lived JWT signed with the app's private key (for app-level operations)
//! 2. Installation Access Token - Token for a specific installation (for repo operations)
//!
//! This module owns the first. [`CredentialSource`] keeps the last JWT it signed and
//! reuses it until it is about to expire.

use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::clock::{
    is_fresh, truncate_to_seconds, Clock, BEARER_BACKDATE, BEARER_GRACE, BEARER_LIFETIME,
};
use super::redaction::{SecretKind, SecretSink};
use crate::error::TokenError;

/// JWT claims for GitHub App authentication.
/// GitHub requires: iat (issued at), exp (expiration), iss (issuer = app_id)
#[derive(Debug, Serialize, Deserialize)]
pub struct GitHubAppClaims {
    /// Issued at time (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issuer - the GitHub App ID
    pub iss: String,
}

/// A signed app JWT and its validity window.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerAssertion {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for BearerAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerAssertion")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Sign a GitHub App JWT valid from `issued_at` to `expires_at`.
///
/// The JWT is signed with RS256 (RSA-SHA256) using the app's private key. Both PKCS#1
/// (`BEGIN RSA PRIVATE KEY`) and PKCS#8 (`BEGIN PRIVATE KEY`) PEM are accepted.
pub fn generate_app_jwt(
    app_id: &str,
    private_key_pem: &str,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<String, TokenError> {
    let claims = GitHubAppClaims {
        iat: issued_at.timestamp(),
        exp: expires_at.timestamp(),
        iss: app_id.to_string(),
    };

    let encoding_key =
        EncodingKey::from_rsa_pem(private_key_pem.as_bytes()).map_err(TokenError::Signing)?;

    encode(&Header::new(Algorithm::RS256), &claims, &encoding_key).map_err(TokenError::Signing)
}

/// Owns the app identity and the cached app JWT.
pub struct CredentialSource {
    app_id: String,
    private_key_pem: String,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn SecretSink>,
    cached: Option<BearerAssertion>,
}

impl CredentialSource {
    pub fn new(
        app_id: impl Into<String>,
        private_key_pem: impl Into<String>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn SecretSink>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            private_key_pem: private_key_pem.into(),
            clock,
            sink,
            cached: None,
        }
    }

    /// The JWT currently held, if any.
    #[cfg(test)]
    pub(crate) fn cached(&self) -> Option<&BearerAssertion> {
        self.cached.as_ref()
    }

    /// Return a JWT with at least 30 seconds left, signing a new one if needed.
    ///
    /// A new JWT is issued 30 seconds in the past (whole seconds) and expires two
    /// minutes after that. On failure the previously cached JWT is kept.
    pub fn ensure_bearer_assertion(&mut self) -> Result<BearerAssertion, TokenError> {
        let now = self.clock.now();

        if let Some(cached) = &self.cached {
            if is_fresh(cached.expires_at, now, BEARER_GRACE) {
                debug!(app_id = %self.app_id, expires_at = %cached.expires_at, "Reusing cached app JWT");
                return Ok(cached.clone());
            }
        }

        let issued_at = now
            .checked_sub_signed(BEARER_BACKDATE)
            .map(truncate_to_seconds)
            .ok_or_else(|| TokenError::Clock(format!("cannot back-date {}", now)))?;
        let expires_at = issued_at
            .checked_add_signed(BEARER_LIFETIME)
            .ok_or_else(|| TokenError::Clock(format!("cannot compute expiry from {}", issued_at)))?;

        let token = generate_app_jwt(&self.app_id, &self.private_key_pem, issued_at, expires_at)?;
        self.sink.mask(SecretKind::BearerAssertion, &token);
        debug!(app_id = %self.app_id, %expires_at, "Signed new app JWT");

        let assertion = BearerAssertion {
            token,
            issued_at,
            expires_at,
        };
        self.cached = Some(assertion.clone());
        Ok(assertion)
    }
}
