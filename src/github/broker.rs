//! Installation access token broker.
//!
//! Turns an app identity and a repository into an installation access token while
//! keeping the number of remote calls down:
//! - the installation is looked up once and cached for the broker's lifetime
//! - the installation token is reused until it has less than 60 seconds left
//! - the app JWT is signed only right before a remote call that needs it

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::api_client::{GitHubApi, Installation, InstallationToken, InstallationTokenOptions};
use super::clock::{is_fresh, Clock, TOKEN_GRACE};
use super::redaction::{SecretKind, SecretSink};
use super::token_manager::CredentialSource;
use crate::config::RepositoryRef;
use crate::error::TokenError;

/// Mutable broker state. Guarded as a whole so a refresh is never observed half-done.
struct BrokerState {
    credentials: CredentialSource,
    installation: Option<Installation>,
    token: Option<InstallationToken>,
}

/// Issues installation access tokens for one repository.
///
/// Concurrent callers are serialized: while one caller refreshes, the others wait and
/// then reuse the token it produced.
pub struct TokenBroker {
    api: Arc<dyn GitHubApi>,
    repository: RepositoryRef,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn SecretSink>,
    state: Mutex<BrokerState>,
}

impl TokenBroker {
    pub fn new(
        api: Arc<dyn GitHubApi>,
        credentials: CredentialSource,
        repository: RepositoryRef,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn SecretSink>,
    ) -> Self {
        Self {
            api,
            repository,
            clock,
            sink,
            state: Mutex::new(BrokerState {
                credentials,
                installation: None,
                token: None,
            }),
        }
    }

    /// Return an installation access token with at least 60 seconds left.
    pub async fn get_app_token(&self) -> Result<String, TokenError> {
        let mut state = self.state.lock().await;

        let installation_id = self.resolve_installation(&mut state).await?;

        if let Some(token) = &state.token {
            if is_fresh(token.expires_at, self.clock.now(), TOKEN_GRACE) {
                debug!(installation_id, expires_at = %token.expires_at, "Reusing cached installation token");
                return Ok(token.token.clone());
            }
        }

        let bearer = state.credentials.ensure_bearer_assertion()?;

        info!(installation_id, repository = %self.repository, "Creating installation access token");
        let token = self
            .api
            .create_installation_token(
                &bearer.token,
                installation_id,
                &InstallationTokenOptions::default(),
            )
            .await
            .map_err(|source| TokenError::Exchange {
                installation_id,
                source,
            })?;

        self.sink.mask(SecretKind::InstallationToken, &token.token);
        debug!(installation_id, expires_at = %token.expires_at, "Cached new installation token");

        let value = token.token.clone();
        state.token = Some(token);
        Ok(value)
    }

    /// The installation id, looking it up on first use.
    async fn resolve_installation(&self, state: &mut BrokerState) -> Result<u64, TokenError> {
        if let Some(installation) = &state.installation {
            return Ok(installation.id);
        }

        let bearer = state.credentials.ensure_bearer_assertion()?;

        info!(repository = %self.repository, "Looking up GitHub App installation");
        let installation = self
            .api
            .find_repository_installation(&bearer.token, &self.repository)
            .await
            .map_err(|source| TokenError::Lookup {
                repository: self.repository.to_string(),
                source,
            })?;

        debug!(
            installation_id = installation.id,
            account = installation.account.as_ref().map(|a| a.login.as_str()),
            "Resolved installation"
        );

        let id = installation.id;
        state.installation = Some(installation);
        Ok(id)
    }

    /// The cached installation token, if any.
    #[cfg(test)]
    pub(crate) async fn cached_token(&self) -> Option<InstallationToken> {
        self.state.lock().await.token.clone()
    }

    /// The cached installation, if any.
    #[cfg(test)]
    pub(crate) async fn cached_installation(&self) -> Option<Installation> {
        self.state.lock().await.installation.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::api_client::ApiError;
    use crate::github::clock::tests::ManualClock;
    use crate::github::token_manager::tests::{RecordingSink, TEST_PRIVATE_KEY};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use parking_lot::Mutex as SyncMutex;
    use reqwest::StatusCode;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Lookup { bearer: String, repository: String },
        Exchange { bearer: String, installation_id: u64 },
    }

    /// Scripted GitHub API: each call pops the next queued response.
    #[derive(Default)]
    struct FakeGitHub {
        installations: SyncMutex<VecDeque<Result<Installation, ApiError>>>,
        tokens: SyncMutex<VecDeque<Result<InstallationToken, ApiError>>>,
        calls: SyncMutex<Vec<Call>>,
    }

    impl FakeGitHub {
        fn push_installation(&self, result: Result<Installation, ApiError>) {
            self.installations.lock().push_back(result);
        }

        fn push_token(&self, result: Result<InstallationToken, ApiError>) {
            self.tokens.lock().push_back(result);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn lookups(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Lookup { .. }))
                .count()
        }

        fn exchanges(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Exchange { .. }))
                .count()
        }
    }

    #[async_trait]
    impl GitHubApi for FakeGitHub {
        async fn find_repository_installation(
            &self,
            bearer: &str,
            repository: &RepositoryRef,
        ) -> Result<Installation, ApiError> {
            self.calls.lock().push(Call::Lookup {
                bearer: bearer.to_string(),
                repository: repository.to_string(),
            });
            self.installations
                .lock()
                .pop_front()
                .expect("unexpected installation lookup")
        }

        async fn create_installation_token(
            &self,
            bearer: &str,
            installation_id: u64,
            options: &InstallationTokenOptions,
        ) -> Result<InstallationToken, ApiError> {
            assert!(options.repositories.is_none() && options.permissions.is_none());
            self.calls.lock().push(Call::Exchange {
                bearer: bearer.to_string(),
                installation_id,
            });
            self.tokens
                .lock()
                .pop_front()
                .expect("unexpected token exchange")
        }
    }

    struct Harness {
        broker: Arc<TokenBroker>,
        api: Arc<FakeGitHub>,
        clock: Arc<ManualClock>,
        sink: Arc<RecordingSink>,
    }

    fn start() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn harness_with_key(key: &str) -> Harness {
        let api = Arc::new(FakeGitHub::default());
        let clock = Arc::new(ManualClock::new(start()));
        let sink = Arc::new(RecordingSink::default());
        let credentials = CredentialSource::new("12345", key, clock.clone(), sink.clone());
        let repository: RepositoryRef = "octo-org/octo-repo".parse().unwrap();
        let broker = Arc::new(TokenBroker::new(
            api.clone(),
            credentials,
            repository,
            clock.clone(),
            sink.clone(),
        ));
        Harness {
            broker,
            api,
            clock,
            sink,
        }
    }

    fn harness() -> Harness {
        harness_with_key(TEST_PRIVATE_KEY)
    }

    fn installation(id: u64) -> Installation {
        Installation { id, account: None }
    }

    fn token(value: &str, expires_at: DateTime<Utc>) -> InstallationToken {
        InstallationToken {
            token: value.to_string(),
            expires_at,
        }
    }

    fn transport_error() -> ApiError {
        ApiError::Status {
            status: StatusCode::BAD_GATEWAY,
            body: "upstream unavailable".to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_call_resolves_and_second_call_is_cached() {
        let h = harness();
        h.api.push_installation(Ok(installation(42)));
        h.api
            .push_token(Ok(token("ghs_abc", start() + Duration::seconds(3600))));

        assert_eq!(h.broker.get_app_token().await.unwrap(), "ghs_abc");
        assert_eq!(h.api.calls().len(), 2);

        assert_eq!(h.broker.get_app_token().await.unwrap(), "ghs_abc");
        assert_eq!(h.api.calls().len(), 2);

        match &h.api.calls()[1] {
            Call::Exchange {
                installation_id, ..
            } => assert_eq!(*installation_id, 42),
            other => panic!("expected exchange, got {:?}", other),
        }
        match &h.api.calls()[0] {
            Call::Lookup { repository, .. } => assert_eq!(repository, "octo-org/octo-repo"),
            other => panic!("expected lookup, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_token_within_grace_window_is_refreshed_once() {
        let h = harness();
        h.api.push_installation(Ok(installation(42)));
        h.api
            .push_token(Ok(token("ghs_old", start() + Duration::seconds(30))));
        h.api
            .push_token(Ok(token("ghs_new", start() + Duration::seconds(3600))));

        // expires in 30s, inside the 60s grace window
        assert_eq!(h.broker.get_app_token().await.unwrap(), "ghs_old");
        assert_eq!(h.api.exchanges(), 1);

        assert_eq!(h.broker.get_app_token().await.unwrap(), "ghs_new");
        assert_eq!(h.api.exchanges(), 2);
        assert_eq!(h.api.lookups(), 1);
    }

    #[tokio::test]
    async fn test_exchange_skipped_while_token_has_more_than_grace_left() {
        let h = harness();
        h.api.push_installation(Ok(installation(42)));
        h.api
            .push_token(Ok(token("ghs_abc", start() + Duration::seconds(600))));
        h.api
            .push_token(Ok(token("ghs_def", start() + Duration::seconds(4000))));

        h.broker.get_app_token().await.unwrap();

        h.clock.advance(Duration::seconds(540));
        assert_eq!(h.broker.get_app_token().await.unwrap(), "ghs_abc");
        assert_eq!(h.api.exchanges(), 1);

        h.clock.advance(Duration::seconds(1));
        assert_eq!(h.broker.get_app_token().await.unwrap(), "ghs_def");
        assert_eq!(h.api.exchanges(), 2);
    }

    #[tokio::test]
    async fn test_installation_is_looked_up_at_most_once() {
        let h = harness();
        h.api.push_installation(Ok(installation(7)));
        for i in 0..5 {
            h.api.push_token(Ok(token(&format!("ghs_{}", i), start())));
        }

        for i in 0..5 {
            assert_eq!(h.broker.get_app_token().await.unwrap(), format!("ghs_{}", i));
        }

        assert_eq!(h.api.lookups(), 1);
        assert_eq!(h.api.exchanges(), 5);
        assert_eq!(h.broker.cached_installation().await, Some(installation(7)));
    }

    #[tokio::test]
    async fn test_lookup_failure_is_reported_and_not_cached() {
        let h = harness();
        h.api.push_installation(Err(transport_error()));

        let err = h.broker.get_app_token().await.unwrap_err();

        match err {
            TokenError::Lookup { repository, source } => {
                assert_eq!(repository, "octo-org/octo-repo");
                assert!(matches!(source, ApiError::Status { status, .. } if status == StatusCode::BAD_GATEWAY));
            }
            other => panic!("expected lookup error, got {:?}", other),
        }
        assert_eq!(h.api.exchanges(), 0);
        assert!(h.broker.cached_installation().await.is_none());

        // the next call looks the installation up again
        h.api.push_installation(Ok(installation(42)));
        h.api
            .push_token(Ok(token("ghs_abc", start() + Duration::seconds(3600))));
        assert_eq!(h.broker.get_app_token().await.unwrap(), "ghs_abc");
        assert_eq!(h.api.lookups(), 2);
    }

    #[tokio::test]
    async fn test_invalid_private_key_fails_before_any_remote_call() {
        let h = harness_with_key("this is not a PEM key");

        let err = h.broker.get_app_token().await.unwrap_err();

        assert!(matches!(err, TokenError::Signing(_)));
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_exchange_keeps_stale_token() {
        let h = harness();
        h.api.push_installation(Ok(installation(42)));
        let stale = token("ghs_stale", start() + Duration::seconds(90));
        h.api.push_token(Ok(stale.clone()));
        h.api.push_token(Err(transport_error()));
        h.api
            .push_token(Ok(token("ghs_fresh", start() + Duration::seconds(3600))));

        h.broker.get_app_token().await.unwrap();
        h.clock.advance(Duration::seconds(45));

        let err = h.broker.get_app_token().await.unwrap_err();
        assert!(matches!(err, TokenError::Exchange { installation_id: 42, .. }));
        assert_eq!(h.broker.cached_token().await, Some(stale));

        assert_eq!(h.broker.get_app_token().await.unwrap(), "ghs_fresh");
        assert_eq!(h.api.exchanges(), 3);
    }

    #[tokio::test]
    async fn test_no_signing_while_token_is_fresh() {
        let h = harness();
        h.api.push_installation(Ok(installation(42)));
        h.api
            .push_token(Ok(token("ghs_abc", start() + Duration::seconds(3600))));

        h.broker.get_app_token().await.unwrap();
        assert_eq!(h.sink.count(SecretKind::BearerAssertion), 1);

        // well past the JWT's own expiry, token still fresh
        h.clock.advance(Duration::seconds(1800));
        h.broker.get_app_token().await.unwrap();
        assert_eq!(h.sink.count(SecretKind::BearerAssertion), 1);
    }

    #[tokio::test]
    async fn test_exchange_always_uses_a_fresh_jwt() {
        let h = harness();
        h.api.push_installation(Ok(installation(42)));
        h.api
            .push_token(Ok(token("ghs_one", start() + Duration::seconds(300))));
        h.api
            .push_token(Ok(token("ghs_two", start() + Duration::seconds(3600))));

        h.broker.get_app_token().await.unwrap();
        let calls = h.api.calls();
        let (lookup_bearer, first_bearer) = match (&calls[0], &calls[1]) {
            (Call::Lookup { bearer: a, .. }, Call::Exchange { bearer: b, .. }) => {
                (a.clone(), b.clone())
            }
            other => panic!("unexpected call order {:?}", other),
        };
        // lookup and exchange happen back to back and share one JWT
        assert_eq!(lookup_bearer, first_bearer);

        // the first JWT expired long ago; the refresh must sign a new one first
        h.clock.advance(Duration::seconds(250));
        h.broker.get_app_token().await.unwrap();

        let second_bearer = match &h.api.calls()[2] {
            Call::Exchange { bearer, .. } => bearer.clone(),
            other => panic!("expected exchange, got {:?}", other),
        };
        assert_ne!(first_bearer, second_bearer);
        assert_eq!(h.sink.count(SecretKind::BearerAssertion), 2);
    }

    #[tokio::test]
    async fn test_new_tokens_are_masked() {
        let h = harness();
        h.api.push_installation(Ok(installation(42)));
        h.api
            .push_token(Ok(token("ghs_abc", start() + Duration::seconds(3600))));

        h.broker.get_app_token().await.unwrap();
        h.broker.get_app_token().await.unwrap();

        let masked = h.sink.masked.lock().clone();
        let tokens: Vec<_> = masked
            .iter()
            .filter(|(k, _)| *k == SecretKind::InstallationToken)
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(tokens, vec!["ghs_abc"]);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_exchange() {
        let h = harness();
        h.api.push_installation(Ok(installation(42)));
        h.api
            .push_token(Ok(token("ghs_abc", start() + Duration::seconds(3600))));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let broker = h.broker.clone();
                tokio::spawn(async move { broker.get_app_token().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "ghs_abc");
        }
        assert_eq!(h.api.lookups(), 1);
        assert_eq!(h.api.exchanges(), 1);
    }
}
