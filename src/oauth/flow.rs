//! Per-connection authorization-code flow
//!
//! ```text
//! idle ──begin_auth──▶ awaiting_authorization ──callback──▶ awaiting_callback
//!                                                              │
//!                                          exchange ok ◀───────┴──▶ exchange failed
//!                                          authorized                failed
//! ```
//!
//! The pending `state` lives in a single slot owned by the flow, so a new
//! `begin_auth` replaces any earlier one and a late callback carrying the old
//! value fails with [`Error::StateMismatch`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use url::Url;

use super::TokenInfo;
use crate::{Error, Result};

/// The backend's authorization server, as the flow sees it
#[async_trait]
pub trait AuthorizationServer: Send + Sync {
    /// Authorization endpoint URL (may require discovery)
    async fn authorization_endpoint(&self) -> Result<String>;

    /// OAuth client id presented to the server
    async fn client_id(&self) -> Result<String>;

    /// Scopes to request
    fn scopes(&self) -> Vec<String>;

    /// Exchange an authorization code for credentials
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenInfo>;
}

/// Flow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// No flow started
    Idle,
    /// Authorization URL issued, waiting for the user
    AwaitingAuthorization,
    /// Callback accepted, code exchange in flight
    AwaitingCallback,
    /// Credentials obtained
    Authorized,
    /// Code exchange or state validation failed
    Failed,
}

/// Returned by [`AuthFlow::begin_auth`]
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    /// URL the user must visit
    pub authorization_url: String,
    /// Opaque CSRF token embedded in the URL
    pub state: String,
}

struct PendingAuth {
    state: String,
    issued_at: Instant,
    code_verifier: String,
}

struct FlowInner {
    state: AuthState,
    pending: Option<PendingAuth>,
    token: Option<TokenInfo>,
    last_error: Option<String>,
}

/// Authorization-code flow for one backend connection
pub struct AuthFlow {
    backend: String,
    redirect_uri: String,
    state_ttl: Duration,
    server: Arc<dyn AuthorizationServer>,
    inner: Mutex<FlowInner>,
}

impl AuthFlow {
    /// Create an idle flow
    pub fn new(
        backend: impl Into<String>,
        server: Arc<dyn AuthorizationServer>,
        redirect_uri: impl Into<String>,
        state_ttl: Duration,
    ) -> Self {
        Self {
            backend: backend.into(),
            redirect_uri: redirect_uri.into(),
            state_ttl,
            server,
            inner: Mutex::new(FlowInner {
                state: AuthState::Idle,
                pending: None,
                token: None,
                last_error: None,
            }),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.inner.lock().state
    }

    /// Last exchange or validation failure
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// A usable (unexpired) token, if any
    #[must_use]
    pub fn token(&self) -> Option<TokenInfo> {
        self.inner
            .lock()
            .token
            .as_ref()
            .filter(|t| !t.is_expired())
            .cloned()
    }

    /// Drop held credentials, e.g. after the backend rejected them
    pub fn invalidate_token(&self) {
        let mut inner = self.inner.lock();
        inner.token = None;
        if inner.state == AuthState::Authorized {
            inner.state = AuthState::Idle;
        }
    }

    /// Whether `state` is the one currently pending. Used to route a
    /// callback to its connection; does not consume the state.
    #[must_use]
    pub fn is_pending(&self, state: &str) -> bool {
        self.inner
            .lock()
            .pending
            .as_ref()
            .is_some_and(|p| states_equal(&p.state, state))
    }

    /// Start a flow: mint a fresh `state` and PKCE pair and build the
    /// authorization URL. Any earlier pending state is discarded.
    pub async fn begin_auth(&self) -> Result<AuthorizationRequest> {
        let endpoint = self.server.authorization_endpoint().await?;
        let client_id = self.server.client_id().await?;
        let scopes = self.server.scopes();

        let state = generate_state();
        let (code_verifier, code_challenge) = generate_pkce();

        let mut url = Url::parse(&endpoint)
            .map_err(|e| Error::Config(format!("Invalid authorization endpoint: {e}")))?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &client_id);
            params.append_pair("redirect_uri", &self.redirect_uri);
            params.append_pair("state", &state);
            params.append_pair("code_challenge", &code_challenge);
            params.append_pair("code_challenge_method", "S256");
            if !scopes.is_empty() {
                params.append_pair("scope", &scopes.join(" "));
            }
        }

        let mut inner = self.inner.lock();
        if inner.pending.is_some() {
            debug!(backend = %self.backend, "Replacing pending authorization state");
        }
        inner.pending = Some(PendingAuth {
            state: state.clone(),
            issued_at: Instant::now(),
            code_verifier,
        });
        inner.state = AuthState::AwaitingAuthorization;
        inner.last_error = None;
        drop(inner);

        info!(backend = %self.backend, "Authorization flow started");
        Ok(AuthorizationRequest {
            authorization_url: url.to_string(),
            state,
        })
    }

    /// Complete a flow with the values returned to the callback endpoint.
    ///
    /// A state that does not match the pending one leaves the flow (and the
    /// pending state) untouched. A matching but expired state is consumed.
    pub async fn handle_callback(&self, returned_state: &str, code: &str) -> Result<()> {
        let pending = {
            let mut inner = self.inner.lock();
            let Some(pending) = inner.pending.as_ref() else {
                warn!(backend = %self.backend, "Callback without pending authorization");
                return Err(Error::StateMismatch);
            };
            if !states_equal(&pending.state, returned_state) {
                warn!(backend = %self.backend, "Callback state mismatch");
                return Err(Error::StateMismatch);
            }
            let expired = pending.issued_at.elapsed() > self.state_ttl;
            let pending = inner.pending.take();
            if expired {
                inner.state = AuthState::Failed;
                inner.last_error = Some("authorization state expired".to_string());
                warn!(backend = %self.backend, "Callback state expired");
                return Err(Error::StateExpired);
            }
            inner.state = AuthState::AwaitingCallback;
            pending
        };
        let Some(pending) = pending else {
            return Err(Error::StateMismatch);
        };

        let result = self
            .server
            .exchange_code(code, &self.redirect_uri, &pending.code_verifier)
            .await;

        let mut inner = self.inner.lock();
        match result {
            Ok(token) => {
                inner.token = Some(token);
                inner.state = AuthState::Authorized;
                inner.last_error = None;
                info!(backend = %self.backend, "Backend authorized");
                Ok(())
            }
            Err(e) => {
                inner.state = AuthState::Failed;
                inner.last_error = Some(e.to_string());
                warn!(backend = %self.backend, error = %e, "Code exchange failed");
                Err(e)
            }
        }
    }
}

fn states_equal(expected: &str, returned: &str) -> bool {
    expected.as_bytes().ct_eq(returned.as_bytes()).into()
}

/// PKCE verifier and its S256 challenge
pub(crate) fn generate_pkce() -> (String, String) {
    let verifier = URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>());
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    (verifier, challenge)
}

/// 128-bit random CSRF state
pub(crate) fn generate_state() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 16]>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::TokenResponse;

    struct FakeServer {
        fail_exchange: bool,
    }

    #[async_trait]
    impl AuthorizationServer for FakeServer {
        async fn authorization_endpoint(&self) -> Result<String> {
            Ok("https://auth.example.com/authorize".to_string())
        }

        async fn client_id(&self) -> Result<String> {
            Ok("vmcp".to_string())
        }

        fn scopes(&self) -> Vec<String> {
            vec!["read".to_string(), "write".to_string()]
        }

        async fn exchange_code(&self, code: &str, _: &str, verifier: &str) -> Result<TokenInfo> {
            assert!(!verifier.is_empty());
            if self.fail_exchange {
                return Err(Error::Transport("token endpoint down".into()));
            }
            Ok(TokenInfo::from(TokenResponse {
                access_token: format!("token-for-{code}"),
                token_type: None,
                expires_in: Some(3600),
                refresh_token: None,
                scope: None,
            }))
        }
    }

    fn flow(ttl: Duration, fail_exchange: bool) -> AuthFlow {
        AuthFlow::new(
            "github",
            Arc::new(FakeServer { fail_exchange }),
            "http://localhost:39500/callback",
            ttl,
        )
    }

    #[tokio::test]
    async fn begin_auth_embeds_state_and_pkce() {
        let flow = flow(Duration::from_secs(600), false);
        let request = flow.begin_auth().await.unwrap();
        let url = Url::parse(&request.authorization_url).unwrap();
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["state"], request.state);
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["scope"], "read write");
        assert_eq!(params["redirect_uri"], "http://localhost:39500/callback");
        assert_eq!(flow.state(), AuthState::AwaitingAuthorization);
        assert!(flow.is_pending(&request.state));
    }

    #[tokio::test]
    async fn matching_callback_authorizes() {
        let flow = flow(Duration::from_secs(600), false);
        let request = flow.begin_auth().await.unwrap();
        flow.handle_callback(&request.state, "abc").await.unwrap();
        assert_eq!(flow.state(), AuthState::Authorized);
        assert_eq!(flow.token().unwrap().access_token, "token-for-abc");
        assert!(!flow.is_pending(&request.state));
    }

    #[tokio::test]
    async fn mismatched_state_never_authorizes() {
        let flow = flow(Duration::from_secs(600), false);
        let request = flow.begin_auth().await.unwrap();
        let err = flow.handle_callback("forged", "abc").await.unwrap_err();
        assert!(matches!(err, Error::StateMismatch));
        assert_eq!(flow.state(), AuthState::AwaitingAuthorization);
        assert!(flow.token().is_none());
        // the legitimate callback still works
        flow.handle_callback(&request.state, "abc").await.unwrap();
    }

    #[tokio::test]
    async fn callback_without_flow_is_mismatch() {
        let flow = flow(Duration::from_secs(600), false);
        let err = flow.handle_callback("anything", "abc").await.unwrap_err();
        assert!(matches!(err, Error::StateMismatch));
        assert_eq!(flow.state(), AuthState::Idle);
    }

    #[tokio::test]
    async fn newer_begin_auth_supersedes_older_state() {
        let flow = flow(Duration::from_secs(600), false);
        let first = flow.begin_auth().await.unwrap();
        let second = flow.begin_auth().await.unwrap();
        assert_ne!(first.state, second.state);
        let err = flow.handle_callback(&first.state, "abc").await.unwrap_err();
        assert!(matches!(err, Error::StateMismatch));
        flow.handle_callback(&second.state, "abc").await.unwrap();
    }

    #[tokio::test]
    async fn expired_state_rejected_and_consumed() {
        let flow = flow(Duration::from_millis(1), false);
        let request = flow.begin_auth().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = flow.handle_callback(&request.state, "abc").await.unwrap_err();
        assert!(matches!(err, Error::StateExpired));
        assert_eq!(flow.state(), AuthState::Failed);
        let err = flow.handle_callback(&request.state, "abc").await.unwrap_err();
        assert!(matches!(err, Error::StateMismatch));
    }

    #[tokio::test]
    async fn exchange_failure_marks_failed() {
        let flow = flow(Duration::from_secs(600), true);
        let request = flow.begin_auth().await.unwrap();
        assert!(flow.handle_callback(&request.state, "abc").await.is_err());
        assert_eq!(flow.state(), AuthState::Failed);
        assert!(flow.last_error().unwrap().contains("token endpoint down"));
        assert!(flow.token().is_none());
    }

    #[test]
    fn pkce_challenge_is_sha256_of_verifier() {
        let (verifier, challenge) = generate_pkce();
        assert!(verifier.len() >= 43);
        assert_eq!(
            challenge,
            URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
        );
    }

    #[test]
    fn states_are_unique_and_url_safe() {
        let a = generate_state();
        let b = generate_state();
        assert_ne!(a, b);
        assert!(a.len() >= 20);
        assert!(!a.contains(['+', '/', '=']));
    }
}
