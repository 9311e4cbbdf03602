//! OAuth client for one backend: endpoint resolution, client registration
//! and the token endpoint call.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::flow::AuthorizationServer;
use super::metadata::{self, AuthorizationServerMetadata};
use super::{TokenInfo, TokenResponse};
use crate::config::OAuthConfig;
use crate::{Error, Result};

/// Resolved endpoints for one authorization server
#[derive(Debug, Clone)]
struct Endpoints {
    authorization: String,
    token: String,
    registration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientRegistrationResponse {
    client_id: String,
}

/// OAuth client for a backend
pub struct OAuthClient {
    http_client: Client,
    backend: String,
    /// Backend MCP URL; discovery runs against its origin
    resource_url: String,
    redirect_uri: String,
    config: OAuthConfig,
    endpoints: OnceCell<Endpoints>,
    client_id: OnceCell<String>,
}

impl OAuthClient {
    /// Create a client. Nothing is fetched until the first flow starts.
    #[must_use]
    pub fn new(
        http_client: Client,
        backend: impl Into<String>,
        resource_url: impl Into<String>,
        redirect_uri: impl Into<String>,
        config: OAuthConfig,
    ) -> Self {
        Self {
            http_client,
            backend: backend.into(),
            resource_url: resource_url.into(),
            redirect_uri: redirect_uri.into(),
            config,
            endpoints: OnceCell::new(),
            client_id: OnceCell::new(),
        }
    }

    async fn endpoints(&self) -> Result<&Endpoints> {
        self.endpoints
            .get_or_try_init(|| async {
                if let (Some(authorization), Some(token)) = (
                    self.config.authorization_endpoint.clone(),
                    self.config.token_endpoint.clone(),
                ) {
                    return Ok(Endpoints {
                        authorization,
                        token,
                        registration: None,
                    });
                }
                let base = metadata::base_url(&self.resource_url)?;
                let meta = AuthorizationServerMetadata::discover(&self.http_client, &base).await?;
                if !meta.supports_pkce() {
                    debug!(backend = %self.backend, "Authorization server does not list S256");
                }
                Ok::<_, Error>(Endpoints {
                    authorization: self
                        .config
                        .authorization_endpoint
                        .clone()
                        .unwrap_or(meta.authorization_endpoint),
                    token: self
                        .config
                        .token_endpoint
                        .clone()
                        .unwrap_or(meta.token_endpoint),
                    registration: meta.registration_endpoint,
                })
            })
            .await
    }

    /// Dynamic client registration (RFC 7591) as a public client
    async fn register_client(&self, endpoint: &str) -> Result<String> {
        let body = serde_json::json!({
            "client_name": format!("vMCP gateway - {}", self.backend),
            "redirect_uris": [self.redirect_uri],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none"
        });

        let response = self
            .http_client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Client registration failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "Client registration failed: HTTP {status} - {text}"
            )));
        }

        let registered: ClientRegistrationResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Invalid registration response: {e}")))?;
        info!(backend = %self.backend, "Registered OAuth client");
        Ok(registered.client_id)
    }
}

#[async_trait]
impl AuthorizationServer for OAuthClient {
    async fn authorization_endpoint(&self) -> Result<String> {
        Ok(self.endpoints().await?.authorization.clone())
    }

    async fn client_id(&self) -> Result<String> {
        self.client_id
            .get_or_try_init(|| async {
                if let Some(id) = &self.config.client_id {
                    return Ok(id.clone());
                }
                if let Some(endpoint) = self.endpoints().await?.registration.clone() {
                    match self.register_client(&endpoint).await {
                        Ok(id) => return Ok(id),
                        Err(e) => {
                            debug!(error = %e, "Dynamic registration failed, using generated ID");
                        }
                    }
                }
                Ok::<_, Error>(generate_client_id())
            })
            .await
            .cloned()
    }

    fn scopes(&self) -> Vec<String> {
        self.config.scopes.clone()
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenInfo> {
        let token_endpoint = self.endpoints().await?.token.clone();
        let client_id = self.client_id().await?;

        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .http_client
            .post(&token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "Token exchange failed: HTTP {status} - {text}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Failed to parse token response: {e}")))?;
        Ok(token.into())
    }
}

fn generate_client_id() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 16]>())
}
