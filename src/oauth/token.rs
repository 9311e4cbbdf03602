//! Access tokens obtained through the authorization-code flow

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Seconds before the real expiry at which a token counts as expired
const EXPIRY_SKEW_SECS: u64 = 60;

/// Token endpoint response (RFC 6749 section 5.1)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// Token type
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

/// Credentials held by one backend connection
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Access token
    pub access_token: String,
    /// Token type (usually "Bearer")
    pub token_type: String,
    /// Refresh token (optional)
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Expiration time (Unix seconds)
    #[serde(default)]
    pub expires_at: Option<u64>,
    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

// Hand-written so tokens never end up in logs.
impl std::fmt::Debug for TokenInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenInfo")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl From<TokenResponse> for TokenInfo {
    fn from(response: TokenResponse) -> Self {
        Self {
            access_token: response.access_token,
            token_type: response
                .token_type
                .unwrap_or_else(|| "Bearer".to_string()),
            refresh_token: response.refresh_token,
            expires_at: response.expires_in.map(|secs| now_secs() + secs),
            scope: response.scope,
        }
    }
}

impl TokenInfo {
    /// `true` once within a minute of expiry. Tokens without expiry never expire.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| now_secs() + EXPIRY_SKEW_SECS >= at)
    }

    /// `Authorization` header value
    #[must_use]
    pub fn authorization_header(&self) -> String {
        // Normalize the common lowercase `bearer`.
        let scheme = if self.token_type.eq_ignore_ascii_case("bearer") {
            "Bearer"
        } else {
            self.token_type.as_str()
        };
        format!("{scheme} {}", self.access_token)
    }
}
