//! OAuth authorization server metadata discovery (RFC 8414)

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// OAuth Authorization Server Metadata (RFC 8414), the fields the gateway uses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    #[serde(default)]
    pub issuer: Option<String>,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Dynamic client registration endpoint (optional)
    #[serde(default)]
    pub registration_endpoint: Option<String>,

    /// Supported scopes (string or array, depending on the server)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// Accept `"read write"` as well as `["read", "write"]`
fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(s) => Ok(s.split_whitespace().map(String::from).collect()),
        StringOrVec::Vec(v) => Ok(v),
    }
}

impl AuthorizationServerMetadata {
    /// Fetch `/.well-known/oauth-authorization-server` under `base_url`
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata endpoint is unreachable or returns invalid data.
    pub async fn discover(client: &Client, base_url: &str) -> Result<Self> {
        let url = format!(
            "{}/.well-known/oauth-authorization-server",
            base_url.trim_end_matches('/')
        );
        debug!(url = %url, "Discovering OAuth authorization server metadata");

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to fetch OAuth metadata: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "OAuth metadata discovery failed: HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Failed to parse OAuth metadata: {e}")))
    }

    /// Whether the server advertises S256 PKCE (absent list means unknown)
    #[must_use]
    pub fn supports_pkce(&self) -> bool {
        self.code_challenge_methods_supported.is_empty()
            || self.code_challenge_methods_supported.iter().any(|m| m == "S256")
    }
}

/// Scheme, host and port of a URL
pub fn base_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| Error::Config(format!("Invalid URL: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::Config(format!("URL has no host: {url}")))?;
    Ok(match parsed.port() {
        Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
        None => format!("{}://{host}", parsed.scheme()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_as_array_or_string() {
        let a: AuthorizationServerMetadata = serde_json::from_str(
            r#"{"authorization_endpoint":"a","token_endpoint":"t","scopes_supported":["read","write"]}"#,
        )
        .unwrap();
        let b: AuthorizationServerMetadata = serde_json::from_str(
            r#"{"authorization_endpoint":"a","token_endpoint":"t","scopes_supported":"read write"}"#,
        )
        .unwrap();
        assert_eq!(a.scopes_supported, b.scopes_supported);
    }

    #[test]
    fn pkce_support_detection() {
        let meta: AuthorizationServerMetadata = serde_json::from_str(
            r#"{"authorization_endpoint":"a","token_endpoint":"t","code_challenge_methods_supported":["plain"]}"#,
        )
        .unwrap();
        assert!(!meta.supports_pkce());
    }

    #[test]
    fn base_url_keeps_port_drops_path() {
        assert_eq!(
            base_url("http://localhost:8080/api/v1?x=1").unwrap(),
            "http://localhost:8080"
        );
        assert_eq!(base_url("https://example.com/mcp").unwrap(), "https://example.com");
        assert!(base_url("not a url").is_err());
    }
}
