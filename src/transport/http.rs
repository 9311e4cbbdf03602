//! HTTP transport: MCP Streamable HTTP or legacy SSE
//!
//! Legacy SSE: `GET` the SSE URL, wait for the `endpoint` event, then `POST`
//! every message to that endpoint. Streamable HTTP: `POST` straight to the
//! configured URL; replies arrive as JSON or as a one-shot SSE body.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::Transport;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId};
use crate::{Error, Result};

const SESSION_HEADER: &str = "mcp-session-id";
const VERSION_HEADER: &str = "mcp-protocol-version";

/// HTTP transport for MCP backends
pub struct HttpTransport {
    client: Client,
    /// Configured URL (SSE endpoint or Streamable HTTP endpoint)
    base_url: String,
    /// Where messages are posted; set by `open`
    message_url: RwLock<Option<String>>,
    headers: HeaderMap,
    session_id: RwLock<Option<String>>,
    request_id: AtomicI64,
    connected: AtomicBool,
    streamable_http: bool,
}

impl HttpTransport {
    /// Create a new HTTP transport. Invalid header names or values are
    /// rejected here rather than silently dropped per request.
    pub fn new(
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
        streamable_http: bool,
    ) -> Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| Error::Config(format!("invalid header name '{key}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("invalid value for header '{key}': {e}")))?;
            header_map.insert(name, value);
        }

        Ok(Arc::new(Self {
            client,
            base_url: url.to_string(),
            message_url: RwLock::new(None),
            headers: header_map,
            session_id: RwLock::new(None),
            request_id: AtomicI64::new(1),
            connected: AtomicBool::new(false),
            streamable_http,
        }))
    }

    /// Wait for the `endpoint` event on the SSE stream
    async fn establish_sse_connection(&self) -> Result<String> {
        let mut headers = self.headers.clone();
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(VERSION_HEADER, HeaderValue::from_static(PROTOCOL_VERSION));

        debug!(url = %self.base_url, "Establishing SSE connection");
        let response = self
            .client
            .get(&self.base_url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("SSE connection failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::AuthRequired(self.base_url.clone()));
        }
        if !status.is_success() {
            return Err(Error::Transport(format!("SSE endpoint returned: {status}")));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut event_type: Option<String> = None;

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| Error::Transport(format!("Failed to read SSE chunk: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);

                if line.is_empty() {
                    event_type = None;
                } else if let Some(event) = line.strip_prefix("event:") {
                    event_type = Some(event.trim().to_string());
                } else if let Some(data) = line.strip_prefix("data:") {
                    if event_type.as_deref() == Some("endpoint") {
                        return Ok(data.trim().to_string());
                    }
                }
            }
        }

        Err(Error::Transport(
            "SSE stream ended without endpoint event".to_string(),
        ))
    }

    /// Resolve a possibly relative message endpoint against the SSE URL
    fn resolve_message_url(&self, endpoint: &str) -> Result<String> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| Error::Transport(format!("Invalid SSE URL: {e}")))?;
        let resolved = base
            .join(endpoint)
            .map_err(|e| Error::Transport(format!("Failed to resolve endpoint URL: {e}")))?;

        if let Some((_, id)) = resolved.query_pairs().find(|(k, _)| k == "session_id") {
            debug!(session_id = %id, "Session ID from SSE endpoint");
            *self.session_id.write() = Some(id.into_owned());
        }
        Ok(resolved.to_string())
    }

    fn message_url(&self) -> String {
        self.message_url
            .read()
            .clone()
            .unwrap_or_else(|| self.base_url.clone())
    }

    fn post_headers(&self) -> Result<HeaderMap> {
        let mut headers = self.headers.clone();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        headers.insert(VERSION_HEADER, HeaderValue::from_static(PROTOCOL_VERSION));
        if let Some(id) = self.session_id.read().as_deref() {
            let value = HeaderValue::from_str(id)
                .map_err(|e| Error::Protocol(format!("invalid session id: {e}")))?;
            headers.insert(SESSION_HEADER, value);
        }
        Ok(headers)
    }

    async fn post(&self, body: &JsonRpcRequest) -> Result<reqwest::Response> {
        let url = self.message_url();
        let response = self
            .client
            .post(&url)
            .headers(self.post_headers()?)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Request failed: {e}")))?;

        if self.session_id.read().is_none() {
            if let Some(id) = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                info!(session_id = %id, url = %url, "Stored session ID from response");
                *self.session_id.write() = Some(id.to_string());
            }
        }

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::AuthRequired(self.base_url.clone()));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!("HTTP {status}: {text}")));
        }
        Ok(response)
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Extract the JSON-RPC response from a one-shot SSE body
fn parse_sse_body(text: &str) -> Result<JsonRpcResponse> {
    text.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .find(|data| !data.is_empty())
        .ok_or_else(|| Error::Transport("No data in SSE response".to_string()))
        .and_then(|data| {
            serde_json::from_str(data)
                .map_err(|e| Error::Transport(format!("Failed to parse SSE data: {e}")))
        })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self) -> Result<()> {
        let url = if self.streamable_http {
            self.base_url.clone()
        } else {
            let endpoint = self.establish_sse_connection().await?;
            self.resolve_message_url(&endpoint)?
        };
        debug!(url = %url, streamable = self.streamable_http, "HTTP transport ready");
        *self.message_url.write() = Some(url);
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        let response = self.post(&request).await?;

        let is_sse = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        if is_sse {
            let text = response
                .text()
                .await
                .map_err(|e| Error::Transport(format!("Failed to read SSE response: {e}")))?;
            parse_sse_body(&text)
        } else {
            response
                .json()
                .await
                .map_err(|e| Error::Transport(format!("Failed to parse response: {e}")))
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcRequest::notification(method, params);
        if let Err(e) = self.post(&notification).await {
            warn!(method, error = %e, "Notification failed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        let session_id = self.session_id.read().clone();
        if let Some(id) = session_id {
            let _ = self
                .client
                .delete(self.message_url())
                .header(SESSION_HEADER, id)
                .send()
                .await;
        }
        Ok(())
    }
}
