//! Backend connections
//!
//! A [`BackendConnection`] owns one MCP session to one backend: transport
//! lifecycle, the `initialize` handshake, catalog discovery and, when the
//! backend demands it, the delegated authorization flow. The catalog is
//! replaced as a whole on every (re)connect so readers never see a torn one.

mod reconnect;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use self::reconnect::ReconnectSchedule;
use crate::config::{BackendConfig, Config, ReconnectConfig, TransportConfig};
use crate::error::rpc_codes;
use crate::oauth::{AuthFlow, AuthState, AuthorizationRequest, OAuthClient};
use crate::protocol::{
    ClientCapabilities, Info, InitializeParams, InitializeResult, PROTOCOL_VERSION, Prompt,
    PromptsGetResult, PromptsListResult, Resource, ResourceContents, ResourcesListResult,
    ResourcesReadResult, Tool, ToolsCallResult, ToolsListResult,
};
use crate::transport::{HttpTransport, StdioTransport, Transport};
use crate::virtual_server::is_textual;
use crate::{Error, Result};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Never connected, or closed
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Session established and catalog discovered
    Connected,
    /// Backend requires authorization that has not completed
    AuthPending,
    /// Last attempt failed; retried lazily after backoff
    Failed,
}

/// What a backend exposes, as discovered at connect time.
/// Items keep the backend's local names.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    /// Tools
    pub tools: Vec<Tool>,
    /// Resources
    pub resources: Vec<Resource>,
    /// Prompts
    pub prompts: Vec<Prompt>,
}

impl Catalog {
    /// Tool by local name
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Prompt by local name
    #[must_use]
    pub fn prompt(&self, name: &str) -> Option<&Prompt> {
        self.prompts.iter().find(|p| p.name == name)
    }

    /// Resource by URI
    #[must_use]
    pub fn resource(&self, uri: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.uri == uri)
    }
}

/// Settings shared by every connection of a gateway
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Lazy reconnect schedule
    pub reconnect: ReconnectConfig,
    /// Lifetime of a pending authorization `state`
    pub state_ttl: Duration,
    /// Redirect URI for authorization callbacks
    pub callback_url: String,
    /// Client for OAuth discovery and token exchange
    pub http_client: Client,
}

impl ConnectionOptions {
    /// Derive from gateway configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create OAuth HTTP client: {e}")))?;
        Ok(Self {
            reconnect: config.reconnect,
            state_ttl: config.auth.state_ttl,
            callback_url: config.server.callback_url(),
            http_client,
        })
    }
}

enum Connector {
    /// Build the transport from configuration on every connect
    Configured(BackendConfig),
    /// Reuse a provided transport
    Fixed(Arc<dyn Transport>),
}

/// Point-in-time view of a connection, for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Backend name
    pub name: String,
    /// Lifecycle state
    pub status: ConnectionStatus,
    /// Authorization state, if the backend uses OAuth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthState>,
    /// Number of discovered tools
    pub tools: usize,
    /// Number of discovered resources
    pub resources: usize,
    /// Number of discovered prompts
    pub prompts: usize,
    /// Consecutive failed connects
    pub failures: u32,
    /// Last failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// One session to one backend
pub struct BackendConnection {
    name: String,
    connector: Connector,
    status: RwLock<ConnectionStatus>,
    last_error: RwLock<Option<String>>,
    catalog: RwLock<Arc<Catalog>>,
    /// Catalog from before the most recent loss of the session
    last_catalog: RwLock<Arc<Catalog>>,
    generation: AtomicU64,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    auth: Option<AuthFlow>,
    /// Held across a request when the backend needs single-flight calls
    call_gate: Option<tokio::sync::Mutex<()>>,
    connect_gate: tokio::sync::Mutex<()>,
    schedule: Mutex<ReconnectSchedule>,
}

impl BackendConnection {
    /// Connection built from backend configuration. Nothing is contacted
    /// until [`connect`](Self::connect) or first use.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BackendConfig, options: &ConnectionOptions) -> Self {
        let name = name.into();
        let auth = match (&config.oauth, &config.transport) {
            (Some(oauth), TransportConfig::Http { http_url, .. }) => {
                let server = OAuthClient::new(
                    options.http_client.clone(),
                    name.clone(),
                    http_url.clone(),
                    options.callback_url.clone(),
                    oauth.clone(),
                );
                Some(AuthFlow::new(
                    name.clone(),
                    Arc::new(server),
                    options.callback_url.clone(),
                    options.state_ttl,
                ))
            }
            (Some(_), TransportConfig::Stdio { .. }) => {
                warn!(backend = %name, "OAuth is ignored for stdio backends");
                None
            }
            (None, _) => None,
        };
        let serialize = config.serialize_calls;
        Self::build(name, Connector::Configured(config), auth, serialize, options)
    }

    /// Connection over an existing transport
    #[must_use]
    pub fn from_transport(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        options: &ConnectionOptions,
    ) -> Self {
        Self::build(name.into(), Connector::Fixed(transport), None, false, options)
    }

    /// Attach an authorization flow
    #[must_use]
    pub fn with_auth(mut self, auth: AuthFlow) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Issue at most one request at a time
    #[must_use]
    pub fn serialized(mut self) -> Self {
        self.call_gate = Some(tokio::sync::Mutex::new(()));
        self
    }

    fn build(
        name: String,
        connector: Connector,
        auth: Option<AuthFlow>,
        serialize_calls: bool,
        options: &ConnectionOptions,
    ) -> Self {
        Self {
            name,
            connector,
            status: RwLock::new(ConnectionStatus::Disconnected),
            last_error: RwLock::new(None),
            catalog: RwLock::new(Arc::new(Catalog::default())),
            last_catalog: RwLock::new(Arc::new(Catalog::default())),
            generation: AtomicU64::new(0),
            transport: RwLock::new(None),
            auth,
            call_gate: serialize_calls.then(|| tokio::sync::Mutex::new(())),
            connect_gate: tokio::sync::Mutex::new(()),
            schedule: Mutex::new(ReconnectSchedule::new(options.reconnect)),
        }
    }

    /// Backend name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration this connection was built from
    #[must_use]
    pub fn config(&self) -> Option<&BackendConfig> {
        match &self.connector {
            Connector::Configured(config) => Some(config),
            Connector::Fixed(_) => None,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    /// Current catalog snapshot (empty until connected)
    #[must_use]
    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog.read())
    }

    /// What the backend offered when it was last up. Only meaningful while
    /// it is down.
    #[must_use]
    pub fn last_known_catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.last_catalog.read())
    }

    /// Bumped every time the catalog is replaced
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether the session is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
            && self
                .transport
                .read()
                .as_ref()
                .is_some_and(|t| t.is_connected())
    }

    /// Health snapshot
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        let catalog = self.catalog();
        ConnectionInfo {
            name: self.name.clone(),
            status: self.status(),
            auth: self.auth.as_ref().map(AuthFlow::state),
            tools: catalog.tools.len(),
            resources: catalog.resources.len(),
            prompts: catalog.prompts.len(),
            failures: self.schedule.lock().failures(),
            last_error: self.last_error.read().clone(),
        }
    }

    /// The error a directive targeting this backend sees while it is down
    #[must_use]
    pub fn unavailable_error(&self) -> Error {
        match self.status() {
            ConnectionStatus::AuthPending => Error::AuthRequired(self.name.clone()),
            _ => Error::connection(
                &self.name,
                self.last_error
                    .read()
                    .clone()
                    .unwrap_or_else(|| "not connected".to_string()),
            ),
        }
    }

    /// Connect now if not connected, honoring the reconnect backoff
    ///
    /// # Errors
    ///
    /// Returns `AuthRequired` while authorization is pending, or a
    /// connection error if the backend is unreachable or backing off.
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let _gate = self.connect_gate.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        match self.status() {
            ConnectionStatus::AuthPending
                if self.auth.as_ref().is_some_and(|a| a.token().is_none()) =>
            {
                return Err(Error::AuthRequired(self.name.clone()));
            }
            ConnectionStatus::Failed => {
                let remaining = self.schedule.lock().remaining();
                if let Some(wait) = remaining {
                    debug!(backend = %self.name, wait_ms = wait.as_millis(), "Backing off");
                    return Err(self.unavailable_error());
                }
            }
            _ => {}
        }

        self.connect_locked().await
    }

    /// Establish the session and discover the catalog
    ///
    /// # Errors
    ///
    /// Returns `AuthRequired` if the backend demands authorization, or a
    /// connection error for network and protocol failures.
    pub async fn connect(&self) -> Result<()> {
        let _gate = self.connect_gate.lock().await;
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> Result<()> {
        *self.status.write() = ConnectionStatus::Connecting;
        info!(backend = %self.name, "Connecting backend");

        match self.establish().await {
            Ok((transport, catalog)) => {
                debug!(
                    backend = %self.name,
                    tools = catalog.tools.len(),
                    resources = catalog.resources.len(),
                    prompts = catalog.prompts.len(),
                    "Catalog discovered"
                );
                *self.transport.write() = Some(transport);
                *self.catalog.write() = Arc::new(catalog);
                self.generation.fetch_add(1, Ordering::AcqRel);
                *self.last_error.write() = None;
                self.schedule.lock().reset();
                *self.status.write() = ConnectionStatus::Connected;
                info!(backend = %self.name, "Backend connected");
                Ok(())
            }
            Err(e) => Err(self.record_connect_failure(e)),
        }
    }

    fn record_connect_failure(&self, error: Error) -> Error {
        let stale = self.transport.write().take();
        if let Some(transport) = stale {
            tokio::spawn(async move {
                let _ = transport.close().await;
            });
        }
        if !self.catalog.read().tools.is_empty()
            || !self.catalog.read().resources.is_empty()
            || !self.catalog.read().prompts.is_empty()
        {
            let lost = std::mem::take(&mut *self.catalog.write());
            *self.last_catalog.write() = lost;
            self.generation.fetch_add(1, Ordering::AcqRel);
        }

        match error {
            Error::AuthRequired(_) => {
                if let Some(auth) = &self.auth {
                    auth.invalidate_token();
                }
                *self.status.write() = ConnectionStatus::AuthPending;
                *self.last_error.write() = Some("authorization required".to_string());
                warn!(backend = %self.name, "Backend requires authorization");
                Error::AuthRequired(self.name.clone())
            }
            other => {
                let message = match other {
                    Error::Connection { message, .. } => message,
                    e => e.to_string(),
                };
                let wait = self.schedule.lock().record_failure();
                *self.status.write() = ConnectionStatus::Failed;
                *self.last_error.write() = Some(message.clone());
                warn!(
                    backend = %self.name,
                    error = %message,
                    retry_in_ms = wait.as_millis(),
                    "Backend connection failed"
                );
                Error::connection(&self.name, message)
            }
        }
    }

    async fn establish(&self) -> Result<(Arc<dyn Transport>, Catalog)> {
        let (transport, protocol_version) = self.create_transport()?;
        transport.open().await?;

        let init = InitializeParams {
            protocol_version: protocol_version.unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
            capabilities: ClientCapabilities {},
            client_info: Info {
                name: "vmcp-gateway".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
            },
        };
        let response = transport
            .request("initialize", Some(serde_json::to_value(&init)?))
            .await?;
        let init: InitializeResult = decode_response(response)?;
        transport.notify("notifications/initialized", None).await?;
        debug!(
            backend = %self.name,
            server = %init.server_info.name,
            protocol = %init.protocol_version,
            "Handshake complete"
        );

        let caps = &init.capabilities;
        let mut catalog = Catalog::default();
        if caps.tools.is_some() {
            catalog.tools = list_all(&*transport, "tools/list", |r: ToolsListResult| {
                (r.tools, r.next_cursor)
            })
            .await?;
        }
        if caps.resources.is_some() {
            catalog.resources =
                list_all(&*transport, "resources/list", |r: ResourcesListResult| {
                    (r.resources, r.next_cursor)
                })
                .await?;
        }
        if caps.prompts.is_some() {
            catalog.prompts = list_all(&*transport, "prompts/list", |r: PromptsListResult| {
                (r.prompts, r.next_cursor)
            })
            .await?;
        }
        Ok((transport, catalog))
    }

    fn create_transport(&self) -> Result<(Arc<dyn Transport>, Option<String>)> {
        let config = match &self.connector {
            Connector::Fixed(transport) => return Ok((Arc::clone(transport), None)),
            Connector::Configured(config) => config,
        };
        match &config.transport {
            TransportConfig::Stdio { command, cwd } => {
                let transport =
                    StdioTransport::new(command, config.env.clone(), cwd.clone(), config.timeout)?;
                Ok((transport, None))
            }
            TransportConfig::Http {
                http_url,
                streamable_http,
                protocol_version,
            } => {
                let mut headers = config.headers.clone();
                if let Some(token) = self.auth.as_ref().and_then(AuthFlow::token) {
                    headers.insert("Authorization".to_string(), token.authorization_header());
                }
                let transport =
                    HttpTransport::new(http_url, &headers, config.timeout, *streamable_http)?;
                Ok((transport, protocol_version.clone()))
            }
        }
    }

    /// Close the session
    pub async fn close(&self) {
        let transport = self.transport.write().take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                debug!(backend = %self.name, error = %e, "Error closing transport");
            }
        }
        *self.status.write() = ConnectionStatus::Disconnected;
    }

    #[tracing::instrument(
        skip(self, params),
        fields(
            backend = %self.name,
            method = %method,
            request_id = %uuid::Uuid::new_v4()
        )
    )]
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let transport = self
            .transport
            .read()
            .clone()
            .ok_or_else(|| self.unavailable_error())?;

        let _permit = match &self.call_gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let response = match transport.request(method, params).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Backend request failed");
                return Err(self.record_request_failure(e));
            }
        };

        if let Some(error) = response.error {
            debug!(code = error.code, "Backend returned error");
            return Err(Error::JsonRpc {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        response
            .result
            .ok_or_else(|| Error::Protocol(format!("{method}: response has no result")))
    }

    /// A failed round-trip leaves the session unusable; the next use
    /// reconnects lazily.
    fn record_request_failure(&self, error: Error) -> Error {
        match error {
            Error::AuthRequired(_) => {
                if let Some(auth) = &self.auth {
                    auth.invalidate_token();
                }
                *self.status.write() = ConnectionStatus::AuthPending;
                Error::AuthRequired(self.name.clone())
            }
            Error::Transport(_) | Error::Http(_) | Error::Io(_) => {
                self.schedule.lock().record_failure();
                *self.status.write() = ConnectionStatus::Failed;
                *self.last_error.write() = Some(error.to_string());
                Error::connection(&self.name, error)
            }
            other => other,
        }
    }

    /// Invoke a tool. Never retried: the call may have side effects.
    ///
    /// # Errors
    ///
    /// Returns `ToolNotFound` if the backend does not know the tool,
    /// `ToolExecutionError` if the call fails (including JSON-RPC errors
    /// raised by a listed tool), or a connection error.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolsCallResult> {
        self.ensure_connected().await?;
        let reference = format!("{}.{name}", self.name);
        let params = json!({ "name": name, "arguments": arguments });

        let value = match self.request("tools/call", Some(params)).await {
            Ok(value) => value,
            Err(Error::JsonRpc { code, message, .. }) => {
                // Tool bodies may fail with "not found" text of their own
                if code == rpc_codes::METHOD_NOT_FOUND || self.catalog().tool(name).is_none() {
                    return Err(Error::ToolNotFound(reference));
                }
                return Err(Error::ToolExecution {
                    tool: reference,
                    message,
                });
            }
            Err(e) => return Err(e),
        };

        let result: ToolsCallResult = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("Invalid tools/call result: {e}")))?;
        if result.is_error {
            let message = result
                .content
                .iter()
                .filter_map(|c| c.as_text())
                .collect::<Vec<_>>()
                .join("\n");
            return Err(Error::ToolExecution {
                tool: reference,
                message,
            });
        }
        Ok(result)
    }

    /// Read a resource in protocol form
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if the backend rejects the URI, or a
    /// connection error.
    pub async fn read_resource(&self, uri: &str) -> Result<ResourcesReadResult> {
        self.ensure_connected().await?;
        let value = self
            .request("resources/read", Some(json!({ "uri": uri })))
            .await
            .map_err(|e| match e {
                Error::JsonRpc { .. } => Error::ResourceNotFound(uri.to_string()),
                other => other,
            })?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("Invalid resources/read result: {e}")))
    }

    /// Read a resource as bytes plus content type
    ///
    /// # Errors
    ///
    /// As [`read_resource`](Self::read_resource); also `ResourceNotFound`
    /// when the backend returns no contents.
    pub async fn read_resource_bytes(&self, uri: &str) -> Result<(Vec<u8>, String)> {
        let result = self.read_resource(uri).await?;
        let contents = result
            .contents
            .into_iter()
            .next()
            .ok_or_else(|| Error::ResourceNotFound(uri.to_string()))?;
        match contents {
            ResourceContents::Text {
                text, mime_type, ..
            } => {
                let content_type = mime_type
                    .filter(|m| is_textual(m))
                    .unwrap_or_else(|| "text/plain".to_string());
                Ok((text.into_bytes(), content_type))
            }
            ResourceContents::Blob {
                blob, mime_type, ..
            } => {
                let bytes = STANDARD
                    .decode(blob.as_bytes())
                    .map_err(|e| Error::Protocol(format!("Invalid base64 in '{uri}': {e}")))?;
                Ok((
                    bytes,
                    mime_type.unwrap_or_else(|| "application/octet-stream".to_string()),
                ))
            }
        }
    }

    /// Render a backend prompt
    ///
    /// # Errors
    ///
    /// Returns `PromptNotFound` if the backend rejects the name, or a
    /// connection error.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<PromptsGetResult> {
        self.ensure_connected().await?;
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = serde_json::to_value(arguments)?;
        }
        let value = self
            .request("prompts/get", Some(params))
            .await
            .map_err(|e| match e {
                Error::JsonRpc { .. } => Error::PromptNotFound(format!("{}.{name}", self.name)),
                other => other,
            })?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("Invalid prompts/get result: {e}")))
    }

    /// Start the authorization flow; the connection waits in `auth_pending`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the backend has no OAuth settings,
    /// or the error from endpoint discovery.
    pub async fn begin_auth(&self) -> Result<AuthorizationRequest> {
        let auth = self.auth.as_ref().ok_or_else(|| {
            Error::Config(format!("Backend '{}' has no oauth configuration", self.name))
        })?;
        let request = auth.begin_auth().await?;
        if self.status() != ConnectionStatus::Connected {
            *self.status.write() = ConnectionStatus::AuthPending;
        }
        Ok(request)
    }

    /// Whether a callback `state` belongs to this connection
    #[must_use]
    pub fn owns_auth_state(&self, state: &str) -> bool {
        self.auth.as_ref().is_some_and(|a| a.is_pending(state))
    }

    /// Complete the authorization flow and reconnect with the new credentials
    ///
    /// # Errors
    ///
    /// Returns `StateMismatch`/`StateExpired` for a bad callback, the
    /// exchange error, or the reconnect error.
    pub async fn complete_auth(&self, state: &str, code: &str) -> Result<()> {
        let auth = self
            .auth
            .as_ref()
            .ok_or(Error::StateMismatch)?;
        auth.handle_callback(state, code).await?;
        self.connect().await
    }
}

/// Decode a JSON-RPC response into its typed result
fn decode_response<T: DeserializeOwned>(response: crate::protocol::JsonRpcResponse) -> Result<T> {
    if let Some(error) = response.error {
        return Err(Error::JsonRpc {
            code: error.code,
            message: error.message,
            data: error.data,
        });
    }
    let result = response
        .result
        .ok_or_else(|| Error::Protocol("response has no result".to_string()))?;
    serde_json::from_value(result).map_err(|e| Error::Protocol(format!("Invalid result: {e}")))
}

/// Follow `nextCursor` until the listing is exhausted. A backend that
/// declares the capability but lacks the method contributes nothing.
async fn list_all<R, T>(
    transport: &dyn Transport,
    method: &str,
    split: impl Fn(R) -> (Vec<T>, Option<String>),
) -> Result<Vec<T>>
where
    R: DeserializeOwned,
{
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let response = transport.request(method, params).await?;
        let page: R = match decode_response(response) {
            Ok(page) => page,
            Err(Error::JsonRpc { code, .. }) if code == rpc_codes::METHOD_NOT_FOUND => {
                return Ok(items);
            }
            Err(e) => return Err(e),
        };
        let (mut batch, next) = split(page);
        items.append(&mut batch);
        match next {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            _ => return Ok(items),
        }
    }
}
