//! Virtual Server Facade
//!
//! Serves the MCP surface of one virtual server. Custom prompts go through
//! the [`Resolver`]; tools, backend resources and backend prompts are
//! delegated straight to the owning connection.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    BlobStore, CustomResource, LOCAL_SCHEME, VirtualServer, VirtualServerStore,
    guess_content_type, is_textual,
};
use crate::aggregator::{Aggregator, Namespace};
use crate::backend::{ConnectionInfo, ConnectionOptions, ConnectionStatus};
use crate::config::ResourceSeed;
use crate::oauth::AuthorizationRequest;
use crate::protocol::{
    Info, InitializeResult, PROTOCOL_VERSION, PromptsCapability, PromptsGetResult,
    PromptsListResult, ResourceContents, ResourcesCapability, ResourcesListResult,
    ResourcesReadResult, ServerCapabilities, ToolsCallResult, ToolsCapability, ToolsListResult,
};
use crate::resolver::{ResolutionContext, Resolver};
use crate::{Error, Result};

/// Health of one virtual server
#[derive(Debug, Clone, Serialize)]
pub struct VirtualServerHealth {
    /// Virtual server name
    pub name: String,
    /// Whether every backend is connected
    pub healthy: bool,
    /// Per-backend state
    pub backends: Vec<ConnectionInfo>,
}

/// MCP server side of one virtual server
pub struct VirtualMcp {
    name: String,
    store: Arc<dyn VirtualServerStore>,
    blobs: Arc<dyn BlobStore>,
    resolver: Arc<Resolver>,
    aggregator: Aggregator,
}

impl VirtualMcp {
    /// Facade over the stored definition `name`
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn VirtualServerStore>,
        blobs: Arc<dyn BlobStore>,
        resolver: Arc<Resolver>,
        options: ConnectionOptions,
    ) -> Self {
        let name = name.into();
        Self {
            aggregator: Aggregator::new(name.clone(), options),
            name,
            store,
            blobs,
            resolver,
        }
    }

    /// Virtual server name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backend connections of this virtual server
    #[must_use]
    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Definition and namespace snapshot for one request. The backend set
    /// follows the stored definition.
    async fn current(&self) -> Result<(Arc<VirtualServer>, Arc<Namespace>)> {
        let server = self.store.get(&self.name).await?;
        self.aggregator.sync_backends(&server.backends).await;
        let namespace = self.aggregator.prepare().await;
        Ok((server, namespace))
    }

    /// `initialize`
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let server = self.store.get(&self.name).await?;
        Ok(InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                prompts: Some(PromptsCapability::default()),
                resources: Some(ResourcesCapability::default()),
                tools: Some(ToolsCapability::default()),
            },
            server_info: Info {
                name: server.name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: server.display_name.clone(),
            },
            instructions: None,
        })
    }

    /// `tools/list`: backend tools under qualified names
    pub async fn list_tools(&self) -> Result<ToolsListResult> {
        let (_, namespace) = self.current().await?;
        Ok(ToolsListResult {
            tools: namespace.tools(),
            next_cursor: None,
        })
    }

    /// `tools/call`, forwarded to the owning backend
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolsCallResult> {
        let (_, namespace) = self.current().await?;
        let target = namespace.resolve_tool(name)?;
        debug!(server = %self.name, tool = name, backend = target.connection.name(), "Forwarding tool call");
        target.connection.call_tool(&target.local_name, arguments).await
    }

    /// `resources/list`: backend resources plus uploaded ones
    pub async fn list_resources(&self) -> Result<ResourcesListResult> {
        let (server, namespace) = self.current().await?;
        let mut resources = namespace.resources();
        resources.extend(server.resources.iter().map(CustomResource::to_protocol));
        Ok(ResourcesListResult {
            resources,
            next_cursor: None,
        })
    }

    /// `resources/read`
    pub async fn read_resource(&self, uri: &str) -> Result<ResourcesReadResult> {
        let (server, namespace) = self.current().await?;
        if let Some(filename) = local_filename(uri) {
            let resource = server
                .resource(filename)
                .ok_or_else(|| Error::ResourceNotFound(uri.to_string()))?;
            let (bytes, content_type) = self.blobs.get(&resource.blob_id).await?;
            return Ok(ResourcesReadResult {
                contents: vec![contents(uri, bytes, content_type)],
            });
        }
        let target = namespace.resolve_resource(uri)?;
        target.connection.read_resource(&target.local_name).await
    }

    /// `prompts/list`: custom prompts, then backend prompts under qualified
    /// names. Nothing is resolved.
    pub async fn list_prompts(&self) -> Result<PromptsListResult> {
        let (server, namespace) = self.current().await?;
        let mut prompts: Vec<_> = server.prompts.iter().map(|p| p.to_protocol()).collect();
        prompts.extend(namespace.prompts());
        Ok(PromptsListResult {
            prompts,
            next_cursor: None,
        })
    }

    /// `prompts/get`. A custom prompt is resolved into a single user
    /// message; any other name is proxied to the backend prompt it names.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
        cancel: CancellationToken,
    ) -> Result<PromptsGetResult> {
        let (server, namespace) = self.current().await?;
        let Some(prompt) = server.prompt(name) else {
            let target = namespace.resolve_prompt(name)?;
            return target
                .connection
                .get_prompt(&target.local_name, arguments)
                .await;
        };

        let ctx = ResolutionContext {
            server: &server,
            namespace,
            blobs: self.blobs.as_ref(),
            cancel,
        };
        let message = self
            .resolver
            .resolve_message(&ctx, name, arguments.unwrap_or_default())
            .await?;
        Ok(PromptsGetResult {
            description: prompt.description.clone(),
            messages: vec![message],
        })
    }

    /// Store `bytes` and attach them as a custom resource
    pub async fn upload_resource(
        &self,
        filename: &str,
        content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<CustomResource> {
        let content_type = content_type.unwrap_or_else(|| guess_content_type(filename));
        let size = bytes.len();
        let blob_id = self.blobs.put(bytes, filename, content_type).await?;
        let resource = CustomResource::new(filename, content_type, blob_id);
        self.store.add_resource(&self.name, resource.clone()).await?;
        info!(server = %self.name, filename, size, "Stored custom resource");
        Ok(resource)
    }

    /// Load configured seed files as custom resources
    pub async fn seed_resources(&self, seeds: &[ResourceSeed]) -> Result<()> {
        for seed in seeds {
            let filename = seed.exposed_name().ok_or_else(|| {
                Error::Config(format!("Resource seed {} has no file name", seed.path.display()))
            })?;
            let bytes = tokio::fs::read(&seed.path).await?;
            self.upload_resource(&filename, seed.content_type.as_deref(), bytes)
                .await?;
        }
        Ok(())
    }

    /// Start the authorization flow of one backend
    pub async fn begin_auth(&self, backend: &str) -> Result<AuthorizationRequest> {
        self.current().await?;
        let connection = self
            .aggregator
            .connection(backend)
            .ok_or_else(|| Error::BackendNotFound(backend.to_string()))?;
        let request = connection.begin_auth().await?;
        self.aggregator.refresh().await;
        Ok(request)
    }

    /// Complete an authorization callback if one of this server's backends
    /// issued `state`; returns the backend name.
    pub async fn handle_callback(&self, state: &str, code: &str) -> Option<Result<String>> {
        let connection = self
            .aggregator
            .connections()
            .into_iter()
            .find(|c| c.owns_auth_state(state))?;
        let outcome = connection.complete_auth(state, code).await;
        self.aggregator.refresh().await;
        Some(outcome.map(|()| connection.name().to_string()))
    }

    /// Connection state of every backend
    #[must_use]
    pub fn health(&self) -> VirtualServerHealth {
        let backends = self.aggregator.connection_infos();
        VirtualServerHealth {
            name: self.name.clone(),
            healthy: backends
                .iter()
                .all(|b| b.status == ConnectionStatus::Connected),
            backends,
        }
    }

    /// Connect every backend now instead of on first use
    pub async fn warm_up(&self) -> Result<()> {
        let server = self.store.get(&self.name).await?;
        self.aggregator.sync_backends(&server.backends).await;
        self.aggregator.connect_all().await;
        Ok(())
    }

    /// Close every backend connection
    pub async fn shutdown(&self) {
        self.aggregator.shutdown().await;
    }
}

fn local_filename(uri: &str) -> Option<&str> {
    uri.strip_prefix(LOCAL_SCHEME)?.strip_prefix("://")
}

fn contents(uri: &str, bytes: Vec<u8>, content_type: String) -> ResourceContents {
    let bytes = if is_textual(&content_type) {
        match String::from_utf8(bytes) {
            Ok(text) => {
                return ResourceContents::Text {
                    uri: uri.to_string(),
                    mime_type: Some(content_type),
                    text,
                };
            }
            Err(e) => e.into_bytes(),
        }
    } else {
        bytes
    };
    ResourceContents::Blob {
        uri: uri.to_string(),
        mime_type: Some(content_type),
        blob: STANDARD.encode(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Content;
    use crate::testing::{MockBackend, connection, options};
    use crate::virtual_server::{CustomPrompt, MemoryBlobStore, MemoryStore, PromptVariable};
    use pretty_assertions::assert_eq;

    async fn facade(backends: &[(&str, &Arc<MockBackend>)]) -> VirtualMcp {
        let store = Arc::new(MemoryStore::new());
        store
            .put(VirtualServer {
                name: "demo".into(),
                display_name: Some("Demo".into()),
                prompts: vec![CustomPrompt {
                    name: "greet".into(),
                    description: Some("Say hello".into()),
                    text: "Hello @param.name!".into(),
                    variables: vec![PromptVariable {
                        name: "name".into(),
                        required: true,
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        let vmcp = VirtualMcp::new(
            "demo",
            store,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(Resolver::new(crate::config::ResolutionConfig::default())),
            options(),
        );
        for (name, backend) in backends {
            vmcp.aggregator().insert(connection(name, backend)).await;
        }
        vmcp.aggregator().connect_all().await;
        vmcp
    }

    #[tokio::test]
    async fn initialize_reports_identity() {
        let vmcp = facade(&[]).await;
        let result = vmcp.initialize().await.unwrap();
        assert_eq!(result.server_info.name, "demo");
        assert_eq!(result.server_info.title.as_deref(), Some("Demo"));
        assert!(result.capabilities.prompts.is_some());
    }

    #[tokio::test]
    async fn lists_custom_and_backend_prompts() {
        let backend = Arc::new(MockBackend::with_tools(&[]).prompt("intro", "hi"));
        let vmcp = facade(&[("docs", &backend)]).await;
        let names: Vec<_> = vmcp
            .list_prompts()
            .await
            .unwrap()
            .prompts
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["greet", "docs.intro"]);
    }

    #[tokio::test]
    async fn get_prompt_resolves_custom_prompt() {
        let vmcp = facade(&[]).await;
        let mut args = HashMap::new();
        args.insert("name".to_string(), "Alice".to_string());
        let result = vmcp
            .get_prompt("greet", Some(args), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.description.as_deref(), Some("Say hello"));
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].role, "user");
        assert_eq!(result.messages[0].content, Content::text("Hello Alice!"));
    }

    #[tokio::test]
    async fn get_prompt_proxies_backend_prompt() {
        let backend = Arc::new(MockBackend::with_tools(&[]).prompt("intro", "From docs"));
        let vmcp = facade(&[("docs", &backend)]).await;
        let result = vmcp
            .get_prompt("docs.intro", None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.messages[0].content.as_text(), Some("From docs"));
    }

    #[tokio::test]
    async fn tool_calls_bypass_resolution() {
        let backend = Arc::new(MockBackend::with_tools(&["echo"]));
        let vmcp = facade(&[("text", &backend)]).await;
        let tools = vmcp.list_tools().await.unwrap().tools;
        assert_eq!(tools[0].name, "text.echo");

        let result = vmcp
            .call_tool("text.echo", serde_json::json!({ "msg": "@param.name" }))
            .await
            .unwrap();
        assert_eq!(
            result.content[0].as_text(),
            Some(r#"{"msg":"@param.name"}"#)
        );
    }

    #[tokio::test]
    async fn uploaded_resources_are_listed_and_readable() {
        let vmcp = facade(&[]).await;
        vmcp.upload_resource("notes.md", None, b"# Notes".to_vec())
            .await
            .unwrap();
        vmcp.upload_resource("logo.png", None, vec![0x89, 0x50])
            .await
            .unwrap();

        let uris: Vec<_> = vmcp
            .list_resources()
            .await
            .unwrap()
            .resources
            .into_iter()
            .map(|r| r.uri)
            .collect();
        assert_eq!(uris, vec!["vmcp://notes.md", "vmcp://logo.png"]);

        let read = vmcp.read_resource("vmcp://notes.md").await.unwrap();
        assert!(matches!(
            &read.contents[0],
            ResourceContents::Text { text, .. } if text == "# Notes"
        ));
        let read = vmcp.read_resource("vmcp://logo.png").await.unwrap();
        assert!(matches!(&read.contents[0], ResourceContents::Blob { .. }));
        assert!(matches!(
            vmcp.read_resource("vmcp://missing.txt").await,
            Err(Error::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn seeds_resources_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guide.txt");
        std::fs::write(&path, "read me").unwrap();

        let vmcp = facade(&[]).await;
        vmcp.seed_resources(&[ResourceSeed {
            path,
            filename: None,
            content_type: None,
        }])
        .await
        .unwrap();
        let read = vmcp.read_resource("vmcp://guide.txt").await.unwrap();
        assert_eq!(read.contents[0].mime_type(), Some("text/plain"));
    }

    #[tokio::test]
    async fn callback_with_unknown_state_is_not_claimed() {
        let backend = Arc::new(MockBackend::with_tools(&["echo"]));
        let vmcp = facade(&[("text", &backend)]).await;
        assert!(vmcp.handle_callback("forged", "code").await.is_none());
        assert!(matches!(
            vmcp.begin_auth("nope").await,
            Err(Error::BackendNotFound(_))
        ));
    }

    #[tokio::test]
    async fn health_lists_backends() {
        let up = Arc::new(MockBackend::with_tools(&["echo"]));
        let down = Arc::new(MockBackend::with_tools(&["add"]));
        down.set_down(true);
        let vmcp = facade(&[("up", &up), ("down", &down)]).await;
        let health = vmcp.health();
        assert!(!health.healthy);
        assert_eq!(health.backends.len(), 2);
    }
}
