//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use vmcp_gateway::backend::{BackendConnection, ConnectionOptions};
use vmcp_gateway::config::Config;
use vmcp_gateway::protocol::{JsonRpcResponse, PROTOCOL_VERSION, RequestId};
use vmcp_gateway::transport::Transport;
use vmcp_gateway::{Error, Result};

/// Scripted MCP backend. `add` sums `a` and `b`; every other tool echoes
/// its arguments as JSON text.
#[derive(Default)]
pub struct FakeBackend {
    tools: Vec<String>,
    resources: Vec<(String, String)>,
    prompts: Vec<(String, String)>,
    calls: Mutex<Vec<(String, Value)>>,
    refuse: bool,
}

impl FakeBackend {
    pub fn tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn resource(mut self, uri: &str, text: &str) -> Self {
        self.resources.push((uri.to_string(), text.to_string()));
        self
    }

    pub fn prompt(mut self, name: &str, text: &str) -> Self {
        self.prompts.push((name.to_string(), text.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    fn answer(&self, method: &str, params: &Value) -> std::result::Result<Value, String> {
        Ok(match method {
            "initialize" => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {}, "resources": {}, "prompts": {} },
                "serverInfo": { "name": "fake", "version": "1.0.0" }
            }),
            "tools/list" => json!({
                "tools": self.tools.iter().map(|t| json!({ "name": t })).collect::<Vec<_>>()
            }),
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default();
                if !self.tools.iter().any(|t| t == name) {
                    return Err(format!("unknown tool {name}"));
                }
                let args = params["arguments"].clone();
                self.calls.lock().push((name.to_string(), args.clone()));
                let text = if name == "add" {
                    let sum = args["a"].as_i64().unwrap_or_default()
                        + args["b"].as_i64().unwrap_or_default();
                    sum.to_string()
                } else {
                    args.to_string()
                };
                json!({ "content": [{ "type": "text", "text": text }] })
            }
            "resources/list" => json!({
                "resources": self.resources.iter().map(|(uri, _)| json!({
                    "uri": uri, "name": uri, "mimeType": "text/plain"
                })).collect::<Vec<_>>()
            }),
            "resources/read" => {
                let (uri, text) = self
                    .resources
                    .iter()
                    .find(|(uri, _)| params["uri"] == uri.as_str())
                    .ok_or_else(|| "no such resource".to_string())?;
                json!({ "contents": [{ "uri": uri, "mimeType": "text/plain", "text": text }] })
            }
            "prompts/list" => json!({
                "prompts": self.prompts.iter().map(|(n, _)| json!({ "name": n })).collect::<Vec<_>>()
            }),
            "prompts/get" => {
                let (_, text) = self
                    .prompts
                    .iter()
                    .find(|(n, _)| params["name"] == n.as_str())
                    .ok_or_else(|| "no such prompt".to_string())?;
                json!({ "messages": [{ "role": "user", "content": { "type": "text", "text": text } }] })
            }
            other => return Err(format!("unsupported {other}")),
        })
    }
}

#[async_trait]
impl Transport for FakeBackend {
    async fn open(&self) -> Result<()> {
        if self.refuse {
            return Err(Error::Transport("connection refused".into()));
        }
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let params = params.unwrap_or_default();
        Ok(match self.answer(method, &params) {
            Ok(result) => JsonRpcResponse::success(RequestId::Number(1), result),
            Err(message) => JsonRpcResponse::error(Some(RequestId::Number(1)), -32602, message),
        })
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.refuse
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Connection options with reconnect backoff disabled
pub fn options() -> ConnectionOptions {
    let mut config = Config::default();
    config.reconnect.initial_backoff = std::time::Duration::ZERO;
    config.reconnect.max_backoff = std::time::Duration::ZERO;
    ConnectionOptions::new(&config).unwrap()
}

pub fn connection(name: &str, backend: &Arc<FakeBackend>) -> Arc<BackendConnection> {
    let transport: Arc<dyn Transport> = Arc::clone(backend) as Arc<dyn Transport>;
    Arc::new(BackendConnection::from_transport(name, transport, &options()))
}
