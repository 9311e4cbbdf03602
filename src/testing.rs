//! In-process backend used by unit tests

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::backend::{BackendConnection, ConnectionOptions};
use crate::config::Config;
use crate::error::rpc_codes;
use crate::protocol::{JsonRpcResponse, PROTOCOL_VERSION, RequestId};
use crate::transport::Transport;
use crate::{Error, Result};

/// Tools: `add(a, b)` sums, `echo` returns its arguments as JSON text,
/// `fail` reports an execution error.
#[derive(Default)]
pub(crate) struct MockBackend {
    tools: Vec<String>,
    resources: Vec<Value>,
    prompts: Vec<(String, String)>,
    calls: Mutex<Vec<(String, Value)>>,
    down: AtomicBool,
}

impl MockBackend {
    pub(crate) fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    pub(crate) fn text_resource(mut self, uri: &str, text: &str) -> Self {
        self.resources
            .push(json!({ "uri": uri, "mimeType": "text/plain", "text": text }));
        self
    }

    pub(crate) fn blob_resource(mut self, uri: &str, mime: &str, bytes: &[u8]) -> Self {
        self.resources
            .push(json!({ "uri": uri, "mimeType": mime, "blob": STANDARD.encode(bytes) }));
        self
    }

    pub(crate) fn prompt(mut self, name: &str, text: &str) -> Self {
        self.prompts.push((name.to_string(), text.to_string()));
        self
    }

    pub(crate) fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    fn call(&self, params: &Value) -> std::result::Result<Value, (i32, String)> {
        let name = params["name"].as_str().unwrap_or_default();
        let args = &params["arguments"];
        if !self.tools.iter().any(|t| t == name) {
            return Err((rpc_codes::METHOD_NOT_FOUND, format!("Tool not found: {name}")));
        }
        self.calls.lock().push((name.to_string(), args.clone()));
        Ok(match name {
            "add" => {
                let sum = args["a"].as_f64().unwrap_or_default() + args["b"].as_f64().unwrap_or_default();
                json!({ "content": [{ "type": "text", "text": format!("{sum}") }] })
            }
            "fail" => json!({ "content": [{ "type": "text", "text": "tool exploded" }], "isError": true }),
            _ => json!({ "content": [{ "type": "text", "text": args.to_string() }] }),
        })
    }
}

#[async_trait]
impl Transport for MockBackend {
    async fn open(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".into()));
        }
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection reset".into()));
        }
        let id = RequestId::Number(1);
        let params = params.unwrap_or_default();
        let result = match method {
            "initialize" => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {}, "resources": {}, "prompts": {} },
                "serverInfo": { "name": "mock", "version": "0.0.0" }
            }),
            "tools/list" => json!({
                "tools": self.tools.iter().map(|t| json!({ "name": t })).collect::<Vec<_>>()
            }),
            "tools/call" => match self.call(&params) {
                Ok(result) => result,
                Err((code, message)) => return Ok(JsonRpcResponse::error(Some(id), code, message)),
            },
            "resources/list" => json!({
                "resources": self.resources.iter().map(|r| json!({
                    "uri": r["uri"],
                    "name": r["uri"],
                    "mimeType": r["mimeType"],
                })).collect::<Vec<_>>()
            }),
            "resources/read" => {
                match self.resources.iter().find(|r| r["uri"] == params["uri"]) {
                    Some(r) => json!({ "contents": [r] }),
                    None => {
                        return Ok(JsonRpcResponse::error(Some(id), -32002, "Resource not found"));
                    }
                }
            }
            "prompts/list" => json!({
                "prompts": self.prompts.iter().map(|(n, _)| json!({ "name": n })).collect::<Vec<_>>()
            }),
            "prompts/get" => match self.prompts.iter().find(|(n, _)| params["name"] == n.as_str()) {
                Some((_, text)) => json!({
                    "messages": [{ "role": "user", "content": { "type": "text", "text": text } }]
                }),
                None => return Ok(JsonRpcResponse::error(Some(id), -32602, "Unknown prompt")),
            },
            other => {
                return Ok(JsonRpcResponse::error(
                    Some(id),
                    rpc_codes::METHOD_NOT_FOUND,
                    format!("Method not found: {other}"),
                ));
            }
        };
        Ok(JsonRpcResponse::success(id, result))
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn options() -> ConnectionOptions {
    let mut config = Config::default();
    config.reconnect.initial_backoff = std::time::Duration::ZERO;
    config.reconnect.max_backoff = std::time::Duration::ZERO;
    ConnectionOptions::new(&config).unwrap()
}

pub(crate) fn connection(name: &str, backend: &Arc<MockBackend>) -> Arc<BackendConnection> {
    let transport: Arc<dyn Transport> = Arc::clone(backend) as Arc<dyn Transport>;
    Arc::new(BackendConnection::from_transport(name, transport, &options()))
}
