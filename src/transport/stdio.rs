//! Stdio transport (subprocess speaking newline-delimited JSON-RPC)

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

use super::Transport;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::{Error, Result};

/// Longest accepted stdout line
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

type Pending = DashMap<String, oneshot::Sender<JsonRpcResponse>>;

/// Stdio transport for subprocess MCP backends
pub struct StdioTransport {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
    timeout: Duration,
    child: Mutex<Option<Child>>,
    writer: Mutex<Option<ChildStdin>>,
    pending: Arc<Pending>,
    connected: Arc<AtomicBool>,
    request_id: AtomicI64,
}

impl StdioTransport {
    /// Create a stdio transport. The command line is split with shell
    /// quoting rules.
    pub fn new(
        command: &str,
        env: HashMap<String, String>,
        cwd: Option<String>,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let mut parts = shlex::split(command)
            .ok_or_else(|| Error::Config(format!("Unbalanced quoting in command: {command}")))?
            .into_iter();
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("Empty command".to_string()))?;

        Ok(Arc::new(Self {
            program,
            args: parts.collect(),
            env,
            cwd,
            timeout,
            child: Mutex::new(None),
            writer: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            connected: Arc::new(AtomicBool::new(false)),
            request_id: AtomicI64::new(1),
        }))
    }

    async fn write_line(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let stdin = writer
            .as_mut()
            .ok_or_else(|| Error::Transport("Not connected".to_string()))?;
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Route one stdout line to the request waiting for it. Lines that are not
/// responses (server notifications, log noise) are dropped.
fn dispatch_line(pending: &Pending, line: &str) {
    match serde_json::from_str::<JsonRpcResponse>(line) {
        Ok(response) => {
            let Some(id) = response.id.as_ref().map(ToString::to_string) else {
                return;
            };
            if let Some((_, sender)) = pending.remove(&id) {
                let _ = sender.send(response);
            }
        }
        Err(e) => debug!(error = %e, "Ignoring non-response line from backend"),
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn open(&self) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Transport(format!("Failed to spawn {}: {e}", self.program)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("Failed to get stdout".to_string()))?;

        *self.writer.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        self.connected.store(true, Ordering::Relaxed);

        let pending = Arc::clone(&self.pending);
        let connected = Arc::clone(&self.connected);
        let program = self.program.clone();
        tokio::spawn(async move {
            let mut lines =
                FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => dispatch_line(&pending, &line),
                    Err(e) => {
                        warn!(program = %program, error = %e, "Backend stdout read failed");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::Relaxed);
            // Wake every waiter; their senders drop here.
            pending.clear();
            debug!(program = %program, "Stdio reader task ended");
        });

        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_id();
        let key = id.to_string();
        let request = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);

        if let Err(e) = self.write_line(&serde_json::to_string(&request)?).await {
            self.pending.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Transport("Backend process exited".to_string())),
            Err(_) => {
                self.pending.remove(&key);
                Err(Error::Transport(format!(
                    "Request '{method}' timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcRequest::notification(method, params);
        self.write_line(&serde_json::to_string(&notification)?).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        *self.writer.lock().await = None;
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.kill().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_is_shell_split() {
        let t = StdioTransport::new(
            r#"python -m "my server" --flag"#,
            HashMap::new(),
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(t.program, "python");
        assert_eq!(t.args, vec!["-m", "my server", "--flag"]);
    }

    #[test]
    fn empty_or_unbalanced_command_rejected() {
        assert!(StdioTransport::new("", HashMap::new(), None, Duration::from_secs(1)).is_err());
        assert!(
            StdioTransport::new("run \"oops", HashMap::new(), None, Duration::from_secs(1))
                .is_err()
        );
    }

    #[tokio::test]
    async fn dispatch_routes_by_id() {
        let pending = Pending::new();
        let (tx, rx) = oneshot::channel();
        pending.insert("3".to_string(), tx);
        dispatch_line(&pending, r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#);
        dispatch_line(&pending, "not json");
        dispatch_line(&pending, r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#);
        let response = rx.await.unwrap();
        assert_eq!(response.result.unwrap()["ok"], true);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn request_before_open_fails() {
        let t = StdioTransport::new("cat", HashMap::new(), None, Duration::from_secs(1)).unwrap();
        let err = t.request("ping", None).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(t.pending.is_empty());
    }
}
