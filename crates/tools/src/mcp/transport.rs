//! Line-delimited JSON-RPC 2.0 transport for MCP servers.
//!
//! One JSON message per line, over a child process' stdio or a TCP socket.
//! Responses are matched to requests by id; messages the server initiates
//! are logged and dropped.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kestrel_config::McpServerConfig;
use kestrel_security::{CommandCheck, CommandPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::McpError;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

/// Any incoming message. Responses carry `id` and no `method`.
#[derive(Debug, Deserialize)]
struct JsonRpcMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcMessage>>>>;

/// Sends requests and notifications to one server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for its response. On cancellation the server
    /// is told via `notifications/cancelled`.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;

    async fn close(&self);

    fn is_connected(&self) -> bool;
}

pub struct LineTransport {
    label: String,
    next_id: AtomicU64,
    writer_tx: mpsc::Sender<String>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    timeout: Duration,
    child: tokio::sync::Mutex<Option<Child>>,
    /// Stops the reader and writer tasks.
    shutdown: CancellationToken,
}

impl LineTransport {
    /// Wire a transport over any reader/writer pair.
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W, timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label = label.into();
        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(32);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        let connected_for_writer = Arc::clone(&connected);
        let writer_label = label.clone();
        let writer_shutdown = shutdown.clone();
        let mut writer = writer;
        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    line = writer_rx.recv() => match line {
                        Some(line) => line,
                        None => break,
                    },
                    _ = writer_shutdown.cancelled() => break,
                };
                let sent = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.flush().await
                };
                if let Err(e) = sent.await {
                    warn!(server = %writer_label, error = %e, "MCP write failed");
                    connected_for_writer.store(false, Ordering::SeqCst);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let pending_for_reader = Arc::clone(&pending);
        let connected_for_reader = Arc::clone(&connected);
        let reader_label = label.clone();
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => line,
                        _ => break,
                    },
                    _ = reader_shutdown.cancelled() => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                trace!(server = %reader_label, line = %line, "MCP message");
                let message: JsonRpcMessage = match serde_json::from_str(&line) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(server = %reader_label, error = %e, "Ignoring non JSON-RPC line");
                        continue;
                    }
                };
                if let Some(method) = &message.method {
                    debug!(server = %reader_label, method = %method, "Ignoring server-initiated message");
                    continue;
                }
                let Some(id) = message.id.as_ref().and_then(Value::as_u64) else {
                    continue;
                };
                let waiter = pending_for_reader.lock().ok().and_then(|mut p| p.remove(&id));
                if let Some(waiter) = waiter {
                    let _ = waiter.send(message);
                }
            }
            connected_for_reader.store(false, Ordering::SeqCst);
            // Dropping the senders wakes every waiter with a disconnect.
            if let Ok(mut p) = pending_for_reader.lock() {
                p.clear();
            }
            debug!(server = %reader_label, "MCP reader finished");
        });

        Self {
            label,
            next_id: AtomicU64::new(1),
            writer_tx,
            pending,
            connected,
            timeout,
            child: tokio::sync::Mutex::new(None),
            shutdown,
        }
    }

    /// Spawn a stdio server after vetting its command line.
    pub fn spawn_stdio(
        server_name: &str,
        config: &McpServerConfig,
        policy: &CommandPolicy,
    ) -> Result<Self, McpError> {
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| McpError::Connection("no command configured".into()))?;
        let argv = std::iter::once(command.to_string())
            .chain(config.args.iter().cloned())
            .collect();
        let argv = match policy.check_argv(argv) {
            CommandCheck::Allowed { argv } => argv,
            CommandCheck::Denied { reason } => return Err(McpError::CommandDenied(reason)),
        };

        info!(server = %server_name, command = %command, args = ?config.args, "Spawning MCP server");
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(Path::new(cwd));
        }

        let mut child = cmd.spawn().map_err(|e| McpError::Spawn {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(McpError::Spawn {
                command: command.to_string(),
                reason: "stdio not captured".into(),
            });
        };
        if let Some(stderr) = child.stderr.take() {
            let label = server_name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %label, "stderr: {line}");
                }
            });
        }

        let mut transport =
            Self::new(server_name, stdout, stdin, Duration::from_millis(config.timeout_ms));
        transport.child = tokio::sync::Mutex::new(Some(child));
        Ok(transport)
    }

    /// Connect to a socket server at `host:port`.
    pub async fn connect_tcp(server_name: &str, address: &str, timeout: Duration) -> Result<Self, McpError> {
        info!(server = %server_name, address = %address, "Connecting to MCP server");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| McpError::Connection(format!("timed out connecting to {address}")))?
            .map_err(|e| McpError::Connection(format!("{address}: {e}")))?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(server_name, reader, writer, timeout))
    }

    async fn send_line(&self, message: &impl Serialize) -> Result<(), McpError> {
        let mut line =
            serde_json::to_string(message).map_err(|e| McpError::Protocol(e.to_string()))?;
        line.push('\n');
        self.writer_tx
            .send(line)
            .await
            .map_err(|_| McpError::Disconnected)
    }

    fn forget(&self, id: u64) {
        if let Ok(mut p) = self.pending.lock() {
            p.remove(&id);
        }
    }
}

#[async_trait]
impl McpTransport for LineTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        if !self.is_connected() {
            return Err(McpError::Disconnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| McpError::Disconnected)?
            .insert(id, tx);

        debug!(server = %self.label, id, method, "MCP request");
        if let Err(e) = self
            .send_line(&JsonRpcRequest { jsonrpc: "2.0", id, method, params })
            .await
        {
            self.forget(id);
            return Err(e);
        }

        let message = tokio::select! {
            received = tokio::time::timeout(self.timeout, rx) => match received {
                Ok(Ok(message)) => message,
                Ok(Err(_)) => return Err(McpError::Disconnected),
                Err(_) => {
                    self.forget(id);
                    return Err(McpError::Timeout {
                        method: method.to_string(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    });
                }
            },
            _ = cancel.cancelled() => {
                self.forget(id);
                let params = json!({ "requestId": id, "reason": "cancelled by user" });
                if let Err(e) = self.notify("notifications/cancelled", Some(params)).await {
                    debug!(server = %self.label, error = %e, "Could not deliver cancellation");
                }
                return Err(McpError::Cancelled);
            }
        };

        if let Some(error) = message.error {
            return Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(message.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if !self.is_connected() {
            return Err(McpError::Disconnected);
        }
        self.send_line(&JsonRpcNotification { jsonrpc: "2.0", method, params })
            .await
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        if let Ok(mut p) = self.pending.lock() {
            p.clear();
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(server = %self.label, error = %e, "MCP server already exited");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for LineTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    /// Answers each request line with `{"echo": method}`; skips notifications.
    fn echo_server(io: tokio::io::DuplexStream) -> tokio::sync::mpsc::UnboundedReceiver<Value> {
        let (seen_tx, seen_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(io);
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let msg: Value = serde_json::from_str(&line).unwrap();
                let _ = seen_tx.send(msg.clone());
                if msg["method"] == "slow" || msg.get("id").is_none() {
                    continue;
                }
                // a server-initiated request first, which must be ignored
                let ping = json!({ "jsonrpc": "2.0", "id": 999, "method": "ping" });
                let reply = json!({ "jsonrpc": "2.0", "id": msg["id"], "result": { "echo": msg["method"] } });
                writer.write_all(format!("{ping}\n{reply}\n").as_bytes()).await.unwrap();
            }
        });
        seen_rx
    }

    fn transport(timeout_ms: u64) -> (LineTransport, tokio::sync::mpsc::UnboundedReceiver<Value>) {
        let (client, server) = duplex(4096);
        let seen = echo_server(server);
        let (reader, writer) = tokio::io::split(client);
        (LineTransport::new("test", reader, writer, Duration::from_millis(timeout_ms)), seen)
    }

    #[tokio::test]
    async fn request_matches_response_by_id() {
        let (t, _seen) = transport(1000);
        let cancel = CancellationToken::new();
        let a = t.request("tools/list", None, &cancel).await.unwrap();
        let b = t.request("tools/call", Some(json!({})), &cancel).await.unwrap();
        assert_eq!(a["echo"], "tools/list");
        assert_eq!(b["echo"], "tools/call");
    }

    #[tokio::test]
    async fn request_times_out() {
        let (t, _seen) = transport(50);
        let err = t.request("slow", None, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
    }

    #[tokio::test]
    async fn cancellation_notifies_server() {
        let (t, mut seen) = transport(5_000);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = t.request("slow", None, &cancel).await.unwrap_err();
        assert!(matches!(err, McpError::Cancelled));

        let first = seen.recv().await.unwrap();
        let second = seen.recv().await.unwrap();
        assert_eq!(second["method"], "notifications/cancelled");
        assert_eq!(second["params"]["requestId"], first["id"]);
    }

    #[tokio::test]
    async fn closed_transport_refuses_requests() {
        let (t, _seen) = transport(1000);
        t.close().await;
        assert!(!t.is_connected());
        let err = t.request("tools/list", None, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, McpError::Disconnected));
    }

    #[tokio::test]
    async fn close_releases_tcp_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let t = LineTransport::connect_tcp("tcp", &address, Duration::from_secs(1))
            .await
            .unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        t.close().await;
        assert!(!t.is_connected());

        // the peer sees end of stream while the transport is still alive
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), peer.read(&mut buf))
            .await
            .expect("connection left open after close");
        assert_eq!(read.unwrap(), 0);
    }

    #[test]
    fn stdio_command_is_vetted() {
        let config = McpServerConfig {
            command: Some("curl".into()),
            args: vec![],
            env: Default::default(),
            cwd: None,
            tcp: None,
            timeout_ms: 1000,
            trust: false,
        };
        let err = LineTransport::spawn_stdio("bad", &config, &CommandPolicy::default()).err().unwrap();
        assert!(matches!(err, McpError::CommandDenied(_)));
    }
}
