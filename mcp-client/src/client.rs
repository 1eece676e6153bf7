use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::types::JSONRPC_VERSION;
use crate::types::JsonRpcMessage;
use crate::types::JsonRpcNotification;
use crate::types::JsonRpcRequest;

/// Capacity of the bounded channels between the client API and the IO tasks.
const CHANNEL_CAPACITY: usize = 128;

const CLIENT_NAME: &str = "overpass";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const PROTOCOL_VERSION: &str = "2024-11-05";

type PendingSender = oneshot::Sender<Result<Value, McpClientError>>;
type PendingMap = Arc<Mutex<HashMap<i64, PendingSender>>>;

#[derive(Debug, thiserror::Error)]
pub enum McpClientError {
    #[error("failed to spawn MCP server: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("client is closed")]
    Closed,
    #[error("request timed out")]
    Timeout,
    #[error("server returned JSON-RPC error: code = {code}, message = {message}")]
    Rpc { code: i64, message: String },
    #[error("failed to serialize request: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A running MCP client instance. At most one alive child per server id at
/// a time is the registry's invariant; the client itself only manages its
/// own subprocess.
pub struct McpClient {
    child: Mutex<Option<Child>>,

    /// Channel carrying frames to the background writer task.
    outgoing_tx: mpsc::Sender<JsonRpcMessage>,

    /// `request.id -> oneshot::Sender` used to hand responses back to the
    /// originating caller.
    pending: PendingMap,

    /// Monotonically increasing counter used to generate request ids.
    id_counter: AtomicI64,

    initialized: AtomicBool,
    closed: Arc<AtomicBool>,

    notifications_tx: broadcast::Sender<JsonRpcNotification>,
}

impl McpClient {
    /// Spawn `program` with `args` and establish an MCP session over its
    /// stdio. The child inherits this process's environment plus `env`.
    pub async fn spawn(
        program: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, McpClientError> {
        let mut child = Command::new(program)
            .args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // Best-effort reaping if this process dies with clients open.
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("failed to capture child stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("failed to capture child stdout"))?;
        let stderr = child.stderr.take();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (notifications_tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        // Writer task: serialize frames onto the child's stdin, one per line.
        tokio::spawn({
            let mut stdin = stdin;
            async move {
                while let Some(msg) = outgoing_rx.recv().await {
                    match serde_json::to_string(&msg) {
                        Ok(payload) => {
                            debug!("MCP -> server: {payload}");
                            if stdin.write_all(payload.as_bytes()).await.is_err()
                                || stdin.write_all(b"\n").await.is_err()
                            {
                                error!("failed to write frame to MCP server stdin");
                                break;
                            }
                        }
                        Err(err) => error!("failed to serialize JSON-RPC frame: {err}"),
                    }
                }
            }
        });

        // Reader task: parse line-delimited JSON from the child's stdout and
        // route responses to the pending map. EOF means the child exited, at
        // which point the client closes and every pending request is
        // rejected.
        tokio::spawn({
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            let notifications_tx = notifications_tx.clone();
            let mut lines = BufReader::new(stdout).lines();
            async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("MCP <- server: {line}");
                    match serde_json::from_str::<JsonRpcMessage>(&line) {
                        Ok(JsonRpcMessage::Response(resp)) => {
                            dispatch(&pending, resp.id, Ok(resp.result)).await;
                        }
                        Ok(JsonRpcMessage::Error(err)) => {
                            let result = Err(McpClientError::Rpc {
                                code: err.error.code,
                                message: err.error.message,
                            });
                            dispatch(&pending, err.id, result).await;
                        }
                        Ok(JsonRpcMessage::Notification(notification)) => {
                            // No subscribers is fine; the frame is dropped.
                            let _ = notifications_tx.send(notification);
                        }
                        Ok(JsonRpcMessage::Request(request)) => {
                            info!("ignoring server-initiated request: {}", request.method);
                        }
                        Err(err) => {
                            warn!("skipping unparseable MCP frame: {err}; line = {line}");
                        }
                    }
                }
                close_shared(&closed, &pending).await;
            }
        });

        // Forward the child's stderr into our logs so server-side failures
        // are diagnosable.
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("MCP server stderr: {line}");
                }
            });
        }

        Ok(Self {
            child: Mutex::new(Some(child)),
            outgoing_tx,
            pending,
            id_counter: AtomicI64::new(1),
            initialized: AtomicBool::new(false),
            closed,
            notifications_tx,
        })
    }

    /// Negotiate initialization: send `initialize` with our fixed client
    /// identity, then the `notifications/initialized` notification.
    pub async fn initialize(&self, timeout: Option<Duration>) -> Result<Value, McpClientError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": CLIENT_NAME, "version": CLIENT_VERSION},
        });
        let result = self.request("initialize", Some(params), timeout).await?;
        self.notify("notifications/initialized", None).await?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(result)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send an arbitrary request and await its response. Fails immediately
    /// when the client is closed.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, McpClientError> {
        if self.is_closed() {
            return Err(McpClientError::Closed);
        }

        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        };

        let (tx, rx) = oneshot::channel();
        // Register before sending so an immediate response cannot be lost.
        {
            let mut guard = self.pending.lock().await;
            guard.insert(id, tx);
        }

        if self
            .outgoing_tx
            .send(JsonRpcMessage::Request(request))
            .await
            .is_err()
        {
            let mut guard = self.pending.lock().await;
            guard.remove(&id);
            return Err(McpClientError::Closed);
        }

        let outcome = match timeout {
            Some(duration) => match time::timeout(duration, rx).await {
                Ok(received) => received,
                Err(_) => {
                    let mut guard = self.pending.lock().await;
                    guard.remove(&id);
                    return Err(McpClientError::Timeout);
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(result) => result,
            // Sender dropped without a reply: the client closed underneath us.
            Err(_) => Err(McpClientError::Closed),
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpClientError> {
        if self.is_closed() {
            return Err(McpClientError::Closed);
        }
        let notification = JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        };
        self.outgoing_tx
            .send(JsonRpcMessage::Notification(notification))
            .await
            .map_err(|_| McpClientError::Closed)
    }

    /// Convenience wrapper around `tools/list`.
    pub async fn list_tools(&self, timeout: Option<Duration>) -> Result<Value, McpClientError> {
        self.request("tools/list", None, timeout).await
    }

    /// Convenience wrapper around `tools/call`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, McpClientError> {
        let params = json!({"name": name, "arguments": arguments.unwrap_or(Value::Null)});
        self.request("tools/call", Some(params), timeout).await
    }

    /// Subscribe to server-initiated notifications.
    pub fn notifications(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.notifications_tx.subscribe()
    }

    /// Kill the child and reject every pending request. Idempotent.
    pub async fn close(&self) {
        close_shared(&self.closed, &self.pending).await;
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(err) = child.kill().await {
                warn!("failed to kill MCP server process: {err}");
            }
        }
    }
}

async fn dispatch(pending: &PendingMap, id: i64, result: Result<Value, McpClientError>) {
    let tx = {
        let mut guard = pending.lock().await;
        guard.remove(&id)
    };
    match tx {
        // The receiver may have timed out and gone away; that is fine.
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => warn!(id, "no pending request found for response"),
    }
}

async fn close_shared(closed: &Arc<AtomicBool>, pending: &PendingMap) {
    if closed.swap(true, Ordering::SeqCst) {
        return;
    }
    let mut guard = pending.lock().await;
    for (_, tx) in guard.drain() {
        let _ = tx.send(Err(McpClientError::Closed));
    }
}
