//! Stdio transport for local MCP servers.
//!
//! Messages are newline-delimited JSON over the child's stdin/stdout. A
//! reader task splits stdout into lines and hands decoded messages to a
//! dispatcher task through a bounded channel. The dispatcher completes
//! pending requests by id and republishes server notifications.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::RpcChannel;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const INBOUND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 64;

/// How to launch a stdio server.
#[derive(Debug, Clone, Default)]
pub struct StdioConfig {
    /// Program followed by its leading arguments.
    pub command: Vec<String>,
    /// Extra arguments appended after `command`.
    pub args: Vec<String>,
    /// Environment variables added to the child's environment.
    pub env: HashMap<String, String>,
}

/// Out-of-band events from a stdio server.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A message with a method and no id.
    Notification(JsonRpcNotification),
    /// The stream ended or the process exited. `code` is the exit code when known.
    Exited { code: Option<i32> },
}

struct PendingRequest {
    method: String,
    started: Instant,
    tx: oneshot::Sender<McpResult<Value>>,
}

/// State shared between the transport and its background tasks.
struct Shared {
    label: String,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    closed: AtomicBool,
    /// A process watcher owns the exit event and knows the exit code.
    watched: bool,
    exit_reported: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl Shared {
    /// Fail every outstanding request and publish the exit event once.
    async fn close(&self, reason: &str, code: Option<i32>) {
        self.fail_all(reason).await;
        if !self.exit_reported.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Exited { code });
        }
    }

    /// Mark the transport closed and fail every outstanding request.
    async fn fail_all(&self, reason: &str) {
        // Set before draining so a request registered concurrently sees it.
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            debug!(
                server = %self.label,
                count = drained.len(),
                reason,
                "Failing outstanding requests"
            );
        }
        for (_, pending) in drained {
            let _ = pending.tx.send(Err(McpError::transport_closed(format!(
                "{}: {reason} while waiting for {}",
                self.label, pending.method
            ))));
        }
    }

    async fn dispatch(&self, message: Value) {
        let has_method = message.get("method").is_some();
        let id = message.get("id").filter(|id| !id.is_null());

        match (id, has_method) {
            (Some(id), false) => {
                let Some(id) = id.as_u64() else {
                    debug!(server = %self.label, id = %id, "Dropping response with foreign id");
                    return;
                };

                let Some(pending) = self.pending.lock().await.remove(&id) else {
                    debug!(server = %self.label, id, "Dropping response with no pending request");
                    return;
                };

                let result = serde_json::from_value::<JsonRpcResponse>(message)
                    .map_err(|e| McpError::invalid_response(format!("Malformed response: {e}")))
                    .and_then(JsonRpcResponse::into_result);

                trace!(
                    server = %self.label,
                    id,
                    method = %pending.method,
                    elapsed_ms = pending.started.elapsed().as_millis() as u64,
                    "Response received"
                );
                let _ = pending.tx.send(result);
            }
            (None, true) => match serde_json::from_value::<JsonRpcNotification>(message) {
                Ok(notification) => {
                    trace!(server = %self.label, method = %notification.method, "Notification");
                    let _ = self.events.send(TransportEvent::Notification(notification));
                }
                Err(e) => warn!(server = %self.label, error = %e, "Malformed notification"),
            },
            (Some(_), true) => {
                debug!(server = %self.label, "Ignoring server-initiated request");
            }
            (None, false) => {
                warn!(server = %self.label, "Dropping message with neither id nor method");
            }
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stdio transport for local MCP servers.
pub struct StdioTransport {
    shared: Arc<Shared>,
    writer: Mutex<BoxedWriter>,
    next_id: AtomicU64,
    request_timeout: Duration,
    /// Asks the exit watcher to kill the child.
    kill: Mutex<Option<oneshot::Sender<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioTransport {
    /// Spawn the server process and start reading its stdout.
    pub fn spawn(label: impl Into<String>, config: &StdioConfig) -> McpResult<Self> {
        let label = label.into();
        let (program, leading) = config
            .command
            .split_first()
            .ok_or_else(|| McpError::config(format!("{label}: empty command")))?;

        let mut cmd = Command::new(program);
        cmd.args(leading)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        debug!(server = %label, command = %program, args = ?leading, "Starting MCP server");

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::Process(format!("Failed to start {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Process("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Process("Failed to get stdout".to_string()))?;

        let mut transport = Self::with_streams(label, stdout, stdin, true);

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let shared = Arc::clone(&transport.shared);
        let watcher = tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        debug!(server = %shared.label, error = %e, "Kill failed");
                    }
                    None
                }
            };
            debug!(server = %shared.label, code = ?code, "MCP server process ended");
            shared.close("process exited", code).await;
        });

        *transport.kill.get_mut() = Some(kill_tx);
        *transport.watcher.get_mut() = Some(watcher);

        Ok(transport)
    }

    /// Run the protocol over arbitrary streams instead of a child process.
    pub fn from_streams<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_streams(label, reader, writer, false)
    }

    fn with_streams<R, W>(label: impl Into<String>, reader: R, writer: W, watched: bool) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            label: label.into(),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            watched,
            exit_reported: AtomicBool::new(false),
            events,
        });

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let reader_task = tokio::spawn(read_lines(shared.label.clone(), reader, tx));
        let dispatch_task = tokio::spawn(dispatch_loop(Arc::clone(&shared), rx));

        Self {
            shared,
            writer: Mutex::new(Box::new(writer)),
            next_id: AtomicU64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            kill: Mutex::new(None),
            watcher: Mutex::new(None),
            tasks: vec![reader_task, dispatch_task],
        }
    }

    /// Override the per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Subscribe to notifications and exit events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    /// Whether the channel is gone.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a response.
    pub async fn pending_requests(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    async fn write_line(&self, mut line: String) -> McpResult<()> {
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    fn closed_error(&self) -> McpError {
        McpError::transport_closed(format!("{} is not running", self.shared.label))
    }
}

/// Split `reader` into lines and forward each parsed message.
async fn read_lines<R>(label: String, reader: R, tx: mpsc::Sender<Value>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(server = %label, error = %e, "Dropping malformed line");
                    }
                }
            }
            Ok(None) => {
                debug!(server = %label, "Server closed stdout");
                break;
            }
            Err(e) => {
                warn!(server = %label, error = %e, "Failed to read from server");
                break;
            }
        }
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<Value>) {
    while let Some(message) = rx.recv().await {
        shared.dispatch(message).await;
    }
    if shared.watched {
        shared.fail_all("stream closed").await;
    } else {
        shared.close("stream closed", None).await;
    }
}

#[async_trait]
impl RpcChannel for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                started: Instant::now(),
                tx,
            },
        );

        // Closure may have drained the map between the check and the insert.
        if self.is_closed() {
            self.shared.pending.lock().await.remove(&id);
            return Err(self.closed_error());
        }

        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        debug!(server = %self.shared.label, id, method, "Sending request");

        if let Err(e) = self.write_line(line).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(McpError::transport_closed(format!(
                "{}: write failed: {e}",
                self.shared.label
            )));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                warn!(server = %self.shared.label, id, method, "Request timed out");
                Err(McpError::RequestTimeout {
                    method: method.to_string(),
                    timeout: self.request_timeout,
                })
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        debug!(server = %self.shared.label, method, "Sending notification");
        self.write_line(line)
            .await
            .map_err(|e| McpError::transport_closed(format!("{}: write failed: {e}", self.shared.label)))
    }

    async fn close(&self) -> McpResult<()> {
        if let Err(e) = self.writer.lock().await.shutdown().await {
            trace!(server = %self.shared.label, error = %e, "Stdin already closed");
        }

        if let Some(kill) = self.kill.lock().await.take() {
            let _ = kill.send(());
        }

        if let Some(watcher) = self.watcher.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(5), watcher)
                .await
                .is_err()
            {
                warn!(server = %self.shared.label, "Timed out waiting for server to exit");
            }
        }

        self.shared.close("disconnected", None).await;
        for task in &self.tasks {
            task.abort();
        }

        debug!(server = %self.shared.label, "Closed stdio transport");
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use serde_json::json;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    /// The server end of a duplex pipe.
    struct FakeServer {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn next_request(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, message: Value) {
            let mut line = message.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
        }
    }

    fn pair() -> (Arc<StdioTransport>, FakeServer) {
        let (client, server) = duplex(64 * 1024);
        let (client_read, client_write) = split(client);
        let (server_read, server_write) = split(server);

        let transport = StdioTransport::from_streams("fake", client_read, client_write);
        let server = FakeServer {
            lines: BufReader::new(server_read).lines(),
            writer: server_write,
        };
        (Arc::new(transport), server)
    }

    #[tokio::test]
    async fn test_request_response() {
        let (transport, mut server) = pair();

        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.list_tools().await })
        };

        let request = server.next_request().await;
        assert_eq!(request["method"], "tools/list");
        server
            .send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"tools": [{"name": "echo"}]}}))
            .await;

        let tools = call.await.unwrap().unwrap();
        assert_eq!(tools[0].name, "echo");
        assert_eq!(transport.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (transport, mut server) = pair();

        let first = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.request("first", None).await })
        };
        let first_req = server.next_request().await;

        let second = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.request("second", None).await })
        };
        let second_req = server.next_request().await;
        assert_ne!(first_req["id"], second_req["id"]);

        server
            .send(json!({"jsonrpc": "2.0", "id": second_req["id"], "result": "two"}))
            .await;
        server
            .send(json!({"jsonrpc": "2.0", "id": first_req["id"], "result": "one"}))
            .await;

        assert_eq!(first.await.unwrap().unwrap(), json!("one"));
        assert_eq!(second.await.unwrap().unwrap(), json!("two"));
    }

    #[tokio::test]
    async fn test_error_envelope_rejects() {
        let (transport, mut server) = pair();

        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.request("tools/call", None).await })
        };
        let request = server.next_request().await;
        server
            .send(json!({"jsonrpc": "2.0", "id": request["id"], "error": {"code": -32000, "message": "boom"}}))
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::Protocol { code: -32000, .. }));
    }

    #[tokio::test]
    async fn test_malformed_lines_and_unknown_ids_dropped() {
        let (transport, mut server) = pair();

        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.request("ping", None).await })
        };
        let request = server.next_request().await;

        server.send_raw("this is not json\n\n").await;
        server
            .send(json!({"jsonrpc": "2.0", "id": 9999, "result": "stray"}))
            .await;
        server
            .send(json!({"jsonrpc": "2.0", "id": request["id"], "result": "pong"}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_notifications_published() {
        let (transport, mut server) = pair();
        let mut events = transport.subscribe();

        server
            .send(json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}))
            .await;

        match events.recv().await.unwrap() {
            TransportEvent::Notification(n) => {
                assert_eq!(n.method, "notifications/tools/list_changed")
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_and_late_response_dropped() {
        let (client, server) = duplex(64 * 1024);
        let (client_read, client_write) = split(client);
        let (server_read, server_write) = split(server);
        let transport = Arc::new(
            StdioTransport::from_streams("slow", client_read, client_write)
                .with_request_timeout(Duration::from_millis(50)),
        );
        let mut server = FakeServer {
            lines: BufReader::new(server_read).lines(),
            writer: server_write,
        };

        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.request("slow/op", None).await })
        };
        let request = server.next_request().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::RequestTimeout { ref method, .. } if method == "slow/op"));
        assert_eq!(transport.pending_requests().await, 0);

        // The late answer must not disturb the next request.
        server
            .send(json!({"jsonrpc": "2.0", "id": request["id"], "result": "late"}))
            .await;

        let next = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.request("fast/op", None).await })
        };
        let next_req = server.next_request().await;
        assert_ne!(next_req["id"], request["id"]);
        server
            .send(json!({"jsonrpc": "2.0", "id": next_req["id"], "result": "fresh"}))
            .await;
        assert_eq!(next.await.unwrap().unwrap(), json!("fresh"));
    }

    #[tokio::test]
    async fn test_stream_end_fails_pending() {
        let (transport, mut server) = pair();
        let mut events = transport.subscribe();

        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.request("tools/list", None).await })
        };
        server.next_request().await;
        drop(server);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::TransportClosed(_)));
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Exited { .. }
        ));

        assert!(transport.is_closed());
        assert!(matches!(
            transport.request("tools/list", None).await,
            Err(McpError::TransportClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_missing_command() {
        let config = StdioConfig {
            command: vec!["toolmux-definitely-not-a-command".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            StdioTransport::spawn("missing", &config),
            Err(McpError::Process(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_process_exit_closes_transport() {
        let config = StdioConfig {
            command: vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            ..Default::default()
        };
        let transport = StdioTransport::spawn("quitter", &config).unwrap();
        let mut events = transport.subscribe();

        let err = transport.initialize().await.unwrap_err();
        assert!(matches!(err, McpError::TransportClosed(_)), "{err:?}");

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TransportEvent::Exited { code: Some(3) }), "{event:?}");

        transport.disconnect().await.unwrap();
        assert!(matches!(events.try_recv(), Err(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_cat_echo_server() {
        // `cat` echoes our request back; it has an id and a method so it is
        // ignored, and the request times out.
        let config = StdioConfig {
            command: vec!["cat".to_string()],
            ..Default::default()
        };
        let transport = StdioTransport::spawn("cat", &config)
            .unwrap()
            .with_request_timeout(Duration::from_millis(100));

        assert!(matches!(
            transport.request("ping", None).await,
            Err(McpError::RequestTimeout { .. })
        ));
        transport.disconnect().await.unwrap();
        assert!(transport.is_closed());
    }
}
