//! HTTP request-response transport for remote MCP servers.
//!
//! Every protocol message is one HTTP POST. The server answers either with a
//! JSON body or with a short `text/event-stream` whose first `data:` line
//! carries the JSON-RPC response.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{AuthHandle, RpcChannel};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const SESSION_HEADER: &str = "mcp-session-id";

/// HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Endpoint receiving every POST.
    pub url: String,
    /// Static headers sent with every request.
    pub headers: HashMap<String, String>,
    /// Overall request timeout.
    pub timeout: Duration,
}

impl HttpConfig {
    /// Config for `url` with no extra headers and a 60 second timeout.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// HTTP transport for remote MCP servers.
pub struct HttpTransport {
    config: HttpConfig,
    client: Client,
    auth: AuthHandle,
    next_id: AtomicU64,
    /// Session id issued by the server, echoed on later requests.
    session_id: RwLock<Option<String>>,
}

impl HttpTransport {
    /// Create a new HTTP transport reading its credential from `auth`.
    pub fn new(config: HttpConfig, auth: AuthHandle) -> McpResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| McpError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            config,
            client,
            auth,
            next_id: AtomicU64::new(1),
            session_id: RwLock::new(None),
        })
    }

    /// Session id issued by the server, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    async fn post(&self, body: String) -> McpResult<reqwest::Response> {
        let mut req = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body);

        for (name, value) in &self.config.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        if let Some(value) = self.auth.header_value().await {
            req = req.header("Authorization", value);
        }

        if let Some(session_id) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_HEADER, session_id);
        }

        let response = req.send().await.map_err(McpError::from_reqwest)?;

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut session_id = self.session_id.write().await;
            if session_id.as_deref() != Some(id) {
                debug!(session_id = %id, "Server issued session id");
                *session_id = Some(id.to_string());
            }
        }

        Ok(response)
    }

    async fn read_response(&self, response: reqwest::Response) -> McpResult<JsonRpcResponse> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::from_status(status.as_u16(), &self.config.url, &body));
        }

        let is_event_stream = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        if is_event_stream {
            return read_event_stream(response).await;
        }

        let text = response.text().await.map_err(McpError::from_reqwest)?;
        serde_json::from_str(&text)
            .map_err(|e| McpError::invalid_response(format!("Invalid JSON response: {e}")))
    }
}

/// Scan an event stream for the first `data:` line holding a JSON-RPC response.
async fn read_event_stream(response: reqwest::Response) -> McpResult<JsonRpcResponse> {
    use futures::StreamExt;

    scan_event_stream(
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(McpError::from_reqwest)),
    )
    .await
}

/// Lines are split on raw bytes so a character spanning two chunks is
/// decoded whole.
async fn scan_event_stream<S, B>(chunks: S) -> McpResult<JsonRpcResponse>
where
    S: futures::Stream<Item = McpResult<B>>,
    B: AsRef<[u8]>,
{
    use futures::StreamExt;

    let mut chunks = std::pin::pin!(chunks);
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = chunks.next().await {
        buffer.extend_from_slice(chunk?.as_ref());

        while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            if let Some(response) = parse_data_line(&String::from_utf8_lossy(&line)) {
                return Ok(response);
            }
        }
    }

    // The final event may not be newline-terminated.
    if let Some(response) = parse_data_line(&String::from_utf8_lossy(&buffer)) {
        return Ok(response);
    }

    Err(McpError::invalid_response(
        "Event stream ended without a response",
    ))
}

fn parse_data_line(line: &str) -> Option<JsonRpcResponse> {
    let data = line.trim_end().strip_prefix("data:")?.trim_start();
    let response: JsonRpcResponse = serde_json::from_str(data).ok()?;
    (response.result.is_some() || response.error.is_some()).then_some(response)
}

#[async_trait]
impl RpcChannel for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        debug!(id, method, url = %self.config.url, "Sending HTTP request");

        let response = self.post(body).await?;
        self.read_response(response).await?.into_result()
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let body = serde_json::to_string(&JsonRpcNotification::new(method, params))?;

        debug!(method, "Sending HTTP notification");

        let response = self.post(body).await?;
        if !response.status().is_success() {
            warn!(
                method,
                status = %response.status(),
                "Notification returned non-success status"
            );
        }

        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        *self.session_id.write().await = None;
        debug!(url = %self.config.url, "Closed HTTP transport");
        Ok(())
    }
}
