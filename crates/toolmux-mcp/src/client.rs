//! Per-server MCP client.
//!
//! An [`McpClient`] owns the transport for one named server together with
//! the tools, resources and prompts it advertised, and tracks the
//! connection state:
//!
//! ```text
//! disconnected -> connecting -> connected
//!                            -> auth_required
//!                            -> error
//! ```
//!
//! Only an explicit [`McpClient::connect`] leaves `auth_required` or `error`.

use crate::config::{ServerConfig, TransportConfig};
use crate::error::{McpError, McpResult};
use crate::http::{HttpConfig, HttpTransport};
use crate::protocol::{InitializeResult, McpPrompt, McpResource, McpTool, ToolCallResult};
use crate::stdio::{StdioConfig, StdioTransport, DEFAULT_REQUEST_TIMEOUT};
use crate::transport::{AuthHandle, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection state of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    AuthRequired,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::AuthRequired => "auth_required",
            Self::Error => "error",
        };
        f.pad(text)
    }
}

/// Snapshot of a server's health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
}

#[derive(Default)]
struct Discovered {
    info: Option<InitializeResult>,
    tools: Vec<Arc<McpTool>>,
    resources: Vec<McpResource>,
    prompts: Vec<McpPrompt>,
}

struct Inner {
    state: ConnectionState,
    transport: Option<Arc<dyn Transport>>,
    discovered: Discovered,
    last_error: Option<String>,
}

/// Client for one named MCP server.
pub struct McpClient {
    name: String,
    config: RwLock<ServerConfig>,
    auth: AuthHandle,
    inner: RwLock<Inner>,
    /// Serializes connection attempts.
    connect_lock: Mutex<()>,
}

impl McpClient {
    /// Create a disconnected client.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            auth: AuthHandle::new(config.auth_token.clone()),
            config: RwLock::new(config),
            inner: RwLock::new(Inner {
                state: ConnectionState::Disconnected,
                transport: None,
                discovered: Discovered::default(),
                last_error: None,
            }),
            connect_lock: Mutex::new(()),
        }
    }

    /// Server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current configuration.
    pub async fn config(&self) -> ServerConfig {
        self.config.read().await.clone()
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.read().await.state
    }

    /// Status snapshot.
    pub async fn status(&self) -> ServerStatus {
        let inner = self.inner.read().await;
        ServerStatus {
            state: inner.state,
            error: inner.last_error.clone(),
            tools: inner.discovered.tools.len(),
            resources: inner.discovered.resources.len(),
            prompts: inner.discovered.prompts.len(),
        }
    }

    /// Tools advertised by the server.
    pub async fn tools(&self) -> Vec<Arc<McpTool>> {
        self.inner.read().await.discovered.tools.clone()
    }

    /// Resources advertised by the server.
    pub async fn resources(&self) -> Vec<McpResource> {
        self.inner.read().await.discovered.resources.clone()
    }

    /// Prompts advertised by the server.
    pub async fn prompts(&self) -> Vec<McpPrompt> {
        self.inner.read().await.discovered.prompts.clone()
    }

    /// Result of the last successful handshake.
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.inner.read().await.discovered.info.clone()
    }

    /// Whether a bearer credential is configured.
    pub async fn has_credential(&self) -> bool {
        self.auth.get().await.is_some()
    }

    /// Replace the bearer credential on the live transport and in the config.
    pub async fn set_auth_token(&self, token: Option<String>) {
        self.auth.set(token.clone()).await;
        self.config.write().await.auth_token = token;
        debug!(server = %self.name, "Updated credential");
    }

    /// Connect, handshake and discover capabilities.
    ///
    /// Returns the resulting state. An authorization failure on a server
    /// that requires OAuth ends in [`ConnectionState::AuthRequired`] and is
    /// not an error; any other failure ends in [`ConnectionState::Error`]
    /// and is returned.
    pub async fn connect(&self) -> McpResult<ConnectionState> {
        let _guard = self.connect_lock.lock().await;

        if self.state().await == ConnectionState::Connected {
            return Ok(ConnectionState::Connected);
        }

        self.inner.write().await.state = ConnectionState::Connecting;
        info!(server = %self.name, "Connecting to MCP server");

        let transport = match self.build_transport().await {
            Ok(transport) => transport,
            Err(e) => return self.connect_failed(e).await,
        };

        match discover(&self.name, transport.as_ref()).await {
            Ok(discovered) => {
                info!(
                    server = %self.name,
                    tools = discovered.tools.len(),
                    resources = discovered.resources.len(),
                    prompts = discovered.prompts.len(),
                    "Connected to MCP server"
                );
                let mut inner = self.inner.write().await;
                inner.state = ConnectionState::Connected;
                inner.transport = Some(transport);
                inner.discovered = discovered;
                inner.last_error = None;
                Ok(ConnectionState::Connected)
            }
            Err(e) => {
                if let Err(close_err) = transport.disconnect().await {
                    debug!(server = %self.name, error = %close_err, "Error releasing transport");
                }
                self.connect_failed(e).await
            }
        }
    }

    async fn build_transport(&self) -> McpResult<Arc<dyn Transport>> {
        let config = self.config.read().await;

        let transport: Arc<dyn Transport> = match &config.transport {
            TransportConfig::Http { url } => {
                let http = HttpConfig {
                    url: url.clone(),
                    headers: config.headers.clone(),
                    timeout: config.timeout().unwrap_or(DEFAULT_HTTP_TIMEOUT),
                };
                Arc::new(HttpTransport::new(http, self.auth.clone())?)
            }
            TransportConfig::Stdio { command, args, env } => {
                let stdio = StdioConfig {
                    command: command.clone(),
                    args: args.clone(),
                    env: env.clone(),
                };
                Arc::new(
                    StdioTransport::spawn(self.name.clone(), &stdio)?
                        .with_request_timeout(config.timeout().unwrap_or(DEFAULT_REQUEST_TIMEOUT)),
                )
            }
        };

        Ok(transport)
    }

    async fn connect_failed(&self, err: McpError) -> McpResult<ConnectionState> {
        let oauth_required = self.config.read().await.oauth_required();

        let mut inner = self.inner.write().await;
        inner.transport = None;
        inner.discovered = Discovered::default();
        inner.last_error = Some(err.to_string());

        if oauth_required && err.is_auth_error() {
            warn!(server = %self.name, "Authentication required (OAuth setup needed)");
            inner.state = ConnectionState::AuthRequired;
            Ok(ConnectionState::AuthRequired)
        } else {
            warn!(server = %self.name, error = %err, "Failed to connect to MCP server");
            inner.state = ConnectionState::Error;
            Err(err)
        }
    }

    /// Call a tool on this server.
    ///
    /// A disconnected client connects first. Clients in `auth_required` or
    /// `error` fail without I/O until [`McpClient::connect`] succeeds.
    pub async fn call_tool(&self, tool: &str, arguments: Option<Value>) -> McpResult<ToolCallResult> {
        let mut state = self.state().await;
        if state == ConnectionState::Connecting {
            // Wait for the attempt in flight.
            drop(self.connect_lock.lock().await);
            state = self.state().await;
        }

        match state {
            ConnectionState::Connected => {}
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                if self.config.read().await.oauth_required() && !self.has_credential().await {
                    return Err(McpError::AuthRequired(format!(
                        "{} requires OAuth authorization",
                        self.name
                    )));
                }
                match self.connect().await? {
                    ConnectionState::Connected => {}
                    ConnectionState::AuthRequired => return Err(self.auth_required_error().await),
                    other => {
                        return Err(McpError::NotConnected(format!("{} is {other}", self.name)))
                    }
                }
            }
            ConnectionState::AuthRequired => return Err(self.auth_required_error().await),
            ConnectionState::Error => {
                let reason = self
                    .inner
                    .read()
                    .await
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "connection failed".to_string());
                return Err(McpError::NotConnected(format!(
                    "{}: {reason} (reconnect required)",
                    self.name
                )));
            }
        }

        let transport = self
            .inner
            .read()
            .await
            .transport
            .clone()
            .ok_or_else(|| McpError::NotConnected(self.name.clone()))?;

        debug!(server = %self.name, tool, "Calling MCP tool");

        match transport.call_tool(tool, arguments).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.note_call_failure(&e).await;
                Err(McpError::tool_failed(tool, e))
            }
        }
    }

    async fn auth_required_error(&self) -> McpError {
        let detail = self.inner.read().await.last_error.clone();
        McpError::AuthRequired(match detail {
            Some(detail) => format!("{}: {detail}", self.name),
            None => self.name.clone(),
        })
    }

    /// Move out of `connected` when a call shows the session is gone.
    async fn note_call_failure(&self, err: &McpError) {
        let oauth_required = self.config.read().await.oauth_required();
        let next = match err {
            McpError::TransportClosed(_) => ConnectionState::Error,
            e if e.is_auth_error() && oauth_required => ConnectionState::AuthRequired,
            _ => return,
        };

        warn!(server = %self.name, state = %next, error = %err, "Tool call lost the connection");
        let transport = {
            let mut inner = self.inner.write().await;
            inner.state = next;
            inner.last_error = Some(err.to_string());
            inner.transport.take()
        };

        // Reaps a child that closed its pipes but kept running.
        if let Some(transport) = transport {
            if let Err(e) = transport.disconnect().await {
                debug!(server = %self.name, error = %e, "Error releasing transport");
            }
        }
    }

    /// Release the transport. Safe to call in any state.
    pub async fn disconnect(&self) -> McpResult<()> {
        let _guard = self.connect_lock.lock().await;

        let transport = {
            let mut inner = self.inner.write().await;
            inner.state = ConnectionState::Disconnected;
            inner.discovered = Discovered::default();
            inner.transport.take()
        };

        if let Some(transport) = transport {
            transport.disconnect().await?;
            info!(server = %self.name, "Disconnected from MCP server");
        }
        Ok(())
    }
}

/// Handshake and list capabilities. Tools are mandatory; resources and
/// prompts are best-effort.
async fn discover(name: &str, transport: &dyn Transport) -> McpResult<Discovered> {
    let info = transport.initialize().await?;
    let tools = transport.list_tools().await?;

    let resources = transport.list_resources().await.unwrap_or_else(|e| {
        debug!(server = %name, error = %e, "Resource discovery failed");
        Vec::new()
    });
    let prompts = transport.list_prompts().await.unwrap_or_else(|e| {
        debug!(server = %name, error = %e, "Prompt discovery failed");
        Vec::new()
    });

    Ok(Discovered {
        info: Some(info),
        tools: tools.into_iter().map(Arc::new).collect(),
        resources,
        prompts,
    })
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
