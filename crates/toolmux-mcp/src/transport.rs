//! MCP transport abstraction.
//!
//! A [`Transport`] exposes the six protocol operations the client needs. The
//! concrete transports only implement the lower level [`RpcChannel`]
//! (send a request, send a notification, close) and get the protocol
//! operations through a blanket implementation.

use crate::error::{McpError, McpResult};
use crate::protocol::{
    decode, CallToolParams, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, McpPrompt, McpResource, McpTool, ToolCallResult,
    METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_NOT_FOUND, METHOD_PROMPTS_LIST,
    METHOD_RESOURCES_LIST, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Protocol operations offered by a connected server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the `initialize` handshake and acknowledge it.
    async fn initialize(&self) -> McpResult<InitializeResult>;

    /// List the server's tools.
    async fn list_tools(&self) -> McpResult<Vec<McpTool>>;

    /// List the server's resources. Empty when the server does not support them.
    async fn list_resources(&self) -> McpResult<Vec<McpResource>>;

    /// List the server's prompts. Empty when the server does not support them.
    async fn list_prompts(&self) -> McpResult<Vec<McpPrompt>>;

    /// Invoke a tool.
    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> McpResult<ToolCallResult>;

    /// Release the underlying channel.
    async fn disconnect(&self) -> McpResult<()>;
}

/// A JSON-RPC message channel.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Send a request and wait for its result.
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()>;

    /// Close the channel.
    async fn close(&self) -> McpResult<()>;
}

#[async_trait]
impl<T: RpcChannel> Transport for T {
    async fn initialize(&self) -> McpResult<InitializeResult> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let value = self.request(METHOD_INITIALIZE, Some(params)).await?;
        let result: InitializeResult = decode(METHOD_INITIALIZE, value)?;

        debug!(
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            "Initialized"
        );

        self.notify(METHOD_INITIALIZED, None).await?;
        Ok(result)
    }

    async fn list_tools(&self) -> McpResult<Vec<McpTool>> {
        let value = self.request(METHOD_TOOLS_LIST, None).await?;
        let result: ListToolsResult = decode(METHOD_TOOLS_LIST, value)?;
        Ok(result.tools)
    }

    async fn list_resources(&self) -> McpResult<Vec<McpResource>> {
        match self.request(METHOD_RESOURCES_LIST, None).await {
            Ok(value) => Ok(decode::<ListResourcesResult>(METHOD_RESOURCES_LIST, value)?.resources),
            Err(e) if is_unsupported(&e) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn list_prompts(&self) -> McpResult<Vec<McpPrompt>> {
        match self.request(METHOD_PROMPTS_LIST, None).await {
            Ok(value) => Ok(decode::<ListPromptsResult>(METHOD_PROMPTS_LIST, value)?.prompts),
            Err(e) if is_unsupported(&e) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> McpResult<ToolCallResult> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        let value = self.request(METHOD_TOOLS_CALL, Some(params)).await?;
        decode(METHOD_TOOLS_CALL, value)
    }

    async fn disconnect(&self) -> McpResult<()> {
        self.close().await
    }
}

fn is_unsupported(err: &McpError) -> bool {
    matches!(err, McpError::Protocol { code, .. } if *code == METHOD_NOT_FOUND)
}

/// Shared, replaceable bearer credential.
///
/// The client keeps one handle and the HTTP transport reads it on every
/// request, so a token injected after construction takes effect immediately.
#[derive(Clone, Default)]
pub struct AuthHandle {
    token: Arc<RwLock<Option<String>>>,
}

impl AuthHandle {
    /// Create a handle holding `token`.
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token)),
        }
    }

    /// Replace the credential.
    pub async fn set(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    /// Current credential, if any.
    pub async fn get(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    /// `Authorization` header value for the current credential.
    pub async fn header_value(&self) -> Option<String> {
        self.get().await.map(|token| {
            if token.starts_with("Bearer ") {
                token
            } else {
                format!("Bearer {token}")
            }
        })
    }
}

impl std::fmt::Debug for AuthHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHandle").finish_non_exhaustive()
    }
}
