//! Multi-server Model Context Protocol (MCP) client.
//!
//! Connects to any number of independently implemented MCP servers,
//! discovers their tools and exposes one call interface regardless of
//! transport.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐     ┌────────────┐     ┌───────────┐     ┌─────────────┐
//! │   caller   │────▶│ McpManager │────▶│ McpClient │────▶│  Transport  │
//! │            │◀────│ (tool idx) │◀────│  (state)  │◀────│ http/stdio  │
//! └────────────┘     └────────────┘     └───────────┘     └─────────────┘
//!                          │
//!                          ▼
//!                 ┌───────────────────┐     ┌────────────┐
//!                 │ CredentialManager │────▶│ TokenStore │
//!                 └───────────────────┘     └────────────┘
//! ```
//!
//! # Supported Transports
//!
//! - **http**: one POST per message, JSON or event-stream answers
//! - **stdio**: local process speaking newline-delimited JSON
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use toolmux_auth::FileTokenStore;
//! use toolmux_mcp::{McpManager, ServerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = McpManager::with_token_store(Arc::new(FileTokenStore::new()?));
//!
//! let report = manager
//!     .load_and_connect_all(vec![
//!         ServerConfig::http("files", "https://mcp.example.com/files"),
//!         ServerConfig::stdio("git", ["mcp-server-git", "--repository", "."]),
//!     ])
//!     .await;
//! println!("{} connected", report.connected.len());
//!
//! for entry in manager.search_tools("commit").await {
//!     println!("{}", entry.key);
//! }
//!
//! let result = manager
//!     .call_tool("git", "git_log", Some(serde_json::json!({"max_count": 5})))
//!     .await?;
//! println!("{}", result.text());
//! # Ok(())
//! # }
//! ```

pub mod callback;
mod client;
pub mod config;
mod error;
pub mod http;
mod manager;
pub mod oauth;
pub mod protocol;
pub mod stdio;
mod transport;

pub use callback::{code_from_redirect, CallbackListener};
pub use client::{ConnectionState, McpClient, ServerStatus};
pub use config::{load_server_configs, OAuthSettings, ServerConfig, TransportConfig};
pub use error::{McpError, McpResult, NetworkFailureKind};
pub use http::{HttpConfig, HttpTransport};
pub use manager::{
    credential_manager_for, BringUpReport, IndexedTool, McpManager, ToolIndex, ToolKey,
};
pub use oauth::{AuthorizationRequest, CredentialManager, FlowState};
pub use protocol::{McpPrompt, McpResource, McpTool, ToolCallResult, ToolContent};
pub use stdio::{StdioConfig, StdioTransport, TransportEvent};
pub use transport::{AuthHandle, RpcChannel, Transport};
