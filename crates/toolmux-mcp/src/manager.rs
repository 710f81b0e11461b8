//! Multi-server connection manager.
//!
//! Brings up every enabled server concurrently, tolerates individual
//! failures, and keeps a global tool index keyed by `(server, tool)` so
//! identically named tools on different servers never collide.

use crate::client::{ConnectionState, McpClient, ServerStatus};
use crate::config::ServerConfig;
use crate::error::{McpError, McpResult};
use crate::oauth::CredentialManager;
use crate::protocol::{McpTool, ToolCallResult};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use toolmux_auth::{TokenSet, TokenStore};
use tracing::{debug, info, warn};

/// Composite key of an indexed tool.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ToolKey {
    pub server: String,
    pub tool: String,
}

impl ToolKey {
    pub fn new(server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
        }
    }
}

impl std::fmt::Display for ToolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.server, self.tool)
    }
}

/// Tools of every connected server.
pub type ToolIndex = BTreeMap<ToolKey, Arc<McpTool>>;

/// A tool together with the server offering it.
#[derive(Debug, Clone)]
pub struct IndexedTool {
    pub key: ToolKey,
    pub tool: Arc<McpTool>,
}

/// Outcome of [`McpManager::load_and_connect_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BringUpReport {
    pub connected: Vec<String>,
    pub auth_required: Vec<String>,
    /// Server name to error message.
    pub failed: BTreeMap<String, String>,
}

/// Build a credential manager for `server` out of a set of configs.
///
/// Other servers using the same token endpoint become siblings and receive
/// copies of newly exchanged tokens.
pub fn credential_manager_for(
    configs: &[ServerConfig],
    server: &str,
    store: Arc<dyn TokenStore>,
) -> McpResult<CredentialManager> {
    let config = configs
        .iter()
        .find(|c| c.name == server)
        .ok_or_else(|| McpError::ServerNotFound(server.to_string()))?;
    let settings = config
        .oauth
        .clone()
        .ok_or_else(|| McpError::config(format!("{server} has no oauth configuration")))?;

    let siblings = configs
        .iter()
        .filter(|c| c.name != server)
        .filter(|c| {
            c.oauth
                .as_ref()
                .is_some_and(|o| o.token_url == settings.token_url)
        })
        .map(|c| c.name.clone())
        .collect();

    Ok(CredentialManager::new(server, settings, store)?.with_siblings(siblings))
}

/// Registry of named MCP clients.
pub struct McpManager {
    clients: RwLock<BTreeMap<String, Arc<McpClient>>>,
    configs: RwLock<Vec<ServerConfig>>,
    index: RwLock<Arc<ToolIndex>>,
    store: Option<Arc<dyn TokenStore>>,
}

impl McpManager {
    /// Create a manager without a credential cache.
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(BTreeMap::new()),
            configs: RwLock::new(Vec::new()),
            index: RwLock::new(Arc::new(ToolIndex::new())),
            store: None,
        }
    }

    /// Create a manager injecting credentials from `store`.
    pub fn with_token_store(store: Arc<dyn TokenStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    /// Register and connect every enabled server.
    ///
    /// Connection attempts overlap. A failing server is recorded in the
    /// report and never aborts the others. Disabled servers are skipped
    /// entirely.
    pub async fn load_and_connect_all(&self, configs: Vec<ServerConfig>) -> BringUpReport {
        self.disconnect_all().await;

        let mut report = BringUpReport::default();
        let mut enabled: Vec<ServerConfig> = Vec::new();
        for config in configs {
            if !config.enabled {
                info!(server = %config.name, "Skipping disabled server");
                continue;
            }
            if enabled.iter().any(|c| c.name == config.name) {
                warn!(server = %config.name, "Skipping duplicate server name");
                continue;
            }
            if let Err(e) = config.validate() {
                warn!(server = %config.name, error = %e, "Skipping invalid server config");
                report.failed.insert(config.name.clone(), e.to_string());
                continue;
            }
            enabled.push(config);
        }

        *self.configs.write().await = enabled.clone();
        info!(count = enabled.len(), "Bringing up MCP servers");

        let mut clients = Vec::with_capacity(enabled.len());
        for mut config in enabled {
            self.inject_cached_token(&mut config).await;
            clients.push(Arc::new(McpClient::new(config)));
        }

        let results = join_all(clients.iter().map(|client| client.connect())).await;

        for (client, result) in clients.iter().zip(results) {
            let name = client.name().to_string();
            match result {
                Ok(ConnectionState::Connected) => report.connected.push(name),
                Ok(ConnectionState::AuthRequired) => report.auth_required.push(name),
                Ok(other) => {
                    report.failed.insert(name, format!("ended in state {other}"));
                }
                Err(e) => {
                    report.failed.insert(name, e.to_string());
                }
            }
        }

        {
            let mut registry = self.clients.write().await;
            for client in clients {
                registry.insert(client.name().to_string(), client);
            }
        }
        self.rebuild_index().await;

        info!(
            connected = report.connected.len(),
            auth_required = report.auth_required.len(),
            failed = report.failed.len(),
            "MCP bring-up complete"
        );
        report
    }

    /// Put a usable cached token into `config`, refreshing it if needed.
    async fn inject_cached_token(&self, config: &mut ServerConfig) {
        let Some(store) = self.store.clone() else {
            return;
        };

        let tokens = match store.get(&config.name).await {
            Ok(Some(tokens)) => tokens,
            Ok(None) => return,
            Err(e) => {
                warn!(server = %config.name, error = %e, "Failed to read cached credentials");
                return;
            }
        };

        if !tokens.is_expired() {
            debug!(server = %config.name, "Using cached credentials");
            config.auth_token = Some(tokens.access_token);
            return;
        }

        if !tokens.can_refresh() {
            warn!(server = %config.name, "Cached credentials expired and cannot be refreshed");
            return;
        }

        let configs = self.configs.read().await.clone();
        let refreshed = match credential_manager_for(&configs, &config.name, store) {
            Ok(manager) => manager.refresh_token().await,
            Err(e) => Err(e),
        };

        match refreshed {
            Ok(tokens) => config.auth_token = Some(tokens.access_token),
            Err(e) => {
                warn!(server = %config.name, error = %e, "Failed to refresh cached credentials")
            }
        }
    }

    /// Replace the tool index with the tools of every connected client.
    async fn rebuild_index(&self) {
        let clients: Vec<Arc<McpClient>> = self.clients.read().await.values().cloned().collect();

        let mut index = ToolIndex::new();
        for client in clients {
            if client.state().await != ConnectionState::Connected {
                continue;
            }
            for tool in client.tools().await {
                index.insert(ToolKey::new(client.name(), tool.name.clone()), tool);
            }
        }

        debug!(tools = index.len(), "Rebuilt tool index");
        *self.index.write().await = Arc::new(index);
    }

    /// Look up a registered client.
    pub async fn client(&self, server: &str) -> Option<Arc<McpClient>> {
        self.clients.read().await.get(server).cloned()
    }

    async fn require_client(&self, server: &str) -> McpResult<Arc<McpClient>> {
        self.client(server)
            .await
            .ok_or_else(|| McpError::ServerNotFound(server.to_string()))
    }

    /// Names of registered servers.
    pub async fn server_names(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }

    /// Call `tool` on `server`.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<Value>,
    ) -> McpResult<ToolCallResult> {
        let client = self.require_client(server).await?;

        let before = client.state().await;
        let result = client.call_tool(tool, arguments).await;
        if client.state().await != before {
            self.rebuild_index().await;
        }
        result
    }

    /// Snapshot of the tool index.
    pub async fn tool_index(&self) -> Arc<ToolIndex> {
        Arc::clone(&*self.index.read().await)
    }

    /// Look up one tool.
    pub async fn tool(&self, server: &str, tool: &str) -> Option<Arc<McpTool>> {
        self.tool_index()
            .await
            .get(&ToolKey::new(server, tool))
            .cloned()
    }

    /// Every indexed tool, ordered by server then tool name.
    pub async fn all_tools(&self) -> Vec<IndexedTool> {
        self.tool_index()
            .await
            .iter()
            .map(|(key, tool)| IndexedTool {
                key: key.clone(),
                tool: Arc::clone(tool),
            })
            .collect()
    }

    /// Tools whose name or description contains `query`, ignoring case.
    pub async fn search_tools(&self, query: &str) -> Vec<IndexedTool> {
        let query = query.to_lowercase();
        self.all_tools()
            .await
            .into_iter()
            .filter(|entry| {
                entry.tool.name.to_lowercase().contains(&query)
                    || entry
                        .tool
                        .description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&query))
            })
            .collect()
    }

    /// Status of every registered server.
    pub async fn statuses(&self) -> BTreeMap<String, ServerStatus> {
        let clients: Vec<Arc<McpClient>> = self.clients.read().await.values().cloned().collect();
        let mut statuses = BTreeMap::new();
        for client in clients {
            statuses.insert(client.name().to_string(), client.status().await);
        }
        statuses
    }

    /// Disconnect and forget every server. Safe to call repeatedly.
    pub async fn disconnect_all(&self) {
        let clients = std::mem::take(&mut *self.clients.write().await);
        *self.index.write().await = Arc::new(ToolIndex::new());

        for (name, client) in clients {
            if let Err(e) = client.disconnect().await {
                warn!(server = %name, error = %e, "Error disconnecting server");
            }
        }
    }

    /// Reconnect one server and refresh the index.
    pub async fn connect(&self, server: &str) -> McpResult<ConnectionState> {
        let client = self.require_client(server).await?;

        let mut config = client.config().await;
        let before = config.auth_token.clone();
        self.inject_cached_token(&mut config).await;
        if config.auth_token != before {
            client.set_auth_token(config.auth_token).await;
        }

        let result = client.connect().await;
        self.rebuild_index().await;
        result
    }

    /// Inject a bearer credential into a registered server.
    pub async fn set_auth_token(&self, server: &str, token: Option<String>) -> McpResult<()> {
        self.require_client(server).await?.set_auth_token(token).await;
        Ok(())
    }

    /// Credential manager for a registered server.
    pub async fn credential_manager(&self, server: &str) -> McpResult<CredentialManager> {
        let store = self
            .store
            .clone()
            .ok_or_else(|| McpError::config("no token store configured"))?;
        let configs = self.configs.read().await;
        credential_manager_for(&configs, server, store)
    }

    /// Run the browser authorization flow for `server` and hand the new
    /// token to it and its siblings.
    pub async fn authorize<F>(
        &self,
        server: &str,
        open_url: F,
        timeout: Duration,
    ) -> McpResult<TokenSet>
    where
        F: FnOnce(&str) + Send,
    {
        let manager = self.credential_manager(server).await?;
        let tokens = manager.authorize(open_url, timeout).await?;

        for name in std::iter::once(server).chain(manager.siblings().iter().map(String::as_str)) {
            if let Some(client) = self.client(name).await {
                client.set_auth_token(Some(tokens.access_token.clone())).await;
            }
        }
        Ok(tokens)
    }
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new()
    }
}
