//! Where configs and cached tokens live.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use toolmux_auth::{FileTokenStore, TokenStore};
use toolmux_mcp::{load_server_configs, BringUpReport, McpManager, ServerConfig};

/// Resolved locations for one invocation.
pub struct Paths {
    pub servers_dir: PathBuf,
    pub token_file: PathBuf,
}

impl Paths {
    /// Use explicit paths where given, platform defaults otherwise.
    pub fn resolve(servers: Option<PathBuf>, tokens: Option<PathBuf>) -> anyhow::Result<Self> {
        let servers_dir = match servers {
            Some(dir) => dir,
            None => toolmux_mcp::config::default_servers_dir()
                .context("Could not determine config directory, pass --servers")?,
        };
        let token_file = match tokens {
            Some(file) => file,
            None => toolmux_auth::default_token_path()
                .context("Could not determine data directory, pass --tokens")?,
        };
        Ok(Self {
            servers_dir,
            token_file,
        })
    }

    pub fn token_store(&self) -> Arc<dyn TokenStore> {
        Arc::new(FileTokenStore::with_path(&self.token_file))
    }

    pub async fn load_configs(&self) -> anyhow::Result<Vec<ServerConfig>> {
        load_server_configs(&self.servers_dir).await.with_context(|| {
            format!(
                "Failed to read server configs from {}",
                self.servers_dir.display()
            )
        })
    }

    /// Connect to every configured server, or only `only` when given.
    pub async fn connect(&self, only: Option<&str>) -> anyhow::Result<(McpManager, BringUpReport)> {
        let mut configs = self.load_configs().await?;
        if configs.is_empty() {
            anyhow::bail!(
                "No servers configured. Add *.json files to {}",
                self.servers_dir.display()
            );
        }
        if let Some(name) = only {
            configs.retain(|c| c.name == name);
            if configs.is_empty() {
                anyhow::bail!("Server '{name}' not found");
            }
        }

        let manager = McpManager::with_token_store(self.token_store());
        let report = manager.load_and_connect_all(configs).await;
        Ok((manager, report))
    }
}
