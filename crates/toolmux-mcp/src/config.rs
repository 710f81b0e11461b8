//! Server configuration.
//!
//! One JSON file per server, for example:
//!
//! ```json
//! {
//!   "name": "food",
//!   "type": "http",
//!   "url": "https://mcp.example.com/food",
//!   "oauth": {
//!     "required": true,
//!     "authUrl": "https://auth.example.com/authorize",
//!     "tokenUrl": "https://auth.example.com/token",
//!     "scopes": ["mcp:tools"]
//!   }
//! }
//! ```

use crate::error::{McpError, McpResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Redirect URI used when an OAuth descriptor does not name one.
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:3000/oauth/callback";

fn default_enabled() -> bool {
    true
}

/// Configuration of one named server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Unique server name.
    pub name: String,

    /// Disabled servers are skipped at bring-up.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// How to reach the server.
    #[serde(flatten)]
    pub transport: TransportConfig,

    /// Static headers sent with every HTTP request.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Bearer credential. Filled from the token cache at bring-up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// OAuth descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthSettings>,
}

/// Transport selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Request-response over HTTP POST.
    #[serde(alias = "request-response")]
    Http { url: String },

    /// A local process speaking newline-delimited JSON over stdin/stdout.
    #[serde(alias = "process-pipe")]
    Stdio {
        /// Program followed by its leading arguments.
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
}

/// OAuth 2.0 descriptor for a server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthSettings {
    /// Whether the server refuses unauthenticated requests.
    #[serde(default)]
    pub required: bool,
    pub auth_url: String,
    pub token_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

impl OAuthSettings {
    /// Redirect URI, falling back to the local default.
    pub fn redirect_uri(&self) -> &str {
        self.redirect_uri.as_deref().unwrap_or(DEFAULT_REDIRECT_URI)
    }

    /// Client id, falling back to the server name.
    pub fn client_id<'a>(&'a self, server: &'a str) -> &'a str {
        self.client_id.as_deref().unwrap_or(server)
    }
}

impl ServerConfig {
    /// HTTP server config.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_transport(name, TransportConfig::Http { url: url.into() })
    }

    /// Stdio server config. `command` is the program followed by its arguments.
    pub fn stdio<I, S>(name: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_transport(
            name,
            TransportConfig::Stdio {
                command: command.into_iter().map(Into::into).collect(),
                args: Vec::new(),
                env: HashMap::new(),
            },
        )
    }

    fn with_transport(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            transport,
            headers: HashMap::new(),
            auth_token: None,
            timeout_secs: None,
            oauth: None,
        }
    }

    /// Attach an OAuth descriptor.
    pub fn with_oauth(mut self, oauth: OAuthSettings) -> Self {
        self.oauth = Some(oauth);
        self
    }

    /// Set the bearer credential.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Enable or disable the server.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether the server demands OAuth credentials.
    pub fn oauth_required(&self) -> bool {
        self.oauth.as_ref().is_some_and(|o| o.required)
    }

    /// Configured request timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Check that the config is usable.
    pub fn validate(&self) -> McpResult<()> {
        if self.name.trim().is_empty() {
            return Err(McpError::config("server name must not be empty"));
        }

        match &self.transport {
            TransportConfig::Http { url } => {
                url::Url::parse(url).map_err(|e| {
                    McpError::config(format!("{}: invalid url {url}: {e}", self.name))
                })?;
            }
            TransportConfig::Stdio { command, .. } => {
                if !command.first().is_some_and(|c| !c.trim().is_empty()) {
                    return Err(McpError::config(format!("{}: empty command", self.name)));
                }
            }
        }

        if let Some(oauth) = &self.oauth {
            for (field, value) in [("authUrl", &oauth.auth_url), ("tokenUrl", &oauth.token_url)] {
                url::Url::parse(value).map_err(|e| {
                    McpError::config(format!("{}: invalid oauth {field}: {e}", self.name))
                })?;
            }
        }

        Ok(())
    }
}

/// Default directory holding server config files.
pub fn default_servers_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("toolmux").join("servers"))
}

/// Load every `*.json` server config in `dir`, sorted by file name.
///
/// Unreadable or invalid files are logged and skipped. A missing directory
/// yields an empty list.
pub async fn load_server_configs(dir: &Path) -> McpResult<Vec<ServerConfig>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = ?dir, "Server config directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut configs: Vec<ServerConfig> = Vec::new();
    for path in paths {
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read server config");
                continue;
            }
        };

        let config = match serde_json::from_str::<ServerConfig>(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = ?path, error = %e, "Skipping invalid server config");
                continue;
            }
        };

        if let Err(e) = config.validate() {
            warn!(path = ?path, error = %e, "Skipping invalid server config");
            continue;
        }

        if configs.iter().any(|c| c.name == config.name) {
            warn!(path = ?path, server = %config.name, "Skipping duplicate server name");
            continue;
        }

        configs.push(config);
    }

    debug!(dir = ?dir, count = configs.len(), "Loaded server configs");
    Ok(configs)
}
