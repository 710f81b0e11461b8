//! Token store backends.

use crate::error::{AuthError, AuthResult};
use crate::token::TokenSet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// A keyed store of `server name → TokenSet`.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Get the tokens cached for a server.
    async fn get(&self, server: &str) -> AuthResult<Option<TokenSet>>;

    /// Store tokens for several servers in a single write.
    async fn set_many(&self, entries: Vec<(String, TokenSet)>) -> AuthResult<()>;

    /// Store tokens for one server.
    async fn set(&self, server: &str, tokens: TokenSet) -> AuthResult<()> {
        self.set_many(vec![(server.to_string(), tokens)]).await
    }

    /// Remove the tokens for a server. Returns `true` if an entry existed.
    async fn remove(&self, server: &str) -> AuthResult<bool>;

    /// Get every cached entry.
    async fn all(&self) -> AuthResult<HashMap<String, TokenSet>>;
}

fn validate_key(server: &str) -> AuthResult<()> {
    if server.trim().is_empty() {
        return Err(AuthError::InvalidKey(server.to_string()));
    }
    Ok(())
}

/// Token store backed by a single JSON file.
///
/// Writes go to a temporary sibling file which is then renamed over the
/// target, so readers never observe a partially written cache.
pub struct FileTokenStore {
    path: PathBuf,
    cache: RwLock<Option<HashMap<String, TokenSet>>>,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FileTokenStore {
    /// Create a store at the default platform path.
    pub fn new() -> AuthResult<Self> {
        let path = crate::default_token_path().ok_or(AuthError::NoDataDir)?;
        Ok(Self::with_path(path))
    }

    /// Create a store at a custom path.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the token file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn load(&self) -> AuthResult<HashMap<String, TokenSet>> {
        {
            let cache = self.cache.read().await;
            if let Some(data) = &*cache {
                return Ok(data.clone());
            }
        }

        let data = self.read_file().await?;
        *self.cache.write().await = Some(data.clone());
        Ok(data)
    }

    async fn read_file(&self) -> AuthResult<HashMap<String, TokenSet>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(AuthError::Io(e)),
        };

        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        // Parse entries individually so one corrupt entry does not hide the rest.
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(&content)?;
        let mut result = HashMap::new();
        for (server, value) in raw {
            match serde_json::from_value::<TokenSet>(value) {
                Ok(tokens) => {
                    result.insert(server, tokens);
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "Skipping invalid token entry");
                }
            }
        }

        Ok(result)
    }

    async fn write_file(&self, data: &HashMap<String, TokenSet>) -> AuthResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(data)?;
        let temp_path = self.path.with_extension("json.tmp");
        // `mode` only applies when the file is created.
        let _ = tokio::fs::remove_file(&temp_path).await;

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&temp_path, perms)
                .await
                .map_err(|e| {
                    AuthError::Permissions(format!(
                        "Failed to set permissions on {:?}: {}",
                        temp_path, e
                    ))
                })?;
        }

        tokio::fs::rename(&temp_path, &self.path).await?;
        *self.cache.write().await = Some(data.clone());

        debug!(path = ?self.path, entries = data.len(), "Wrote token cache");
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get(&self, server: &str) -> AuthResult<Option<TokenSet>> {
        Ok(self.load().await?.get(server).cloned())
    }

    async fn set_many(&self, entries: Vec<(String, TokenSet)>) -> AuthResult<()> {
        for (server, _) in &entries {
            validate_key(server)?;
        }

        let _guard = self.write_lock.lock().await;
        let mut all = self.load().await?;
        for (server, tokens) in entries {
            debug!(server = %server, "Caching tokens");
            all.insert(server, tokens);
        }
        self.write_file(&all).await
    }

    async fn remove(&self, server: &str) -> AuthResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.load().await?;
        let existed = all.remove(server).is_some();
        if existed {
            self.write_file(&all).await?;
        }
        Ok(existed)
    }

    async fn all(&self) -> AuthResult<HashMap<String, TokenSet>> {
        self.load().await
    }
}

impl std::fmt::Debug for FileTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTokenStore")
            .field("path", &self.path)
            .finish()
    }
}

/// In-memory token store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    data: std::sync::RwLock<HashMap<String, TokenSet>>,
}

impl MemoryTokenStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, server: &str) -> AuthResult<Option<TokenSet>> {
        let data = self
            .data
            .read()
            .map_err(|e| AuthError::LockPoisoned(e.to_string()))?;
        Ok(data.get(server).cloned())
    }

    async fn set_many(&self, entries: Vec<(String, TokenSet)>) -> AuthResult<()> {
        for (server, _) in &entries {
            validate_key(server)?;
        }

        let mut data = self
            .data
            .write()
            .map_err(|e| AuthError::LockPoisoned(e.to_string()))?;
        data.extend(entries);
        Ok(())
    }

    async fn remove(&self, server: &str) -> AuthResult<bool> {
        let mut data = self
            .data
            .write()
            .map_err(|e| AuthError::LockPoisoned(e.to_string()))?;
        Ok(data.remove(server).is_some())
    }

    async fn all(&self) -> AuthResult<HashMap<String, TokenSet>> {
        let data = self
            .data
            .read()
            .map_err(|e| AuthError::LockPoisoned(e.to_string()))?;
        Ok(data.clone())
    }
}
