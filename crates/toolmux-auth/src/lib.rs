//! Credential cache for toolmux.
//!
//! OAuth tokens obtained for remote tool servers are cached per server name
//! so a later run can reuse them without re-authorizing.
//!
//! # Storage Location
//!
//! The default file store lives in a platform-specific data directory:
//! - Linux: `~/.local/share/toolmux/tokens.json`
//! - macOS: `~/Library/Application Support/toolmux/tokens.json`
//! - Windows: `%APPDATA%/toolmux/tokens.json`
//!
//! The file is replaced atomically on every write and created with
//! restrictive permissions (0600 on Unix).
//!
//! # Example
//!
//! ```no_run
//! use toolmux_auth::{FileTokenStore, TokenSet, TokenStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = FileTokenStore::new()?;
//!
//!     store.set("files", TokenSet::bearer("access-token")).await?;
//!
//!     if let Some(tokens) = store.get("files").await? {
//!         println!("expired: {}", tokens.is_expired());
//!     }
//!
//!     Ok(())
//! }
//! ```

mod error;
mod store;
mod token;

pub use error::{AuthError, AuthResult};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use token::TokenSet;

/// Get the default token file path for the current platform.
///
/// Returns `None` if the data directory cannot be determined.
pub fn default_token_path() -> Option<std::path::PathBuf> {
    dirs::data_dir().map(|p| p.join("toolmux").join("tokens.json"))
}
