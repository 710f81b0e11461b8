//! OAuth command handlers.

use super::Paths;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use toolmux_auth::TokenSet;
use toolmux_mcp::{credential_manager_for, CredentialManager};
use tracing::warn;

/// Run the browser authorization flow for `server`.
pub async fn auth_server(
    paths: &Paths,
    server: &str,
    timeout_secs: u64,
    no_browser: bool,
    manual: bool,
) -> anyhow::Result<()> {
    let configs = paths.load_configs().await?;
    let manager = credential_manager_for(&configs, server, paths.token_store())?;

    println!("Authorizing '{server}'");
    let tokens = if manual {
        authorize_manually(&manager).await?
    } else {
        authorize_with_listener(&manager, timeout_secs, no_browser).await?
    };

    println!("✓ Authorized '{server}'");
    if let Some(at) = tokens.expires_at {
        println!("  Token expires {}", at.format("%Y-%m-%d %H:%M UTC"));
    }
    if !manager.siblings().is_empty() {
        println!("  Also stored for: {}", manager.siblings().join(", "));
    }
    Ok(())
}

async fn authorize_with_listener(
    manager: &CredentialManager,
    timeout_secs: u64,
    no_browser: bool,
) -> anyhow::Result<TokenSet> {
    println!("Waiting for the callback on {}", manager.redirect_uri());
    println!();

    let tokens = manager
        .authorize(
            |url| {
                println!("Open this URL to continue:");
                println!("  {url}");
                println!();
                if !no_browser {
                    if let Err(e) = open::that(url) {
                        warn!(error = %e, "Failed to open browser");
                    }
                }
            },
            Duration::from_secs(timeout_secs),
        )
        .await?;
    Ok(tokens)
}

/// Paste-the-redirect flow for machines whose browser cannot reach the
/// local callback listener.
async fn authorize_manually(manager: &CredentialManager) -> anyhow::Result<TokenSet> {
    let request = manager.build_authorization_url().await?;

    println!("Open this URL in any browser:");
    println!("  {}", request.url);
    println!();
    println!("After approving you are redirected to a URL starting with");
    println!("  {}?code=...", manager.redirect_uri());
    println!("The page may fail to load. Copy the entire URL from the address bar.");
    println!();
    print!("Paste the callback URL here: ");
    std::io::stdout().flush()?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    if line.trim().is_empty() {
        anyhow::bail!("No callback URL entered");
    }

    Ok(manager.complete_from_redirect(&line).await?)
}

/// Remove cached credentials for `server`.
pub async fn logout_server(paths: &Paths, server: &str) -> anyhow::Result<()> {
    let configs = paths.load_configs().await?;
    let manager = credential_manager_for(&configs, server, paths.token_store())?;

    if manager.logout().await? {
        println!("✓ Removed credentials for '{server}'");
    } else {
        println!("No credentials cached for '{server}'");
    }
    Ok(())
}
