//! Bring-up integration tests.
//!
//! Tests for concurrent multi-server connection, partial failure handling and
//! the global tool index.

mod common;

use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use toolmux_auth::{FileTokenStore, TokenSet, TokenStore};
use toolmux_mcp::{ConnectionState, McpError, McpManager, OAuthSettings, ServerConfig};

fn oauth(token_url: &str) -> OAuthSettings {
    OAuthSettings {
        required: true,
        auth_url: "https://auth.example.com/authorize".to_string(),
        token_url: token_url.to_string(),
        scopes: vec!["mcp".to_string()],
        ..Default::default()
    }
}

/// Test that an OAuth server answering 401 does not prevent others from connecting.
#[tokio::test]
async fn test_mixed_auth_and_healthy_servers() {
    let healthy = common::mcp_server(json!([{"name": "search_menu"}, {"name": "place_order"}]), None).await;
    let locked = common::mcp_server(json!([{"name": "search_menu"}]), Some("valid-token")).await;

    let manager = McpManager::new();
    let report = manager
        .load_and_connect_all(vec![
            ServerConfig::http("dineout", healthy.uri()),
            ServerConfig::http("food", locked.uri()).with_oauth(oauth("https://auth.example.com/token")),
            ServerConfig::http("gone", "http://127.0.0.1:1/mcp"),
        ])
        .await;

    assert_eq!(report.connected, vec!["dineout"]);
    assert_eq!(report.auth_required, vec!["food"]);
    assert!(report.failed.contains_key("gone"));

    let statuses = manager.statuses().await;
    assert_eq!(statuses["dineout"].state, ConnectionState::Connected);
    assert_eq!(statuses["dineout"].tools, 2);
    assert_eq!(statuses["food"].state, ConnectionState::AuthRequired);
    assert_eq!(statuses["gone"].state, ConnectionState::Error);
    assert!(statuses["gone"].error.is_some());

    let tools = manager.all_tools().await;
    assert_eq!(tools.len(), 2);
    assert!(tools.iter().all(|t| t.key.server == "dineout"));

    assert!(matches!(
        manager.call_tool("food", "search_menu", None).await,
        Err(McpError::AuthRequired(_))
    ));
    assert!(matches!(
        manager.call_tool("gone", "anything", None).await,
        Err(McpError::NotConnected(_))
    ));

    let result = manager
        .call_tool("dineout", "place_order", Some(json!({"item": "dosa"})))
        .await
        .expect("Tool call failed");
    assert_eq!(result.text(), "called");
}

/// Test that injecting a token and reconnecting moves a server out of auth_required.
#[tokio::test]
async fn test_reconnect_after_token_injection() {
    let locked = common::mcp_server(json!([{"name": "checkout"}]), Some("late-token")).await;

    let manager = McpManager::new();
    let report = manager
        .load_and_connect_all(vec![
            ServerConfig::http("grocery", locked.uri()).with_oauth(oauth("https://auth.example.com/token"))
        ])
        .await;
    assert_eq!(report.auth_required, vec!["grocery"]);
    assert!(manager.all_tools().await.is_empty());

    manager
        .set_auth_token("grocery", Some("late-token".to_string()))
        .await
        .expect("Failed to set token");
    assert_eq!(
        manager.connect("grocery").await.expect("Reconnect failed"),
        ConnectionState::Connected
    );
    assert_eq!(manager.all_tools().await.len(), 1);
}

/// Test that tokens cached by one manager are used by a fresh one.
#[tokio::test]
async fn test_token_cache_round_trip() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let path = temp.path().join("tokens.json");
    let server = common::mcp_server(json!([{"name": "search"}]), Some("persisted")).await;

    {
        let store = FileTokenStore::with_path(&path);
        store
            .set("food", TokenSet::bearer("persisted").with_refresh_token("r"))
            .await
            .expect("Failed to cache token");
    }

    let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::with_path(&path));
    let manager = McpManager::with_token_store(store);
    let report = manager
        .load_and_connect_all(vec![
            ServerConfig::http("food", server.uri()).with_oauth(oauth("https://auth.example.com/token"))
        ])
        .await;

    assert_eq!(report.connected, vec!["food"]);
    assert_eq!(manager.all_tools().await[0].key.to_string(), "food:search");
}

/// Test that an expired cached token is refreshed before connecting.
#[tokio::test]
async fn test_expired_token_refreshed_at_bring_up() {
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let auth = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "refreshed",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&auth)
        .await;

    let server = common::mcp_server(json!([{"name": "search"}]), Some("refreshed")).await;
    let store = Arc::new(toolmux_auth::MemoryTokenStore::new());
    store
        .set(
            "food",
            TokenSet::bearer("stale")
                .with_refresh_token("rt")
                .with_expires_at(chrono::Utc::now() - chrono::Duration::minutes(5)),
        )
        .await
        .expect("Failed to cache token");

    let manager = McpManager::with_token_store(store.clone());
    let report = manager
        .load_and_connect_all(vec![ServerConfig::http("food", server.uri())
            .with_oauth(oauth(&format!("{}/token", auth.uri())))])
        .await;

    assert_eq!(report.connected, vec!["food"]);
    let cached = store.get("food").await.expect("Store read failed").expect("Token missing");
    assert_eq!(cached.access_token, "refreshed");
    assert_eq!(cached.refresh_token.as_deref(), Some("rt"));
}

/// Test that disabled servers never appear anywhere.
#[tokio::test]
async fn test_disabled_server_not_registered() {
    let server = common::mcp_server(json!([{"name": "search"}]), None).await;

    let manager = McpManager::new();
    let report = manager
        .load_and_connect_all(vec![
            ServerConfig::http("instamart", server.uri()).with_enabled(false)
        ])
        .await;

    assert!(report.connected.is_empty());
    assert!(report.failed.is_empty());
    assert!(manager.statuses().await.is_empty());
    assert!(manager.all_tools().await.is_empty());
    assert!(server.received_requests().await.expect("Recording disabled").is_empty());
}

/// Test that a stdio server that exits immediately ends in the error state.
#[cfg(unix)]
#[tokio::test]
async fn test_exiting_process_ends_in_error() {
    let manager = McpManager::new();
    let report = manager
        .load_and_connect_all(vec![
            ServerConfig::stdio("quitter", ["sh", "-c", "exit 0"]),
            ServerConfig::stdio("missing", ["toolmux-no-such-binary"]),
        ])
        .await;

    assert!(report.connected.is_empty());
    assert!(report.failed.contains_key("quitter"));
    assert!(report.failed.contains_key("missing"));

    let statuses = manager.statuses().await;
    assert_eq!(statuses["quitter"].state, ConnectionState::Error);
    assert_eq!(statuses["missing"].state, ConnectionState::Error);

    manager.disconnect_all().await;
    manager.disconnect_all().await;
    assert!(manager.statuses().await.is_empty());
}
