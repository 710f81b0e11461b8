//! OAuth 2.0 authorization code flow with PKCE.
//!
//! A [`CredentialManager`] drives the flow for one server and persists the
//! resulting tokens through an injected [`TokenStore`]:
//!
//! ```text
//! idle -> awaiting_code -> exchanging -> authorized | failed
//! authorized -> refreshing -> authorized | failed
//! ```

use crate::callback::{code_from_redirect, CallbackListener};
use crate::config::OAuthSettings;
use crate::error::{McpError, McpResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use toolmux_auth::{TokenSet, TokenStore};
use tracing::{debug, info, warn};

/// How long [`CredentialManager::authorize`] waits for the browser by default.
pub const DEFAULT_AUTHORIZATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Progress of the authorization flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Idle,
    AwaitingCode,
    Exchanging,
    Authorized,
    Failed,
    Refreshing,
}

/// An authorization URL to open in the browser, and the state it carries.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

struct PendingAuthorization {
    verifier: String,
    state: String,
}

/// Token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_token_set(self) -> TokenSet {
        let mut tokens = TokenSet::bearer(self.access_token);
        if let Some(token_type) = self.token_type {
            tokens.token_type = token_type;
        }
        tokens.refresh_token = self.refresh_token;
        tokens.expires_at = self
            .expires_in
            .and_then(expiry_after);
        tokens.scope = self.scope;
        tokens
    }
}

/// Absolute expiry `secs` from now, or `None` when it is not representable.
fn expiry_after(secs: i64) -> Option<DateTime<Utc>> {
    chrono::Duration::try_seconds(secs).and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Generate a PKCE code verifier from 32 random bytes.
pub fn generate_code_verifier() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// S256 code challenge for `verifier`.
pub fn code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate an OAuth state parameter from 16 random bytes.
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Runs the OAuth flow for one server.
pub struct CredentialManager {
    server: String,
    settings: OAuthSettings,
    /// Servers sharing this server's token endpoint; they receive copies of
    /// newly exchanged tokens.
    siblings: Vec<String>,
    store: Arc<dyn TokenStore>,
    http: reqwest::Client,
    flow: RwLock<FlowState>,
    pending: Mutex<Option<PendingAuthorization>>,
}

impl CredentialManager {
    /// Create a manager for `server`.
    pub fn new(
        server: impl Into<String>,
        settings: OAuthSettings,
        store: Arc<dyn TokenStore>,
    ) -> McpResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| McpError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            server: server.into(),
            settings,
            siblings: Vec::new(),
            store,
            http,
            flow: RwLock::new(FlowState::Idle),
            pending: Mutex::new(None),
        })
    }

    /// Replicate exchanged tokens to these servers as well.
    pub fn with_siblings(mut self, siblings: Vec<String>) -> Self {
        self.siblings = siblings
            .into_iter()
            .filter(|name| *name != self.server)
            .collect();
        self
    }

    /// Server this manager authorizes.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Servers receiving copies of exchanged tokens.
    pub fn siblings(&self) -> &[String] {
        &self.siblings
    }

    /// Redirect URI registered for the flow.
    pub fn redirect_uri(&self) -> &str {
        self.settings.redirect_uri()
    }

    /// Current flow state.
    pub async fn flow_state(&self) -> FlowState {
        *self.flow.read().await
    }

    async fn set_flow(&self, state: FlowState) {
        debug!(server = %self.server, state = ?state, "OAuth flow state");
        *self.flow.write().await = state;
    }

    /// Cached tokens for the server.
    pub async fn tokens(&self) -> McpResult<Option<TokenSet>> {
        Ok(self.store.get(&self.server).await?)
    }

    /// Start a new authorization: fresh verifier and state, URL to open.
    pub async fn build_authorization_url(&self) -> McpResult<AuthorizationRequest> {
        let verifier = generate_code_verifier();
        let state = generate_state();

        let mut url = url::Url::parse(&self.settings.auth_url)
            .map_err(|e| McpError::config(format!("Invalid authUrl: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", self.settings.client_id(&self.server))
            .append_pair("redirect_uri", self.redirect_uri())
            .append_pair("scope", &self.settings.scopes.join(" "))
            .append_pair("state", &state)
            .append_pair("code_challenge", &code_challenge(&verifier))
            .append_pair("code_challenge_method", "S256");

        *self.pending.lock().await = Some(PendingAuthorization {
            verifier,
            state: state.clone(),
        });
        self.set_flow(FlowState::AwaitingCode).await;

        Ok(AuthorizationRequest {
            url: url.into(),
            state,
        })
    }

    /// State parameter of the authorization in progress.
    pub async fn pending_state(&self) -> Option<String> {
        self.pending.lock().await.as_ref().map(|p| p.state.clone())
    }

    /// Exchange an authorization code for tokens and persist them for this
    /// server and its siblings in a single write.
    pub async fn exchange_code_for_token(&self, code: &str) -> McpResult<TokenSet> {
        let pending = self.pending.lock().await.take().ok_or_else(|| {
            McpError::TokenExchange(format!("No authorization in progress for {}", self.server))
        })?;

        self.set_flow(FlowState::Exchanging).await;

        let client_id = self.settings.client_id(&self.server);
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", pending.verifier.as_str()),
            ("redirect_uri", self.redirect_uri()),
            ("client_id", client_id),
        ];
        if let Some(secret) = self.settings.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let tokens = match self.post_token_request(&form).await {
            Ok(response) => response.into_token_set(),
            Err(e) => {
                self.set_flow(FlowState::Failed).await;
                return Err(e);
            }
        };

        let entries: Vec<(String, TokenSet)> = std::iter::once(self.server.clone())
            .chain(self.siblings.iter().cloned())
            .map(|name| (name, tokens.clone()))
            .collect();

        if let Err(e) = self.store.set_many(entries).await {
            self.set_flow(FlowState::Failed).await;
            return Err(e.into());
        }

        self.set_flow(FlowState::Authorized).await;
        info!(
            server = %self.server,
            siblings = ?self.siblings,
            "Authorization complete"
        );
        Ok(tokens)
    }

    /// Refresh the stored tokens.
    ///
    /// Fails with [`McpError::NoRefreshToken`] without network I/O when no
    /// refresh token is stored. Fields the endpoint omits are carried over.
    pub async fn refresh_token(&self) -> McpResult<TokenSet> {
        let current = self.store.get(&self.server).await?;
        let Some(refresh_token) = current.as_ref().and_then(|t| t.refresh_token.clone()) else {
            return Err(McpError::NoRefreshToken(self.server.clone()));
        };

        self.set_flow(FlowState::Refreshing).await;

        let client_id = self.settings.client_id(&self.server);
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", client_id),
        ];
        if let Some(secret) = self.settings.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let mut tokens = match self.post_token_request(&form).await {
            Ok(response) => response.into_token_set(),
            Err(e) => {
                warn!(server = %self.server, error = %e, "Token refresh failed");
                self.set_flow(FlowState::Failed).await;
                return Err(e);
            }
        };

        if let Some(previous) = current {
            tokens.refresh_token = tokens.refresh_token.or(previous.refresh_token);
            tokens.scope = tokens.scope.or(previous.scope);
        }

        if let Err(e) = self.store.set(&self.server, tokens.clone()).await {
            self.set_flow(FlowState::Failed).await;
            return Err(e.into());
        }

        self.set_flow(FlowState::Authorized).await;
        info!(server = %self.server, "Refreshed access token");
        Ok(tokens)
    }

    /// Access token that is valid now, refreshing first if it has expired.
    pub async fn get_valid_token(&self) -> McpResult<String> {
        let tokens = self.store.get(&self.server).await?.ok_or_else(|| {
            McpError::AuthRequired(format!("No cached credentials for {}", self.server))
        })?;

        if !tokens.is_expired() {
            return Ok(tokens.access_token);
        }

        if !tokens.can_refresh() {
            return Err(McpError::AuthRequired(format!(
                "Credentials for {} expired and cannot be refreshed",
                self.server
            )));
        }

        Ok(self.refresh_token().await?.access_token)
    }

    /// Forget cached tokens. Returns `true` if any existed.
    pub async fn logout(&self) -> McpResult<bool> {
        let removed = self.store.remove(&self.server).await?;
        *self.pending.lock().await = None;
        self.set_flow(FlowState::Idle).await;
        Ok(removed)
    }

    /// Run the whole browser flow: listen on the redirect URI, hand the
    /// authorization URL to `open_url`, wait for the callback, exchange the code.
    pub async fn authorize<F>(&self, open_url: F, timeout: Duration) -> McpResult<TokenSet>
    where
        F: FnOnce(&str) + Send,
    {
        let redirect = url::Url::parse(self.redirect_uri())
            .map_err(|e| McpError::config(format!("Invalid redirectUri: {e}")))?;
        let host = redirect
            .host_str()
            .ok_or_else(|| McpError::config("redirectUri has no host"))?;
        let port = redirect
            .port_or_known_default()
            .ok_or_else(|| McpError::config("redirectUri has no port"))?;
        let host = if host == "localhost" { "127.0.0.1" } else { host };

        let listener = CallbackListener::bind(&format!("{host}:{port}"), redirect.path()).await?;
        let request = self.build_authorization_url().await?;

        info!(server = %self.server, "Waiting for authorization in the browser");
        open_url(&request.url);

        let code = match listener.wait_for_code(&request.state, timeout).await {
            Ok(code) => code,
            Err(e) => {
                *self.pending.lock().await = None;
                self.set_flow(FlowState::Failed).await;
                return Err(e);
            }
        };

        self.exchange_code_for_token(&code).await
    }

    /// Finish an authorization from the redirect URL the user copied out of
    /// the browser. For machines whose browser cannot reach the callback
    /// listener.
    pub async fn complete_from_redirect(&self, redirect: &str) -> McpResult<TokenSet> {
        let expected = self.pending_state().await.ok_or_else(|| {
            McpError::TokenExchange(format!("No authorization in progress for {}", self.server))
        })?;

        let code = match code_from_redirect(redirect, &expected) {
            Ok(code) => code,
            Err(e) => {
                *self.pending.lock().await = None;
                self.set_flow(FlowState::Failed).await;
                return Err(e);
            }
        };

        self.exchange_code_for_token(&code).await
    }

    async fn post_token_request(&self, form: &[(&str, &str)]) -> McpResult<TokenResponse> {
        let response = self
            .http
            .post(&self.settings.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(McpError::from_reqwest)?;

        let status = response.status();
        let body = response.text().await.map_err(McpError::from_reqwest)?;

        if !status.is_success() {
            let detail = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {description}", err.error),
                    None => err.error,
                },
                Err(_) => format!("token endpoint returned {status}"),
            };
            return Err(McpError::TokenExchange(detail));
        }

        serde_json::from_str(&body)
            .map_err(|e| McpError::TokenExchange(format!("Invalid token response: {e}")))
    }
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("server", &self.server)
            .field("siblings", &self.siblings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use toolmux_auth::MemoryTokenStore;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(token_url: String) -> OAuthSettings {
        OAuthSettings {
            required: true,
            auth_url: "https://auth.example.com/authorize".to_string(),
            token_url,
            scopes: vec!["mcp:tools".to_string(), "profile".to_string()],
            client_id: Some("toolmux-cli".to_string()),
            ..Default::default()
        }
    }

    fn manager(token_url: String) -> (CredentialManager, Arc<MemoryTokenStore>) {
        let store = Arc::new(MemoryTokenStore::new());
        let manager = CredentialManager::new("food", settings(token_url), store.clone()).unwrap();
        (manager, store)
    }

    fn query(url: &str) -> HashMap<String, String> {
        url::Url::parse(url)
            .unwrap()
            .query_pairs()
            .into_owned()
            .collect()
    }

    #[test]
    fn test_code_challenge() {
        // RFC 7636 appendix B.
        assert_eq!(
            code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_generated_values_are_url_safe() {
        let verifier = generate_code_verifier();
        assert_eq!(verifier.len(), 43);
        assert_eq!(generate_state().len(), 22);
        assert!(verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test]
    async fn test_authorization_url() {
        let (manager, _) = manager("https://auth.example.com/token".to_string());
        let request = manager.build_authorization_url().await.unwrap();
        let params = query(&request.url);

        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "toolmux-cli");
        assert_eq!(params["redirect_uri"], crate::config::DEFAULT_REDIRECT_URI);
        assert_eq!(params["scope"], "mcp:tools profile");
        assert_eq!(params["state"], request.state);
        assert_eq!(params["code_challenge_method"], "S256");
        assert!(!params.contains_key("code_verifier"));

        let pending = manager.pending.lock().await;
        let verifier = &pending.as_ref().unwrap().verifier;
        assert_eq!(params["code_challenge"], code_challenge(verifier));
        assert!(!request.url.contains(verifier.as_str()));
        drop(pending);

        assert_eq!(manager.flow_state().await, FlowState::AwaitingCode);
    }

    #[tokio::test]
    async fn test_each_flow_is_fresh() {
        let (manager, _) = manager("https://auth.example.com/token".to_string());
        let first = manager.build_authorization_url().await.unwrap();
        let second = manager.build_authorization_url().await.unwrap();

        assert_ne!(first.state, second.state);
        assert_ne!(
            query(&first.url)["code_challenge"],
            query(&second.url)["code_challenge"]
        );
        assert_eq!(manager.pending_state().await, Some(second.state));
    }

    #[test]
    fn test_expiry_after_out_of_range() {
        assert!(expiry_after(3600).is_some());
        assert_eq!(expiry_after(i64::MAX), None);
        assert_eq!(expiry_after(9_000_000_000_000_000), None);
    }

    #[tokio::test]
    async fn test_exchange_with_huge_lifetime() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "a",
                "expires_in": 9_000_000_000_000_000_i64
            })))
            .mount(&server)
            .await;

        let (manager, store) = manager(format!("{}/token", server.uri()));
        manager.build_authorization_url().await.unwrap();
        let tokens = manager.exchange_code_for_token("code").await.unwrap();

        assert_eq!(tokens.access_token, "a");
        assert_eq!(tokens.expires_at, None);
        assert!(!tokens.is_expired());
        assert_eq!(store.get("food").await.unwrap(), Some(tokens));
    }

    #[tokio::test]
    async fn test_complete_from_pasted_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code=pasted"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "manual-at",
                "expires_in": 60
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (manager, store) = manager(format!("{}/token", server.uri()));
        let request = manager.build_authorization_url().await.unwrap();
        let pasted = format!(
            "http://127.0.0.1:3000/oauth/callback?code=pasted&state={}",
            request.state
        );

        let tokens = manager.complete_from_redirect(&pasted).await.unwrap();
        assert_eq!(tokens.access_token, "manual-at");
        assert_eq!(store.get("food").await.unwrap(), Some(tokens));
        assert_eq!(manager.flow_state().await, FlowState::Authorized);
    }

    #[tokio::test]
    async fn test_pasted_redirect_with_wrong_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (manager, store) = manager(format!("{}/token", server.uri()));
        assert!(matches!(
            manager.complete_from_redirect("code=x&state=y").await,
            Err(McpError::TokenExchange(_))
        ));

        manager.build_authorization_url().await.unwrap();
        assert!(matches!(
            manager
                .complete_from_redirect("http://127.0.0.1:3000/oauth/callback?code=x&state=forged")
                .await,
            Err(McpError::AuthorizationDenied(_))
        ));
        assert_eq!(manager.flow_state().await, FlowState::Failed);
        assert_eq!(manager.pending_state().await, None);
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exchange_sets_expiry_and_replicates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc123"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at-1",
                "token_type": "Bearer",
                "refresh_token": "rt-1",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (manager, store) = manager(format!("{}/token", server.uri()));
        let manager = manager.with_siblings(vec!["grocery".to_string(), "food".to_string()]);
        assert_eq!(manager.siblings(), ["grocery".to_string()]);

        manager.build_authorization_url().await.unwrap();
        let before = Utc::now();
        let tokens = manager.exchange_code_for_token("abc123").await.unwrap();
        let after = Utc::now();

        let expires_at = tokens.expires_at.unwrap();
        assert!(expires_at >= before + chrono::Duration::seconds(3600));
        assert!(expires_at <= after + chrono::Duration::seconds(3600));

        assert_eq!(store.get("food").await.unwrap(), Some(tokens.clone()));
        assert_eq!(store.get("grocery").await.unwrap(), Some(tokens));
        assert_eq!(manager.flow_state().await, FlowState::Authorized);
        assert!(manager.pending_state().await.is_none());
    }

    #[tokio::test]
    async fn test_exchange_without_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"access_token": "forever"})),
            )
            .mount(&server)
            .await;

        let (manager, _) = manager(server.uri());
        manager.build_authorization_url().await.unwrap();
        let tokens = manager.exchange_code_for_token("c").await.unwrap();
        assert!(tokens.expires_at.is_none());
        assert!(!tokens.is_expired());
    }

    #[tokio::test]
    async fn test_exchange_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "code expired"
            })))
            .mount(&server)
            .await;

        let (manager, store) = manager(server.uri());
        manager.build_authorization_url().await.unwrap();

        match manager.exchange_code_for_token("old").await {
            Err(McpError::TokenExchange(detail)) => {
                assert_eq!(detail, "invalid_grant: code expired")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(manager.flow_state().await, FlowState::Failed);
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exchange_requires_pending_flow() {
        let (manager, _) = manager("https://auth.example.com/token".to_string());
        assert!(matches!(
            manager.exchange_code_for_token("code").await,
            Err(McpError::TokenExchange(_))
        ));
        assert_eq!(manager.flow_state().await, FlowState::Idle);
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (manager, store) = manager(server.uri());
        assert!(matches!(
            manager.refresh_token().await,
            Err(McpError::NoRefreshToken(_))
        ));

        store.set("food", TokenSet::bearer("only-access")).await.unwrap();
        assert!(matches!(
            manager.refresh_token().await,
            Err(McpError::NoRefreshToken(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_carries_over_omitted_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-old"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at-new",
                "expires_in": 60
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (manager, store) = manager(server.uri());
        let mut old = TokenSet::bearer("at-old").with_refresh_token("rt-old");
        old.scope = Some("mcp:tools".to_string());
        store.set("food", old).await.unwrap();

        let tokens = manager.refresh_token().await.unwrap();
        assert_eq!(tokens.access_token, "at-new");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt-old"));
        assert_eq!(tokens.scope.as_deref(), Some("mcp:tools"));
        assert_eq!(store.get("food").await.unwrap(), Some(tokens));
        assert_eq!(manager.flow_state().await, FlowState::Authorized);
    }

    #[tokio::test]
    async fn test_get_valid_token_refreshes_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at-fresh",
                "refresh_token": "rt-2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (manager, store) = manager(server.uri());
        store
            .set(
                "food",
                TokenSet::bearer("at-stale")
                    .with_refresh_token("rt-1")
                    .with_expires_at(Utc::now() - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();

        assert_eq!(manager.get_valid_token().await.unwrap(), "at-fresh");
        // Now valid, no second refresh.
        assert_eq!(manager.get_valid_token().await.unwrap(), "at-fresh");
    }

    #[tokio::test]
    async fn test_get_valid_token_without_credentials() {
        let (manager, store) = manager("https://auth.example.com/token".to_string());
        assert!(matches!(
            manager.get_valid_token().await,
            Err(McpError::AuthRequired(_))
        ));

        store
            .set(
                "food",
                TokenSet::bearer("old").with_expires_at(Utc::now() - chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        assert!(matches!(
            manager.get_valid_token().await,
            Err(McpError::AuthRequired(_))
        ));
    }

    #[tokio::test]
    async fn test_logout() {
        let (manager, store) = manager("https://auth.example.com/token".to_string());
        store.set("food", TokenSet::bearer("a")).await.unwrap();
        assert!(manager.logout().await.unwrap());
        assert!(!manager.logout().await.unwrap());
        assert!(manager.tokens().await.unwrap().is_none());
    }
}
