//! Local listener receiving the OAuth redirect from the browser.

use crate::error::{McpError, McpResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const HTML_SUCCESS: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>toolmux - Authorization Successful</title>
  <style>
    body { font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; }
    .container { text-align: center; padding: 2rem; }
    h1 { color: #16a34a; }
  </style>
</head>
<body>
  <div class="container">
    <h1>Authorization Successful</h1>
    <p>You can close this window and return to the terminal.</p>
  </div>
</body>
</html>"#;

fn html_error(error: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>toolmux - Authorization Failed</title></head>
<body>
  <h1>Authorization Failed</h1>
  <pre>{}</pre>
</body>
</html>"#,
        html_escape(error)
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn http_response(status: u16, content_type: &str, body: &str) -> String {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Error",
    };
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// What one inbound request amounted to.
enum Callback {
    Code(String),
    Denied(String),
    Ignored,
}

/// Accepts exactly one completed authorization on the redirect URI.
///
/// The socket is owned by the listener and released when it is dropped, so
/// every exit path (success, denial, timeout, cancellation) frees the port.
pub struct CallbackListener {
    listener: TcpListener,
    path: String,
}

impl CallbackListener {
    /// Bind `addr` (for example `127.0.0.1:3000`) and accept callbacks on `path`.
    pub async fn bind(addr: &str, path: &str) -> McpResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            McpError::config(format!("Failed to bind OAuth callback listener on {addr}: {e}"))
        })?;

        let path = if path.is_empty() { "/" } else { path };
        info!(addr = %addr, path, "OAuth callback listener started");

        Ok(Self {
            listener,
            path: path.to_string(),
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> McpResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the browser to deliver an authorization code whose `state`
    /// matches `expected_state`.
    pub async fn wait_for_code(self, expected_state: &str, timeout: Duration) -> McpResult<String> {
        let result = tokio::time::timeout(timeout, self.accept_until_done(expected_state)).await;
        debug!(path = %self.path, "OAuth callback listener stopped");

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(McpError::AuthorizationDenied(
                "Timed out waiting for the authorization callback".to_string(),
            )),
        }
    }

    async fn accept_until_done(&self, expected_state: &str) -> McpResult<String> {
        let (tx, mut rx) = mpsc::channel::<Callback>(4);
        // Aborted on drop, which releases any connection still being read.
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(peer = %peer, "OAuth callback connection");

                    let tx = tx.clone();
                    let path = self.path.clone();
                    let expected_state = expected_state.to_string();
                    handlers.spawn(async move {
                        match handle(stream, &path, &expected_state).await {
                            Ok(Callback::Ignored) => {}
                            Ok(outcome) => {
                                let _ = tx.send(outcome).await;
                            }
                            Err(e) => warn!(error = %e, "Error handling OAuth callback"),
                        }
                    });
                }
                Some(outcome) = rx.recv() => match outcome {
                    Callback::Code(code) => return Ok(code),
                    Callback::Denied(reason) => return Err(McpError::AuthorizationDenied(reason)),
                    Callback::Ignored => {}
                },
            }
        }
    }
}

/// Extract the authorization code from a redirect URL pasted by the user.
///
/// Accepts the full URL or just its query string. The `state` parameter must
/// equal `expected_state`.
pub fn code_from_redirect(input: &str, expected_state: &str) -> McpResult<String> {
    let input = input.trim();
    let query = match url::Url::parse(input) {
        Ok(url) => url.query().unwrap_or_default().to_string(),
        Err(_) => input.trim_start_matches('?').to_string(),
    };
    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    if let Some(error) = params.get("error") {
        return Err(McpError::AuthorizationDenied(
            match params.get("error_description") {
                Some(description) => format!("{error}: {description}"),
                None => error.clone(),
            },
        ));
    }

    let code = params
        .get("code")
        .filter(|code| !code.is_empty())
        .ok_or_else(|| McpError::AuthorizationDenied("No authorization code in URL".to_string()))?;

    if params.get("state").map(String::as_str) != Some(expected_state) {
        return Err(McpError::AuthorizationDenied(
            "State parameter does not match the pending authorization".to_string(),
        ));
    }

    Ok(code.clone())
}

async fn handle(mut stream: TcpStream, path: &str, expected_state: &str) -> McpResult<Callback> {
    let mut buffer = [0u8; 8192];
    let n = stream.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..n]);

    let target = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("");

    let parsed = match url::Url::parse(&format!("http://127.0.0.1{target}")) {
        Ok(url) if !target.is_empty() => url,
        _ => {
            respond(&mut stream, 400, "text/plain", "Bad Request").await;
            return Ok(Callback::Ignored);
        }
    };

    if parsed.path() != path {
        respond(&mut stream, 404, "text/plain", "Not Found").await;
        return Ok(Callback::Ignored);
    }

    let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
    let state_matches = params.get("state").map(String::as_str) == Some(expected_state);

    if let Some(error) = params.get("error") {
        if params.contains_key("state") && !state_matches {
            warn!("OAuth error callback with mismatched state");
            respond(&mut stream, 400, "text/html", &html_error("State mismatch")).await;
            return Ok(Callback::Ignored);
        }

        let reason = match params.get("error_description") {
            Some(description) => format!("{error}: {description}"),
            None => error.clone(),
        };
        respond(&mut stream, 200, "text/html", &html_error(&reason)).await;
        return Ok(Callback::Denied(reason));
    }

    let Some(code) = params.get("code") else {
        respond(
            &mut stream,
            400,
            "text/html",
            &html_error("No authorization code provided"),
        )
        .await;
        return Ok(Callback::Ignored);
    };

    if !state_matches {
        warn!("OAuth callback with invalid state");
        respond(
            &mut stream,
            400,
            "text/html",
            &html_error("Invalid or expired state parameter"),
        )
        .await;
        return Ok(Callback::Ignored);
    }

    respond(&mut stream, 200, "text/html", HTML_SUCCESS).await;
    Ok(Callback::Code(code.clone()))
}

async fn respond(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let response = http_response(status, content_type, body);
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(error = %e, "Failed to write callback response");
    }
    let _ = stream.shutdown().await;
}
