//! Shared fixtures for integration tests.

#![allow(dead_code)]

use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rpc_result(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
}

/// Start a fake MCP server offering `tools`.
///
/// With `required_token` set, requests without `Authorization: Bearer <token>`
/// are answered with 401.
pub async fn mcp_server(tools: Value, required_token: Option<&str>) -> MockServer {
    let server = MockServer::start().await;

    let answers = [
        (
            "initialize",
            rpc_result(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake", "version": "0.0.1"}
            })),
        ),
        ("tools/list", rpc_result(json!({"tools": tools}))),
        ("resources/list", rpc_result(json!({"resources": []}))),
        ("prompts/list", rpc_result(json!({"prompts": []}))),
        (
            "tools/call",
            rpc_result(json!({"content": [{"type": "text", "text": "called"}]})),
        ),
    ];

    for (rpc_method, response) in answers {
        let mut mock = Mock::given(method("POST")).and(body_partial_json(json!({"method": rpc_method})));
        if let Some(token) = required_token {
            mock = mock.and(header("Authorization", format!("Bearer {token}").as_str()));
        }
        mock.respond_with(response).mount(&server).await;
    }

    let mut fallback = Mock::given(method("POST"));
    if let Some(token) = required_token {
        fallback = fallback.and(header("Authorization", format!("Bearer {token}").as_str()));
    }
    fallback
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    if required_token.is_some() {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
    }

    server
}

/// Pick a local port that is free right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind ephemeral port")
        .local_addr()
        .expect("Failed to read local address")
        .port()
}
