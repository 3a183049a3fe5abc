//! End-to-end tests: real server on a loopback port, OpenAI-compatible
//! provider mocked with httpmock, WebSocket client via tokio-tungstenite.

use futures::{SinkExt, StreamExt};
use httpmock::prelude::*;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use assistant_rag::auth::{AccessGate, JwtProvider, SIGN_IN_MESSAGE};
use assistant_rag::config::Config;
use assistant_rag::server::{serve, AppState};

const SECRET: &str = "e2e-secret";

fn set(table: &mut assistant_rag::config::KindTable, kind: &str, key: &str, value: &str) {
    table
        .entry(kind.to_string())
        .or_default()
        .insert(key.to_string(), value.to_string());
}

fn test_config(tmp: &TempDir, provider_url: &str) -> Config {
    let mut config = Config::builtin();
    let db = tmp.path().join("assistant.sqlite");
    set(&mut config.defaults.store, "sqlite", "path", &db.display().to_string());
    set(&mut config.defaults.store, "sqlite", "collection", "e2e_collection");
    for (key, value) in [("base_url", provider_url), ("api_key", "sk-test"), ("dims", "3")] {
        set(&mut config.defaults.embedding, "openai", key, value);
    }
    for kind in ["openai-vanilla", "openai-condense"] {
        set(&mut config.defaults.generation, kind, "base_url", provider_url);
        set(&mut config.defaults.generation, kind, "api_key", "sk-test");
    }
    config
}

fn mock_provider(server: &MockServer) {
    server.mock(|when, then| {
        when.method(POST).path("/embeddings");
        then.status(200).json_body(json!({
            "data": [ { "index": 0, "embedding": [1.0, 0.0, 0.0] } ]
        }));
    });
}

async fn start(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state));
    addr
}

fn token(sub: &str, user_types: &[&str]) -> String {
    let claims = json!({
        "sub": sub,
        "exp": (chrono::Utc::now().timestamp() + 3600) as usize,
        "user_metadata": { "user_types": user_types },
    });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn jwt_gate() -> AccessGate {
    let mut table = HashMap::new();
    table.insert("admin".to_string(), vec!["bible".to_string()]);
    table.insert("member".to_string(), vec!["sermons".to_string()]);
    AccessGate::with_provider(JwtProvider::new(SECRET, table))
}

async fn next_json(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_upload_then_chat_cites_links() {
    let provider = MockServer::start_async().await;
    mock_provider(&provider);
    let completion = provider.mock(|when, then| {
        when.method(POST).path("/chat/completions").is_true(|req| {
            let body = String::from_utf8_lossy(req.body().as_ref());
            body.contains("Jesus is the Son of God") && body.contains("Who is Jesus?")
        });
        then.status(200).json_body(json!({
            "choices": [ { "message": { "role": "assistant", "content": "Jesus is the Son of God." } } ]
        }));
    });

    let tmp = TempDir::new().unwrap();
    let state = AppState::new(test_config(&tmp, &provider.base_url())).unwrap();
    let addr = start(state).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("http://{}/upload/sentences", addr))
        .json(&json!([{
            "docId": "D1",
            "text": "Jesus is the Son of God",
            "label": "bible",
            "links": ["https://bible.org/john-3-16"]
        }]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let ack: Value = response.json().await.unwrap();
    let job_id = ack["jobId"].as_u64().unwrap();

    let job: Value = http
        .get(format!("http://{}/job/{}", addr, job_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["status"], "finished");
    assert_eq!(job["output"]["documents"], 1);

    let (mut ws, _) = connect_async(format!(
        "ws://{}/chat?user=u1&label=bible&llmFrameworkType=openai-vanilla",
        addr
    ))
    .await
    .unwrap();
    ws.send(Message::Text("Who is Jesus?".into())).await.unwrap();

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "answer");
    assert_eq!(reply["sender"], "Bot");
    assert_eq!(reply["message"], "Jesus is the Son of God.");
    let sources: Vec<String> = serde_json::from_value(reply["sources"].clone()).unwrap();
    assert!(sources.contains(&"https://bible.org/john-3-16".to_string()));

    ws.close(None).await.unwrap();
    completion.assert_calls(1);
}

#[tokio::test]
async fn test_failed_turn_keeps_session_open() {
    let provider = MockServer::start_async().await;
    mock_provider(&provider);
    provider.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(500).body("upstream down");
    });

    let tmp = TempDir::new().unwrap();
    let addr = start(AppState::new(test_config(&tmp, &provider.base_url())).unwrap()).await;

    let (mut ws, _) = connect_async(format!("ws://{}/chat?user=u1&label=bible", addr))
        .await
        .unwrap();
    for _ in 0..2 {
        ws.send(Message::Text("Who is Jesus?".into())).await.unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["message"], "Sorry, something went wrong. Try again.");
    }
}

#[tokio::test]
async fn test_chat_without_token_gets_sign_in_message() {
    let tmp = TempDir::new().unwrap();
    let state = AppState::with_gate(test_config(&tmp, "http://127.0.0.1:9"), jwt_gate());
    let addr = start(state).await;

    let (mut ws, _) = connect_async(format!("ws://{}/chat?user=u1&label=bible", addr))
        .await
        .unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "answer");
    assert_eq!(reply["message"], SIGN_IN_MESSAGE);

    match ws.next().await {
        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {}
        other => panic!("expected the exchange to end, got {:?}", other),
    }
}

#[tokio::test]
async fn test_admin_routes_require_admin_token() {
    let tmp = TempDir::new().unwrap();
    let state = AppState::with_gate(test_config(&tmp, "http://127.0.0.1:9"), jwt_gate());
    let addr = start(state).await;
    let http = reqwest::Client::new();
    let body = json!([{ "docId": "D1", "text": "t", "embedding": [1.0, 0.0, 0.0] }]);

    let response = http
        .post(format!("http://{}/upload/sentences", addr))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let err: Value = response.json().await.unwrap();
    assert_eq!(err["error"], "UNAUTHORIZED");
    assert!(err["details"].is_string());

    let response = http
        .post(format!("http://{}/upload/sentences", addr))
        .bearer_auth(token("u2", &["member"]))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let response = http
        .post(format!(
            "http://{}/upload/sentences?token={}",
            addr,
            token("u3", &["admin"])
        ))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
}

#[tokio::test]
async fn test_source_labels_follow_permissions() {
    let tmp = TempDir::new().unwrap();
    let state = AppState::with_gate(test_config(&tmp, "http://127.0.0.1:9"), jwt_gate());
    let addr = start(state).await;
    let http = reqwest::Client::new();
    let admin = token("root", &["admin"]);

    let response = http
        .post(format!("http://{}/upload/sentences", addr))
        .bearer_auth(&admin)
        .json(&json!([
            { "docId": "D1", "text": "a", "label": "bible", "embedding": [1.0, 0.0, 0.0] },
            { "docId": "D2", "text": "b", "label": "sermons", "embedding": [0.0, 1.0, 0.0] },
            { "docId": "D3", "text": "c", "label": "open-access", "embedding": [0.0, 0.0, 1.0] }
        ]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let labels_url = format!("http://{}/source-labels", addr);

    let anonymous: Vec<String> = http.get(&labels_url).send().await.unwrap().json().await.unwrap();
    assert!(anonymous.is_empty());

    let member: Vec<String> = http
        .get(&labels_url)
        .bearer_auth(token("u2", &["member"]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(member, vec!["sermons".to_string()]);

    let both: Vec<String> = http
        .get(format!("{}?token={}", labels_url, token("u4", &["admin", "member"])))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(both, vec!["bible".to_string(), "sermons".to_string()]);
}

#[tokio::test]
async fn test_unknown_job_and_bad_upload() {
    let tmp = TempDir::new().unwrap();
    let addr = start(AppState::new(test_config(&tmp, "http://127.0.0.1:9")).unwrap()).await;
    let http = reqwest::Client::new();

    let response = http
        .get(format!("http://{}/job/424242", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let err: Value = response.json().await.unwrap();
    assert_eq!(err["error"], "NOT_FOUND");

    let response = http
        .post(format!("http://{}/upload/csv-file?colDelimiter=comma", addr))
        .body("id,text\nD1,\n")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
    let err: Value = response.json().await.unwrap();
    assert!(err["details"].as_str().unwrap().contains("row 2"));

    let response = http
        .post(format!("http://{}/upload/sentences?vectordbType=milvus", addr))
        .json(&json!([{ "docId": "D1", "text": "t" }]))
        .send()
        .await
        .unwrap();
    let err: Value = response.json().await.unwrap();
    assert_eq!(err["error"], "UNSUPPORTED_BACKEND_KIND");
}

#[tokio::test]
async fn test_malformed_requests_get_json_errors() {
    let tmp = TempDir::new().unwrap();
    let addr = start(AppState::new(test_config(&tmp, "http://127.0.0.1:9")).unwrap()).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("http://{}/upload/sentences", addr))
        .header("content-type", "application/json")
        .body(r#"[{"docId": 1}]"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
    let err: Value = response.json().await.unwrap();
    assert_eq!(err["error"], "INVALID_REQUEST");
    assert!(err["details"].as_str().unwrap().contains("docId"));

    let response = http
        .get(format!("http://{}/job/abc", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
    let err: Value = response.json().await.unwrap();
    assert_eq!(err["error"], "INVALID_REQUEST");
    assert!(err["details"].is_string());
}

#[tokio::test]
async fn test_text_file_upload_requires_label() {
    let tmp = TempDir::new().unwrap();
    let addr = start(AppState::new(test_config(&tmp, "http://127.0.0.1:9")).unwrap()).await;
    let http = reqwest::Client::new();

    for url in [
        format!("http://{}/upload/text-file", addr),
        format!("http://{}/upload/text-file?label=%20", addr),
    ] {
        let response = http.post(url).body("Jesus wept.").send().await.unwrap();
        assert_eq!(response.status(), 422);
        let err: Value = response.json().await.unwrap();
        assert_eq!(err["error"], "INVALID_REQUEST");
        assert!(err["details"].as_str().unwrap().contains("label"));
    }
}

#[tokio::test]
async fn test_chat_backend_failure_hides_details() {
    let tmp = TempDir::new().unwrap();
    let addr = start(AppState::new(test_config(&tmp, "http://127.0.0.1:9")).unwrap()).await;

    // The store's parent directory is a regular file, so opening it fails.
    let blocker = tmp.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let db_path = blocker.join("store.sqlite");

    let (mut ws, _) = connect_async(format!(
        "ws://{}/chat?user=u1&label=bible&dbPath={}",
        addr,
        db_path.display()
    ))
    .await
    .unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    let message = reply["message"].as_str().unwrap();
    assert!(message.contains("BACKEND_CONNECTION_ERROR"), "got {}", message);
    assert!(!message.contains("blocker"), "leaked detail: {}", message);
}

#[tokio::test]
async fn test_health() {
    let tmp = TempDir::new().unwrap();
    let addr = start(AppState::new(test_config(&tmp, "http://127.0.0.1:9")).unwrap()).await;
    let health: Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
}
