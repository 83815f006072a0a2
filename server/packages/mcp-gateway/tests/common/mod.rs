#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, BodyDataStream, Bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use mcp_gateway::router::{build_router_with_state, AppState};
use mcp_gateway_config_store::ConfigStore;

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
}

pub async fn test_app() -> TestApp {
    test_app_with_heartbeat(Duration::from_secs(30)).await
}

pub async fn test_app_with_heartbeat(heartbeat: Duration) -> TestApp {
    let store = ConfigStore::in_memory().await.expect("create store");
    let state = AppState::new(store).with_heartbeat_interval(heartbeat);
    let (app, state) = build_router_with_state(Arc::new(state));
    TestApp { app, state }
}

pub fn cat_config() -> Value {
    json!({ "mcpServers": { "echo": { "command": "cat", "args": [] } } })
}

pub fn command_config(command: &str, args: &[&str]) -> Value {
    json!({ "mcpServers": { "server": { "command": command, "args": args } } })
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (status, _headers, value) = send_request(app, method, path, body).await;
    (status, value)
}

pub async fn send_request(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, headers, value)
}

pub async fn create_config(app: &Router, name: &str, config: Value) -> i64 {
    let (status, payload) = send_json(
        app,
        Method::POST,
        "/api/configs",
        Some(json!({ "name": name, "config": config })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create config");
    payload.get("id").and_then(Value::as_i64).expect("config id")
}

pub async fn post_prompt(app: &Router, config_id: i64, prompt: Value) -> (StatusCode, Value) {
    send_json(
        app,
        Method::POST,
        &format!("/api/prompt/{config_id}"),
        Some(json!({ "prompt": prompt })),
    )
    .await
}

/// Prompts racing the process launch fail with 500 until stdin is
/// attached; retry until delivery or the deadline.
pub async fn deliver_prompt(
    app: &Router,
    config_id: i64,
    prompt: Value,
    timeout: Duration,
) -> (StatusCode, Value) {
    let start = Instant::now();
    loop {
        let (status, payload) = post_prompt(app, config_id, prompt.clone()).await;
        if status != StatusCode::INTERNAL_SERVER_ERROR || start.elapsed() >= timeout {
            return (status, payload);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[derive(Debug)]
pub struct SseEventRecord {
    pub event: String,
    pub data: String,
}

pub struct SseStream {
    stream: BodyDataStream,
    buffer: String,
}

pub async fn open_sse(app: &Router, config_id: i64) -> SseStream {
    let (stream, _headers) = open_sse_with_headers(app, config_id).await;
    stream
}

pub async fn open_sse_with_headers(app: &Router, config_id: i64) -> (SseStream, HeaderMap) {
    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("/sse/{config_id}"))
        .body(Body::empty())
        .expect("sse request");
    let response = app.clone().oneshot(request).await.expect("sse response");
    assert_eq!(response.status(), StatusCode::OK, "sse status");
    let headers = response.headers().clone();
    let stream = SseStream {
        stream: response.into_body().into_data_stream(),
        buffer: String::new(),
    };
    (stream, headers)
}

impl SseStream {
    /// Next parsed SSE record, or `None` when the stream ends or the
    /// timeout elapses first.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<SseEventRecord> {
        let start = Instant::now();
        loop {
            if let Some(record) = self.pop_record() {
                return Some(record);
            }
            let remaining = timeout.checked_sub(start.elapsed())?;
            let next = tokio::time::timeout(remaining, self.stream.next())
                .await
                .ok()?;
            let chunk: Bytes = next?.ok()?;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    /// Drives the stream until the body completes; `false` on timeout.
    pub async fn ended(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            let Some(remaining) = timeout.checked_sub(start.elapsed()) else {
                return false;
            };
            match tokio::time::timeout(remaining, self.stream.next()).await {
                Ok(None) => return true,
                Ok(Some(Ok(chunk))) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                Ok(Some(Err(_))) => return true,
                Err(_) => return false,
            }
        }
    }

    fn pop_record(&mut self) -> Option<SseEventRecord> {
        let idx = self.buffer.find("\n\n")?;
        let block = self.buffer[..idx].to_string();
        self.buffer = self.buffer[idx + 2..].to_string();
        parse_sse_block(&block)
    }
}

pub fn parse_sse_block(block: &str) -> Option<SseEventRecord> {
    let mut event = String::new();
    let mut data_lines = Vec::new();
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim_start().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }
    if event.is_empty() && data_lines.is_empty() {
        return None;
    }
    Some(SseEventRecord {
        event,
        data: data_lines.join("\n"),
    })
}
