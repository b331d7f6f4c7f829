//! Test utilities and app harness for Herald tests.
//!
//! Provides:
//! - A SQLite-backed app on a temporary data directory
//! - Seeded users and tokens
//! - Request and SSE frame helpers

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use futures::StreamExt;
use herald::api::create_router;
use herald::config::Config;
use herald::model::{Role, UserId};
use herald::server::ServerState;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

pub const ADMIN_TOKEN: &str = "tok-admin";
pub const ALICE_TOKEN: &str = "tok-alice";
pub const BOB_TOKEN: &str = "tok-bob";

/// App harness over a throwaway database.
///
/// The directory is automatically cleaned up when the harness is dropped.
pub struct TestApp {
    /// Temporary directory for the test database
    pub temp_dir: TempDir,
    pub config: Config,
    pub state: ServerState,
}

impl TestApp {
    /// Open a fresh store with an admin, `alice` and `bob`.
    pub fn new() -> Self {
        herald::observability::tracing::init_test_tracing();
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = Config::test_config(temp_dir.path().to_path_buf());
        let state = ServerState::open(&config).expect("failed to open store");

        for (token, id, role) in [
            (ADMIN_TOKEN, "admin", Role::Admin),
            (ALICE_TOKEN, "alice", Role::User),
            (BOB_TOKEN, "bob", Role::User),
        ] {
            let user = UserId::new(id);
            state
                .store
                .upsert_user(&user, id, role)
                .expect("failed to seed user");
            state
                .store
                .issue_token(token, &user)
                .expect("failed to seed token");
        }

        Self {
            temp_dir,
            config,
            state,
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.app.clone())
    }

    /// Send one request through a fresh router.
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }
}

impl Default for TestApp {
    fn default() -> Self {
        Self::new()
    }
}

pub fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    request("GET", uri, token, Body::empty())
}

pub fn post(uri: &str, token: Option<&str>) -> Request<Body> {
    request("POST", uri, token, Body::empty())
}

pub fn post_json(uri: &str, token: Option<&str>, body: &serde_json::Value) -> Request<Body> {
    let mut req = request("POST", uri, token, Body::from(body.to_string()));
    req.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    req
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Body) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(body).expect("valid request")
}

/// Read a whole JSON response body.
pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .expect("failed to read body");
    serde_json::from_slice(&bytes).expect("body is not JSON")
}

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: serde_json::Value,
    pub retry_ms: Option<u64>,
}

/// Incremental reader over an SSE response body.
pub struct SseReader {
    body: axum::body::BodyDataStream,
    buffer: String,
}

impl SseReader {
    pub fn new(response: Response<Body>) -> Self {
        Self {
            body: response.into_body().into_data_stream(),
            buffer: String::new(),
        }
    }

    /// Next frame, or `None` once the stream has ended.
    pub async fn next_frame(&mut self) -> Option<SseFrame> {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let raw: String = self.buffer.drain(..end + 2).collect();
                return Some(parse_frame(&raw));
            }
            let chunk = self.body.next().await?.expect("body error");
            self.buffer.push_str(std::str::from_utf8(&chunk).expect("utf8 frame"));
        }
    }

    /// Next frame that is not an `alive` heartbeat.
    pub async fn next_non_idle_within(&mut self, timeout: Duration) -> Option<SseFrame> {
        loop {
            let frame = self.next_frame_within(timeout).await?;
            if frame.event != "heartbeat" || frame.data["status"] != "alive" {
                return Some(frame);
            }
        }
    }

    /// Next frame within `timeout`.
    pub async fn next_frame_within(&mut self, timeout: Duration) -> Option<SseFrame> {
        tokio::time::timeout(timeout, self.next_frame())
            .await
            .expect("timed out waiting for SSE frame")
    }
}

fn parse_frame(raw: &str) -> SseFrame {
    let mut event = String::new();
    let mut data = String::new();
    let mut retry_ms = None;
    for line in raw.lines() {
        if let Some(v) = line.strip_prefix("event:") {
            event = v.trim().to_string();
        } else if let Some(v) = line.strip_prefix("data:") {
            data.push_str(v.trim());
        } else if let Some(v) = line.strip_prefix("retry:") {
            retry_ms = v.trim().parse().ok();
        }
    }
    SseFrame {
        event,
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        retry_ms,
    }
}

/// Wait for a condition to become true with timeout.
///
/// # Returns
///
/// `true` if condition was met, `false` if timeout expired
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame() {
        let frame = parse_frame("event: heartbeat\ndata: {\"status\":\"alive\"}\nretry: 10000\n\n");
        assert_eq!(frame.event, "heartbeat");
        assert_eq!(frame.data["status"], "alive");
        assert_eq!(frame.retry_ms, Some(10000));
    }
}
