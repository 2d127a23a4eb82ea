//! Remote backend seam.
//!
//! Processors talk to the backend only through `RemoteApi`, which keeps them
//! testable against `MockRemote` and lets the binary plug in `HttpRemote`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use tracing::debug;

use outbox_core::config::RemoteConfig;

use crate::error::{DispatchError, RemoteError};

/// Header carrying the action's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// HTTP verbs used by processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// A single call to the backend.
///
/// The path is kept as raw segments. `HttpRemote` percent-encodes each one,
/// so an entity id can never add segments, a query or a fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: HttpMethod,
    pub segments: Vec<String>,
    pub body: Option<Value>,
    pub idempotency_key: Option<String>,
}

impl RemoteRequest {
    /// Request to a fixed route such as `events` or `privacy-jobs`.
    pub fn new(method: HttpMethod, route: &str) -> Self {
        Self {
            method,
            segments: route
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            body: None,
            idempotency_key: None,
        }
    }

    /// Append one path segment, taken literally.
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Unencoded path relative to the base URL, e.g. `patterns/p-1`.
    pub fn path(&self) -> String {
        self.segments.join("/")
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }
}

/// The backend's answer, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl RemoteResponse {
    pub fn new(status: u16) -> Self {
        Self { status, body: None }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Best-effort human-readable reason from the body.
    pub fn reason(&self) -> String {
        match &self.body {
            Some(Value::Object(map)) => map
                .get("error")
                .or_else(|| map.get("message"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", self.status)),
            Some(Value::String(s)) if !s.is_empty() => format!("HTTP {}: {}", self.status, s),
            _ => format!("HTTP {}", self.status),
        }
    }
}

/// Transport to the authoritative backend.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse, RemoteError>;
}

// =============================================================================
// HTTP implementation
// =============================================================================

/// `RemoteApi` over HTTPS with JSON bodies.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpRemote {
    pub fn new(config: &RemoteConfig) -> Result<Self, DispatchError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            DispatchError::RemoteSetup(format!("Invalid base URL {}: {}", config.base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(DispatchError::RemoteSetup(format!(
                "Base URL {} cannot take a path",
                config.base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| DispatchError::RemoteSetup(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            auth_token: config.auth_token.clone(),
        })
    }

    /// The base URL with the request's segments appended, each
    /// percent-encoded.
    pub fn url(&self, request: &RemoteRequest) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`: the base URL always takes path segments.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(&request.segments);
        }
        url
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        let url = self.url(&request);
        let mut builder = self.client.request(request.method.to_reqwest(), url.clone());
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(key) = &request.idempotency_key {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(classify_transport_error)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(classify_transport_error)?;
        debug!(method = %request.method, url = %url, status, "Remote call finished");

        let body = if text.trim().is_empty() {
            None
        } else {
            Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
        };
        Ok(RemoteResponse { status, body })
    }
}

fn classify_transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else if err.is_connect() {
        RemoteError::Unreachable(err.to_string())
    } else {
        RemoteError::Transport(err.to_string())
    }
}

// =============================================================================
// Scripted implementation
// =============================================================================

type Scripted = Result<RemoteResponse, RemoteError>;

#[derive(Default)]
struct MockState {
    requests: Vec<RemoteRequest>,
    queued: HashMap<(HttpMethod, String), VecDeque<Scripted>>,
    fixed: HashMap<(HttpMethod, String), Scripted>,
}

/// In-memory `RemoteApi` returning scripted responses and recording every
/// request.
///
/// Lookup order per request: queued one-shot responses for the exact
/// method and path, then a fixed response for that route, then the default
/// (200 with no body).
pub struct MockRemote {
    state: Mutex<MockState>,
    delay: Option<Duration>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            delay: None,
        }
    }

    /// Sleep this long inside every call, to keep actions in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Always answer `method path` with `response`.
    pub fn respond(&self, method: HttpMethod, path: &str, response: Scripted) {
        self.lock().fixed.insert((method, path.to_string()), response);
    }

    /// Answer the next `method path` call with `response`, then fall back.
    pub fn push(&self, method: HttpMethod, path: &str, response: Scripted) {
        self.lock()
            .queued
            .entry((method, path.to_string()))
            .or_default()
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        let scripted = {
            let mut state = self.lock();
            state.requests.push(request.clone());
            let route = (request.method, request.path());
            match state.queued.get_mut(&route).and_then(VecDeque::pop_front) {
                Some(next) => next,
                None => state
                    .fixed
                    .get(&route)
                    .cloned()
                    .unwrap_or_else(|| Ok(RemoteResponse::new(200))),
            }
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        scripted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn http_remote(base_url: &str) -> HttpRemote {
        let config = RemoteConfig {
            base_url: base_url.to_string(),
            ..RemoteConfig::default()
        };
        HttpRemote::new(&config).unwrap()
    }

    #[test]
    fn test_http_remote_url_joining() {
        let remote = http_remote("https://sync.example.com/api/");
        let request = RemoteRequest::new(HttpMethod::Put, "patterns").segment("p-1");
        assert_eq!(
            remote.url(&request).as_str(),
            "https://sync.example.com/api/patterns/p-1"
        );
        let request = RemoteRequest::new(HttpMethod::Post, "events");
        assert_eq!(remote.url(&request).as_str(), "https://sync.example.com/api/events");

        let remote = http_remote("http://127.0.0.1:8080");
        assert_eq!(remote.url(&request).as_str(), "http://127.0.0.1:8080/events");
    }

    #[test]
    fn test_http_remote_escapes_entity_segments() {
        let remote = http_remote("https://sync.example.com/api");

        let url = remote.url(&RemoteRequest::new(HttpMethod::Delete, "pairs").segment("a#b"));
        assert_eq!(url.path(), "/api/pairs/a%23b");
        assert!(url.fragment().is_none());

        let url = remote.url(&RemoteRequest::new(HttpMethod::Delete, "pairs").segment("a?force=1"));
        assert_eq!(url.path(), "/api/pairs/a%3Fforce=1");
        assert!(url.query().is_none());

        let url = remote.url(&RemoteRequest::new(HttpMethod::Delete, "pairs").segment("a/b"));
        assert_eq!(url.path(), "/api/pairs/a%2Fb");
    }

    #[test]
    fn test_http_remote_rejects_bad_base_url() {
        let config = RemoteConfig {
            base_url: "not a url".to_string(),
            ..RemoteConfig::default()
        };
        assert!(matches!(
            HttpRemote::new(&config),
            Err(DispatchError::RemoteSetup(_))
        ));
        let config = RemoteConfig {
            base_url: "mailto:sync@example.com".to_string(),
            ..RemoteConfig::default()
        };
        assert!(HttpRemote::new(&config).is_err());
    }

    #[test]
    fn test_request_path_from_segments() {
        let request = RemoteRequest::new(HttpMethod::Post, "/patterns/")
            .segment("p-1")
            .segment("shares");
        assert_eq!(request.segments, vec!["patterns", "p-1", "shares"]);
        assert_eq!(request.path(), "patterns/p-1/shares");
    }

    #[tokio::test]
    async fn test_http_remote_unreachable_is_transport_error() {
        let config = RemoteConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout_secs: 2,
            ..RemoteConfig::default()
        };
        let remote = HttpRemote::new(&config).unwrap();
        let err = remote
            .send(RemoteRequest::new(HttpMethod::Post, "events"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RemoteError::Unreachable(_) | RemoteError::Transport(_) | RemoteError::Timeout
        ));
    }

    #[test]
    fn test_response_reason() {
        let r = RemoteResponse::new(422).with_body(json!({"error": "name too long"}));
        assert_eq!(r.reason(), "name too long");
        let r = RemoteResponse::new(500).with_body(Value::String("oops".into()));
        assert_eq!(r.reason(), "HTTP 500: oops");
        assert_eq!(RemoteResponse::new(503).reason(), "HTTP 503");
    }

    #[tokio::test]
    async fn test_mock_remote_default_and_recording() {
        let mock = MockRemote::new();
        let request = RemoteRequest::new(HttpMethod::Post, "hugs")
            .with_body(json!({"to": "u-2"}))
            .with_idempotency_key(Some("k-1".into()));
        let response = mock.send(request.clone()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(mock.requests(), vec![request]);
    }

    #[tokio::test]
    async fn test_mock_remote_queued_then_fixed() {
        let mock = MockRemote::new();
        mock.respond(HttpMethod::Delete, "pairs/x", Ok(RemoteResponse::new(404)));
        mock.push(HttpMethod::Delete, "pairs/x", Err(RemoteError::Timeout));

        let first = mock
            .send(RemoteRequest::new(HttpMethod::Delete, "pairs/x"))
            .await;
        assert_eq!(first, Err(RemoteError::Timeout));
        let second = mock
            .send(RemoteRequest::new(HttpMethod::Delete, "pairs/x"))
            .await
            .unwrap();
        assert_eq!(second.status, 404);
        assert_eq!(mock.request_count(), 2);
    }

    #[test]
    fn test_method_display() {
        assert_eq!(HttpMethod::Delete.to_string(), "DELETE");
        assert_eq!(HttpMethod::Post.to_string(), "POST");
    }
}
