//! Upstream request model and the HTTP client used to reach board and contact APIs.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "enquiry-upstream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestMethod {
    Get,
    Post,
}

/// How the credential is presented in the `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthHeader {
    /// Sent verbatim, as the board GraphQL API expects.
    Raw(String),
    Bearer(String),
    None,
}

/// Base location + credential of one configured upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    pub auth: AuthHeader,
    pub headers: Vec<(String, String)>,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>, auth: AuthHeader) -> Self {
        Self {
            base_url: base_url.into(),
            auth,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn url_for(&self, path: &str) -> String {
        if path.is_empty() {
            return self.base_url.clone();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// One fully-built request against an upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub source_key: String,
    pub method: RequestMethod,
    pub url: String,
    pub auth: AuthHeader,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<JsonValue>,
}

impl UpstreamRequest {
    /// URL, query and body flattened into one line; used for logging and test matching.
    pub fn describe(&self) -> String {
        let query = self
            .query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let body = self.body.as_ref().map(|b| b.to_string()).unwrap_or_default();
        format!("{:?} {}?{} {}", self.method, self.url, query, body)
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("upstream api error: {0}")]
    Api(String),
    #[error("invalid response body from {url}: {message}")]
    Decode { url: String, message: String },
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Request(err) if err.is_timeout())
    }
}

/// Transport seam: everything above this trait is pure request/response logic.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: &UpstreamRequest) -> Result<JsonValue, UpstreamError>;
}

/// Error text carried inside a 2xx body. GraphQL APIs report failures this way.
pub fn api_error_message(body: &JsonValue) -> Option<String> {
    if let Some(errors) = body.get("errors").and_then(|e| e.as_array()) {
        if !errors.is_empty() {
            let messages = errors
                .iter()
                .map(|e| {
                    e.get("message")
                        .and_then(|m| m.as_str())
                        .map(ToString::to_string)
                        .unwrap_or_else(|| e.to_string())
                })
                .collect::<Vec<_>>();
            return Some(messages.join("; "));
        }
    }
    body.get("error_message")
        .and_then(|m| m.as_str())
        .map(ToString::to_string)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    async fn execute(&self, request: &UpstreamRequest) -> Result<JsonValue, UpstreamError> {
        let mut builder = match request.method {
            RequestMethod::Get => self.client.get(&request.url),
            RequestMethod::Post => self.client.post(&request.url),
        };
        builder = match &request.auth {
            AuthHeader::Raw(key) => builder.header(reqwest::header::AUTHORIZATION, key.as_str()),
            AuthHeader::Bearer(token) => builder.bearer_auth(token),
            AuthHeader::None => builder,
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(status_error(status, final_url));
        }

        let bytes = resp.bytes().await?;
        let body: JsonValue = serde_json::from_slice(&bytes).map_err(|e| UpstreamError::Decode {
            url: final_url.clone(),
            message: e.to_string(),
        })?;
        if let Some(message) = api_error_message(&body) {
            return Err(UpstreamError::Api(message));
        }
        debug!(bytes = bytes.len(), "upstream response decoded");
        Ok(body)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, request: &UpstreamRequest) -> Result<JsonValue, UpstreamError> {
        let span = info_span!(
            "upstream_request",
            source = %request.source_key,
            method = ?request.method,
            url = %request.url
        );
        self.execute(request).instrument(span).await
    }
}

fn status_error(status: StatusCode, url: String) -> UpstreamError {
    UpstreamError::HttpStatus {
        status: status.as_u16(),
        url,
    }
}

/// In-memory upstream answering from a script of `(needle, response)` pairs.
///
/// A request matches the first entry whose needle occurs in [`UpstreamRequest::describe`].
/// Unmatched requests fail with a 404. Every request is recorded.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct ScriptedUpstream {
    script: Vec<(String, Result<JsonValue, String>)>,
    calls: std::sync::Mutex<Vec<UpstreamRequest>>,
}

#[cfg(any(test, feature = "test-util"))]
impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, needle: impl Into<String>, body: JsonValue) -> Self {
        self.script.push((needle.into(), Ok(body)));
        self
    }

    pub fn fail(mut self, needle: impl Into<String>, message: impl Into<String>) -> Self {
        self.script.push((needle.into(), Err(message.into())));
        self
    }

    pub fn calls(&self) -> Vec<UpstreamRequest> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn send(&self, request: &UpstreamRequest) -> Result<JsonValue, UpstreamError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        let described = request.describe();
        let hit = self
            .script
            .iter()
            .find(|(needle, _)| described.contains(needle.as_str()));
        match hit {
            Some((_, Ok(body))) => match api_error_message(body) {
                Some(message) => Err(UpstreamError::Api(message)),
                None => Ok(body.clone()),
            },
            Some((_, Err(message))) => Err(UpstreamError::Api(message.clone())),
            None => Err(UpstreamError::HttpStatus {
                status: 404,
                url: request.url.clone(),
            }),
        }
    }
}
