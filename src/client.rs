//! HTTP adapter for the Quarri backend.
//!
//! Every expected failure (timeout, transport, non-2xx, `success: false`)
//! comes back as an [`ApiError`] value; nothing here panics on a bad reply.

use crate::config::Settings;
use anyhow::{anyhow, Result};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    #[error("Request timed out after {secs} seconds. The backend may still be processing; try again or narrow the request.")]
    Timeout { secs: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("{message}")]
    Http { status: u16, message: String },

    #[error("{0}")]
    Backend(String),

    #[error("Invalid response from backend: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Http { status: 401, .. })
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    default_timeout: Duration,
    pipeline_timeout: Duration,
}

impl ApiClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("quarri-mcp/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {e}"))?;
        Ok(Self {
            http,
            base_url: settings.base_url.clone(),
            default_timeout: settings.default_timeout,
            pipeline_timeout: settings.pipeline_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pipeline_timeout(&self) -> Duration {
        self.pipeline_timeout
    }

    /// One request/response exchange. `token` adds a bearer header; `timeout`
    /// falls back to the short default.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Value, ApiError> {
        let mut req = self.request(method, path, token);
        if let Some(body) = body {
            req = req.json(body);
        }
        self.execute(req, timeout.unwrap_or(self.default_timeout)).await
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<Value, ApiError> {
        self.call(Method::GET, path, None, token, None).await
    }

    pub async fn get_with_query(
        &self,
        path: &str,
        query: &[(&str, &str)],
        token: Option<&str>,
    ) -> Result<Value, ApiError> {
        let req = self.request(Method::GET, path, token).query(query);
        self.execute(req, self.default_timeout).await
    }

    pub async fn post(&self, path: &str, body: &Value, token: Option<&str>) -> Result<Value, ApiError> {
        self.call(Method::POST, path, Some(body), token, None).await
    }

    fn request(&self, method: Method, path: &str, token: Option<&str>) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("{method} {url}");
        let req = self.http.request(method, url);
        match token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn execute(&self, req: RequestBuilder, timeout: Duration) -> Result<Value, ApiError> {
        let resp = req.timeout(timeout).send().await.map_err(|e| transport_error(e, timeout))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| transport_error(e, timeout))?;
        let parsed: Option<Value> = if text.trim().is_empty() {
            Some(json!({}))
        } else {
            serde_json::from_str(&text).ok()
        };

        if !status.is_success() {
            let message = parsed
                .as_ref()
                .and_then(backend_message)
                .unwrap_or_else(|| status_line(status));
            return Err(ApiError::Http { status: status.as_u16(), message });
        }

        let value = parsed.ok_or_else(|| ApiError::Decode(truncate(&text, 200)))?;
        if value.get("success").and_then(Value::as_bool) == Some(false) {
            let message = backend_message(&value).unwrap_or_else(|| "Request failed".to_string());
            return Err(ApiError::Backend(message));
        }
        Ok(value)
    }

    /// `POST /api/cli/tool/{internal_name}` with the selected database as context.
    pub async fn call_tool(
        &self,
        internal_name: &str,
        args: &Value,
        database_name: Option<&str>,
        token: &str,
        timeout: Duration,
    ) -> Result<Value, ApiError> {
        let mut body = json!({ "args": args });
        if let Some(db) = database_name {
            body["database_name"] = json!(db);
        }
        let path = format!("/api/cli/tool/{internal_name}");
        self.call(Method::POST, &path, Some(&body), Some(token), Some(timeout)).await
    }

    pub async fn health(&self) -> Result<Value, ApiError> {
        self.get("/api/cli/health", None).await
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout { secs: timeout.as_secs() }
    } else {
        ApiError::Network(e.to_string())
    }
}

fn backend_message(body: &Value) -> Option<String> {
    ["error", "message", "detail"]
        .iter()
        .find_map(|k| body.get(*k).and_then(Value::as_str))
        .filter(|m| !m.is_empty())
        .map(String::from)
}

fn status_line(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("HTTP {} {reason}", status.as_u16()),
        None => format!("HTTP {}", status.as_u16()),
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}…", &s[..i]),
        None => s.to_string(),
    }
}
