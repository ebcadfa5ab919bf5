//! HTTP transport to the NL-to-SQL service
//!
//! Every remote call in the crate goes through [`ApiClient`]. It attaches the
//! bearer token when given one and folds failures into [`ClientError`]: a 401 on
//! an authenticated call becomes `AuthenticationExpired`, anything else carries
//! the server's `detail` text.

use reqwest::{multipart, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::wire::{ChatResponse, ErrorBody, SchemaPayload, SchemaResponse, TokenResponse};
use crate::config::Config;
use crate::error::{ClientError, ClientResult};

#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ClientResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::remote(None, format!("failed to build HTTP client: {}", e)))?;
        info!("API client initialized with backend: {} (timeout {:?})", base_url, timeout);
        Ok(Self {
            base_url,
            http_client,
        })
    }

    pub fn from_config(config: &Config) -> ClientResult<Self> {
        Self::new(config.api_base_url.clone(), config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn signup(&self, username: &str, email: &str, password: &str) -> ClientResult<()> {
        debug!("POST /signup for '{}'", username);
        let response = self
            .http_client
            .post(self.url("/signup"))
            .form(&[("username", username), ("email", email), ("password", password)])
            .send()
            .await?;
        Self::check(response, false).await?;
        Ok(())
    }

    /// Returns the issued bearer token.
    pub async fn login(&self, username: &str, password: &str) -> ClientResult<String> {
        debug!("POST /login for '{}'", username);
        let response = self
            .http_client
            .post(self.url("/login"))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;
        let token: TokenResponse = Self::check(response, false).await?.json().await?;
        if token.access_token.trim().is_empty() {
            return Err(ClientError::remote(None, "login succeeded but no access token was issued"));
        }
        if let Some(kind) = token.token_type.as_deref() {
            if !kind.eq_ignore_ascii_case("bearer") {
                warn!("Unexpected token type '{}', sending it as a bearer token anyway", kind);
            }
        }
        Ok(token.access_token)
    }

    pub async fn fetch_schema(&self, token: &str) -> ClientResult<Option<SchemaPayload>> {
        debug!("GET /schema");
        let response = self
            .http_client
            .get(self.url("/schema"))
            .bearer_auth(token)
            .send()
            .await?;
        let body: SchemaResponse = Self::check(response, true).await?.json().await?;
        Ok(body.schema)
    }

    pub async fn upload(
        &self,
        token: Option<&str>,
        file_name: &str,
        bytes: Vec<u8>,
        table_name: &str,
    ) -> ClientResult<()> {
        debug!("POST /upload '{}' as '{}' ({} bytes)", file_name, table_name, bytes.len());
        let form = multipart::Form::new()
            .part("file", multipart::Part::bytes(bytes).file_name(file_name.to_string()))
            .text("table_name", table_name.to_string());
        let mut request = self.http_client.post(self.url("/upload")).multipart(form);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        Self::check(response, token.is_some()).await?;
        Ok(())
    }

    pub async fn chat(&self, token: &str, query: &str) -> ClientResult<ChatResponse> {
        debug!("POST /chat ({} chars)", query.len());
        let response = self
            .http_client
            .post(self.url("/chat"))
            .bearer_auth(token)
            .form(&[("query", query)])
            .send()
            .await?;
        let body = Self::check(response, true).await?.json().await?;
        Ok(body)
    }

    /// Runs `sql` server-side and returns the CSV body.
    pub async fn export_csv(&self, token: &str, sql: &str) -> ClientResult<String> {
        debug!("POST /export ({} chars)", sql.len());
        let response = self
            .http_client
            .post(self.url("/export"))
            .bearer_auth(token)
            .form(&[("sql", sql)])
            .send()
            .await?;
        let body = Self::check(response, true).await?.text().await?;
        Ok(body)
    }

    async fn check(response: Response, authenticated: bool) -> ClientResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if authenticated && status == StatusCode::UNAUTHORIZED {
            warn!("Service rejected the session token ({})", status);
            return Err(ClientError::AuthenticationExpired);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = extract_detail(status, &body);
        debug!("Service returned {}: {}", status, detail);
        Err(ClientError::remote(Some(status.as_u16()), detail))
    }
}

/// Pulls the human-readable reason out of an error body.
pub(crate) fn extract_detail(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        match parsed.detail {
            Value::String(text) if !text.trim().is_empty() => return text,
            Value::String(_) | Value::Null => {}
            Value::Array(items) => {
                let messages: Vec<String> = items
                    .iter()
                    .filter_map(|item| item.get("msg").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect();
                if !messages.is_empty() {
                    return messages.join("; ");
                }
            }
            other => return other.to_string(),
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed.starts_with('{') {
        format!("request failed with status {}", status)
    } else {
        trimmed.to_string()
    }
}
