use std::time::Duration;

use async_trait::async_trait;
use casebook_core::chrono::Utc;
use casebook_core::UpstreamError;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::cards::{to_message_body, RenderedResponse};

/// Tenant access token cache. Tokens are refreshed ahead of expiry; the
/// mutex serializes refreshes so concurrent callers share one fetch.
pub struct TokenCache {
    http: reqwest::Client,
    domain: String,
    app_id: String,
    app_secret: SecretString,
    cached: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    token: String,
    expires_at: i64,
}

const EXPIRY_MARGIN_SECS: i64 = 120;

impl TokenCache {
    pub fn new(http: reqwest::Client, domain: &str, app_id: &str, app_secret: SecretString) -> Self {
        Self {
            http,
            domain: domain.trim_end_matches('/').to_owned(),
            app_id: app_id.to_owned(),
            app_secret,
            cached: Mutex::new(None),
        }
    }

    pub async fn tenant_token(&self) -> Result<String, UpstreamError> {
        let mut guard = self.cached.lock().await;
        let now = Utc::now().timestamp();
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at - EXPIRY_MARGIN_SECS > now {
                return Ok(cached.token.clone());
            }
        }

        let url = format!("{}/open-apis/auth/v3/tenant_access_token/internal", self.domain);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "app_id": self.app_id,
                "app_secret": self.app_secret.expose_secret(),
            }))
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        let body: Value =
            response.json().await.map_err(|error| UpstreamError::Malformed(error.to_string()))?;

        if !status.is_success() || body.get("code").and_then(Value::as_i64).unwrap_or(0) != 0 {
            let message = body
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("token acquisition failed")
                .to_owned();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(UpstreamError::Auth(message));
            }
            return Err(UpstreamError::Status { status: status.as_u16(), message });
        }

        let token = body
            .get("tenant_access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| UpstreamError::Malformed("missing tenant_access_token".into()))?
            .to_owned();
        let expire = body.get("expire").and_then(Value::as_i64).unwrap_or(7200);

        *guard = Some(CachedToken { token: token.clone(), expires_at: now + expire });
        debug!(event_name = "feishu.token.refreshed", expire, "tenant token refreshed");
        Ok(token)
    }

    /// Drops the cached token; the next call re-authenticates.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

pub fn request_error(error: reqwest::Error) -> UpstreamError {
    if error.is_timeout() {
        UpstreamError::Timeout(error.to_string())
    } else if let Some(status) = error.status() {
        UpstreamError::Status { status: status.as_u16(), message: error.to_string() }
    } else {
        UpstreamError::Network(error.to_string())
    }
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_text(&self, open_id: &str, text: &str) -> Result<(), UpstreamError>;
    async fn send_response(
        &self,
        open_id: &str,
        response: &RenderedResponse,
    ) -> Result<(), UpstreamError>;
}

/// HTTP message sender against the channel's messaging API.
pub struct FeishuSender {
    http: reqwest::Client,
    domain: String,
    tokens: std::sync::Arc<TokenCache>,
}

impl FeishuSender {
    pub fn new(
        http: reqwest::Client,
        domain: &str,
        tokens: std::sync::Arc<TokenCache>,
    ) -> Self {
        Self { http, domain: domain.trim_end_matches('/').to_owned(), tokens }
    }

    pub fn default_http_client(timeout_secs: u64) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.clamp(1, 30)))
            .build()
            .unwrap_or_default()
    }

    async fn send_raw(
        &self,
        open_id: &str,
        msg_type: &str,
        content: &Value,
    ) -> Result<(), UpstreamError> {
        let token = self.tokens.tenant_token().await?;
        let url = format!("{}/open-apis/im/v1/messages?receive_id_type=open_id", self.domain);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&json!({
                "receive_id": open_id,
                "msg_type": msg_type,
                "content": content.to_string(),
            }))
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                self.tokens.invalidate().await;
                return Err(UpstreamError::Auth(message));
            }
            return Err(UpstreamError::Status { status: status.as_u16(), message });
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSender for FeishuSender {
    async fn send_text(&self, open_id: &str, text: &str) -> Result<(), UpstreamError> {
        self.send_raw(open_id, "text", &json!({"text": text})).await
    }

    async fn send_response(
        &self,
        open_id: &str,
        response: &RenderedResponse,
    ) -> Result<(), UpstreamError> {
        let (msg_type, body) = to_message_body(response);
        self.send_raw(open_id, msg_type, &body).await
    }
}
