//! Feishu Open API client with tenant-access-token caching.
//!
//! One client instance is bound to one `(app_id, app_secret)` pair and owns
//! that pair's token cache, so callers should construct a client once per
//! credential pair and reuse it. Send and reply responses are returned
//! undecoded beyond their documented schema; vendor status codes are left
//! for the caller to interpret.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

pub const FEISHU_API_BASE: &str = "https://open.feishu.cn/open-apis";

/// Refresh the cached token when less than this remains before expiry.
const TOKEN_REFRESH_MARGIN_MS: u64 = 5 * 60 * 1000;
/// Vendor default when the auth response omits `expire`.
const DEFAULT_TOKEN_EXPIRE_SECS: u64 = 7200;

pub(crate) fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[derive(Debug)]
/// Failure taxonomy for Open API calls. Auth failures are terminal for a
/// given credential pair; retrying without changing credentials fails the
/// same way.
pub enum FeishuApiError {
    /// Transport-level failure (connect, TLS, timeout).
    Http {
        endpoint: String,
        source: reqwest::Error,
    },
    /// Non-success HTTP status from the token endpoint.
    AuthStatus { status: u16 },
    /// The vendor rejected the app credentials.
    Auth { code: i64, msg: String },
    /// Auth succeeded but no token was returned.
    MissingToken,
    /// A response body did not match the documented schema.
    Decode {
        endpoint: String,
        source: serde_json::Error,
    },
}

impl FeishuApiError {
    /// True when the underlying transport failure was a timeout; used by the
    /// health prober to report bounded-time failures distinctly.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Http { source, .. } if source.is_timeout())
    }
}

impl std::fmt::Display for FeishuApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http { endpoint, source } => {
                write!(f, "request to {endpoint} failed: {source}")
            }
            Self::AuthStatus { status } => {
                write!(f, "Failed to get tenant access token: {status}")
            }
            Self::Auth { code, msg } => write!(f, "Feishu auth error: {msg} (code: {code})"),
            Self::MissingToken => write!(f, "No tenant access token in response"),
            Self::Decode { endpoint, source } => {
                write!(f, "failed to decode response from {endpoint}: {source}")
            }
        }
    }
}

impl std::error::Error for FeishuApiError {}

#[derive(Debug, Clone, Deserialize)]
pub struct FeishuTokenResponse {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub tenant_access_token: Option<String>,
    #[serde(default)]
    pub expire: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeishuSendMessageResponse {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Option<FeishuSendMessageData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeishuSendMessageData {
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeishuBotInfoResponse {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub bot: Option<FeishuBotInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeishuBotInfo {
    #[serde(default)]
    pub activate_status: Option<i64>,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub open_id: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub ip_white_list: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Vendor discriminator for the kind of id a send targets.
pub enum FeishuReceiveIdType {
    #[default]
    OpenId,
    UserId,
    UnionId,
    ChatId,
}

impl FeishuReceiveIdType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenId => "open_id",
            Self::UserId => "user_id",
            Self::UnionId => "union_id",
            Self::ChatId => "chat_id",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeishuApiClientConfig {
    pub app_id: String,
    pub app_secret: String,
    pub api_base: String,
    pub http_timeout_ms: Option<u64>,
}

impl FeishuApiClientConfig {
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            api_base: FEISHU_API_BASE.to_string(),
            http_timeout_ms: None,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_http_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.http_timeout_ms = Some(timeout_ms.max(1));
        self
    }
}

#[derive(Debug, Clone)]
/// Cached tenant access token plus its absolute expiry.
pub struct FeishuTokenCacheEntry {
    pub token: String,
    pub expires_at_unix_ms: u64,
}

impl FeishuTokenCacheEntry {
    fn is_fresh(&self, now_unix_ms: u64) -> bool {
        now_unix_ms < self.expires_at_unix_ms.saturating_sub(TOKEN_REFRESH_MARGIN_MS)
    }
}

#[derive(Debug)]
pub struct FeishuApiClient {
    config: FeishuApiClientConfig,
    client: reqwest::Client,
    token_cache: RwLock<Option<FeishuTokenCacheEntry>>,
}

impl FeishuApiClient {
    pub fn new(config: FeishuApiClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout_ms) = config.http_timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }
        let client = builder
            .build()
            .context("failed to build feishu http client")?;
        Ok(Self {
            config,
            client,
            token_cache: RwLock::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    /// Returns a valid tenant access token, refreshing it when the cached
    /// one is inside the expiry margin. Holding the cache write lock across
    /// the exchange serializes concurrent refreshes for this credential
    /// pair.
    pub async fn tenant_access_token(&self) -> Result<String, FeishuApiError> {
        {
            let cache = self.token_cache.read().await;
            if let Some(entry) = cache.as_ref() {
                if entry.is_fresh(current_unix_timestamp_ms()) {
                    return Ok(entry.token.clone());
                }
            }
        }

        let mut cache = self.token_cache.write().await;
        if let Some(entry) = cache.as_ref() {
            if entry.is_fresh(current_unix_timestamp_ms()) {
                return Ok(entry.token.clone());
            }
        }

        let endpoint = self.endpoint("/auth/v3/tenant_access_token/internal");
        let response = self
            .client
            .post(&endpoint)
            .json(&json!({
                "app_id": self.config.app_id,
                "app_secret": self.config.app_secret,
            }))
            .send()
            .await
            .map_err(|source| FeishuApiError::Http {
                endpoint: endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeishuApiError::AuthStatus {
                status: status.as_u16(),
            });
        }

        let decoded: FeishuTokenResponse = decode_response(&endpoint, response).await?;
        if decoded.code != 0 {
            return Err(FeishuApiError::Auth {
                code: decoded.code,
                msg: decoded.msg,
            });
        }
        let token = decoded
            .tenant_access_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or(FeishuApiError::MissingToken)?;

        let expire_secs = decoded.expire.unwrap_or(DEFAULT_TOKEN_EXPIRE_SECS);
        let expires_at_unix_ms =
            current_unix_timestamp_ms().saturating_add(expire_secs.saturating_mul(1000));
        tracing::debug!(expires_at_unix_ms, "refreshed feishu tenant access token");
        *cache = Some(FeishuTokenCacheEntry {
            token: token.clone(),
            expires_at_unix_ms,
        });
        Ok(token)
    }

    /// Sends a message. The vendor response is decoded but its status code
    /// is not validated here.
    pub async fn send_message(
        &self,
        receive_id: &str,
        content: &str,
        receive_id_type: FeishuReceiveIdType,
        msg_type: &str,
    ) -> Result<FeishuSendMessageResponse, FeishuApiError> {
        let token = self.tenant_access_token().await?;
        let endpoint = format!(
            "{}?receive_id_type={}",
            self.endpoint("/im/v1/messages"),
            receive_id_type.as_str()
        );
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&token)
            .json(&json!({
                "receive_id": receive_id,
                "msg_type": msg_type,
                "content": content,
            }))
            .send()
            .await
            .map_err(|source| FeishuApiError::Http {
                endpoint: endpoint.clone(),
                source,
            })?;
        decode_response(&endpoint, response).await
    }

    /// Replies to an existing message addressed by vendor message id.
    pub async fn reply_message(
        &self,
        message_id: &str,
        content: &str,
        msg_type: &str,
    ) -> Result<FeishuSendMessageResponse, FeishuApiError> {
        let token = self.tenant_access_token().await?;
        let endpoint = self.endpoint(&format!("/im/v1/messages/{message_id}/reply"));
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&token)
            .json(&json!({
                "content": content,
                "msg_type": msg_type,
            }))
            .send()
            .await
            .map_err(|source| FeishuApiError::Http {
                endpoint: endpoint.clone(),
                source,
            })?;
        decode_response(&endpoint, response).await
    }

    /// Fetches the bot identity for the configured credentials.
    pub async fn get_bot_info(&self) -> Result<FeishuBotInfoResponse, FeishuApiError> {
        let token = self.tenant_access_token().await?;
        let endpoint = self.endpoint("/bot/v3/bot_info");
        let response = self
            .client
            .get(&endpoint)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|source| FeishuApiError::Http {
                endpoint: endpoint.clone(),
                source,
            })?;
        decode_response(&endpoint, response).await
    }

    #[cfg(test)]
    pub(crate) async fn seed_token_cache(&self, entry: FeishuTokenCacheEntry) {
        *self.token_cache.write().await = Some(entry);
    }
}

async fn decode_response<T: DeserializeOwned>(
    endpoint: &str,
    response: reqwest::Response,
) -> Result<T, FeishuApiError> {
    let raw = response
        .text()
        .await
        .map_err(|source| FeishuApiError::Http {
            endpoint: endpoint.to_string(),
            source,
        })?;
    serde_json::from_str(&raw).map_err(|source| FeishuApiError::Decode {
        endpoint: endpoint.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    fn client_for(server: &MockServer) -> FeishuApiClient {
        FeishuApiClient::new(
            FeishuApiClientConfig::new("cli_test", "secret_test").with_api_base(server.base_url()),
        )
        .expect("client should build")
    }

    fn mock_auth(server: &MockServer) -> httpmock::Mock<'_> {
        server.mock(|when, then| {
            when.method(POST)
                .path("/auth/v3/tenant_access_token/internal")
                .json_body(json!({
                    "app_id": "cli_test",
                    "app_secret": "secret_test",
                }));
            then.status(200).json_body(json!({
                "code": 0,
                "msg": "ok",
                "tenant_access_token": "t-token",
                "expire": 7200,
            }));
        })
    }

    #[tokio::test]
    async fn functional_token_is_cached_within_expiry_window() {
        let server = MockServer::start();
        let auth = mock_auth(&server);
        let client = client_for(&server);

        let first = client.tenant_access_token().await.expect("first token");
        let second = client.tenant_access_token().await.expect("second token");

        assert_eq!(first, "t-token");
        assert_eq!(second, "t-token");
        assert_eq!(auth.hits(), 1);
    }

    #[tokio::test]
    async fn functional_expired_token_triggers_a_second_exchange() {
        let server = MockServer::start();
        let auth = mock_auth(&server);
        let client = client_for(&server);

        client
            .seed_token_cache(FeishuTokenCacheEntry {
                token: "stale".to_string(),
                expires_at_unix_ms: current_unix_timestamp_ms(),
            })
            .await;

        let token = client.tenant_access_token().await.expect("token");
        assert_eq!(token, "t-token");
        assert_eq!(auth.hits(), 1);
    }

    #[tokio::test]
    async fn functional_token_inside_refresh_margin_is_treated_as_expired() {
        let server = MockServer::start();
        let auth = mock_auth(&server);
        let client = client_for(&server);

        // Expires in one minute, inside the five-minute margin.
        client
            .seed_token_cache(FeishuTokenCacheEntry {
                token: "nearly-stale".to_string(),
                expires_at_unix_ms: current_unix_timestamp_ms() + 60_000,
            })
            .await;

        let token = client.tenant_access_token().await.expect("token");
        assert_eq!(token, "t-token");
        assert_eq!(auth.hits(), 1);
    }

    #[tokio::test]
    async fn functional_auth_rejection_maps_to_auth_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/auth/v3/tenant_access_token/internal");
            then.status(200)
                .json_body(json!({ "code": 10003, "msg": "invalid app_secret" }));
        });
        let client = client_for(&server);

        let error = client
            .tenant_access_token()
            .await
            .expect_err("auth should fail");
        assert!(matches!(
            error,
            FeishuApiError::Auth { code: 10003, .. }
        ));
        assert_eq!(
            error.to_string(),
            "Feishu auth error: invalid app_secret (code: 10003)"
        );
    }

    #[tokio::test]
    async fn functional_missing_token_field_is_a_distinct_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/auth/v3/tenant_access_token/internal");
            then.status(200).json_body(json!({ "code": 0, "msg": "ok" }));
        });
        let client = client_for(&server);

        let error = client
            .tenant_access_token()
            .await
            .expect_err("missing token should fail");
        assert!(matches!(error, FeishuApiError::MissingToken));
    }

    #[tokio::test]
    async fn functional_http_failure_status_maps_to_auth_status_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/auth/v3/tenant_access_token/internal");
            then.status(503).body("upstream down");
        });
        let client = client_for(&server);

        let error = client
            .tenant_access_token()
            .await
            .expect_err("status should fail");
        assert!(matches!(error, FeishuApiError::AuthStatus { status: 503 }));
    }

    #[tokio::test]
    async fn functional_send_message_encodes_receive_id_type_and_returns_response() {
        let server = MockServer::start();
        mock_auth(&server);
        let send = server.mock(|when, then| {
            when.method(POST)
                .path("/im/v1/messages")
                .query_param("receive_id_type", "chat_id")
                .json_body(json!({
                    "receive_id": "oc_chat",
                    "msg_type": "text",
                    "content": "{\"text\":\"hello\"}",
                }));
            then.status(200).json_body(json!({
                "code": 0,
                "msg": "success",
                "data": { "message_id": "om_123" },
            }));
        });
        let client = client_for(&server);

        let response = client
            .send_message(
                "oc_chat",
                "{\"text\":\"hello\"}",
                FeishuReceiveIdType::ChatId,
                "text",
            )
            .await
            .expect("send should succeed");

        assert_eq!(response.code, 0);
        assert_eq!(
            response.data.and_then(|data| data.message_id).as_deref(),
            Some("om_123")
        );
        send.assert();
    }

    #[tokio::test]
    async fn functional_reply_message_targets_reply_endpoint() {
        let server = MockServer::start();
        mock_auth(&server);
        let reply = server.mock(|when, then| {
            when.method(POST)
                .path("/im/v1/messages/om_parent/reply")
                .json_body(json!({
                    "content": "{\"text\":\"pong\"}",
                    "msg_type": "text",
                }));
            then.status(200)
                .json_body(json!({ "code": 0, "msg": "success", "data": { "message_id": "om_r" } }));
        });
        let client = client_for(&server);

        let response = client
            .reply_message("om_parent", "{\"text\":\"pong\"}", "text")
            .await
            .expect("reply should succeed");
        assert_eq!(response.code, 0);
        reply.assert();
    }

    #[tokio::test]
    async fn functional_get_bot_info_decodes_bot_payload() {
        let server = MockServer::start();
        mock_auth(&server);
        server.mock(|when, then| {
            when.method(GET).path("/bot/v3/bot_info");
            then.status(200).json_body(json!({
                "code": 0,
                "msg": "ok",
                "bot": {
                    "activate_status": 1,
                    "app_name": "Helper",
                    "open_id": "ou_bot",
                    "avatar_url": "",
                    "ip_white_list": [],
                },
            }));
        });
        let client = client_for(&server);

        let response = client.get_bot_info().await.expect("bot info");
        let bot = response.bot.expect("bot payload");
        assert_eq!(bot.app_name, "Helper");
        assert_eq!(bot.activate_status, Some(1));
    }

    #[tokio::test]
    async fn functional_non_json_body_is_a_decode_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/auth/v3/tenant_access_token/internal");
            then.status(200).body("<html>gateway error</html>");
        });
        let client = client_for(&server);

        let error = client
            .tenant_access_token()
            .await
            .expect_err("decode should fail");
        assert!(matches!(error, FeishuApiError::Decode { .. }));
    }
}
