//! Outbound message dispatch for the Feishu channel.
//!
//! Builds text/rich-text payloads, infers the receive-id type from the
//! target id shape, and chunks oversized text at newline/space boundaries
//! within the account's configured limit. Vendor and transport failures are
//! folded into structured send results; these entry points never raise
//! across the public boundary.

use crate::feishu_accounts::{
    resolve_feishu_account, FeishuChannelConfig, FeishuEnvCredentials, ResolvedFeishuAccount,
};
use crate::feishu_api::{
    FeishuApiClient, FeishuApiClientConfig, FeishuReceiveIdType, FeishuSendMessageResponse,
    FEISHU_API_BASE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Payload kind for an outbound message.
pub enum FeishuMessageType {
    #[default]
    Text,
    Post,
}

impl FeishuMessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Post => "post",
        }
    }
}

#[derive(Debug, Clone)]
/// Options for one send/reply call. `api_base` is overridable so tests can
/// point dispatch at a local mock server.
pub struct FeishuSendOptions {
    pub account_id: Option<String>,
    pub message_type: FeishuMessageType,
    pub api_base: String,
}

impl Default for FeishuSendOptions {
    fn default() -> Self {
        Self {
            account_id: None,
            message_type: FeishuMessageType::Text,
            api_base: FEISHU_API_BASE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of one delivery attempt.
pub struct FeishuSendResult {
    pub ok: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl FeishuSendResult {
    fn success(message_id: Option<String>) -> Self {
        Self {
            ok: true,
            message_id,
            error: None,
        }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

/// Splits `text` into chunks of at most `limit` characters.
///
/// Each window prefers breaking at the last newline past the window start,
/// then the last space, then a hard break at exactly `limit`. Emitted chunks
/// are right-trimmed; a separator the break landed on is consumed; the
/// remainder is left-trimmed before the next pass. Every iteration strictly
/// shortens the remainder, so the loop terminates.
pub fn chunk_feishu_text(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if limit == 0 || text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while remaining.chars().count() > limit {
        let window_end = byte_offset_at_char(remaining, limit);
        let window = &remaining[..window_end];
        // A newline at the window's first character is not a break point;
        // the search falls through to spaces, then to a hard break.
        let break_byte = window
            .rfind('\n')
            .filter(|index| *index > 0)
            .or_else(|| window.rfind(' ').filter(|index| *index > 0))
            .unwrap_or(window_end);

        let chunk = remaining[..break_byte].trim_end();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }

        let separator = remaining[break_byte..].chars().next();
        let next_start = match separator {
            Some(ch) if ch.is_whitespace() => break_byte + ch.len_utf8(),
            _ => break_byte,
        };
        remaining = remaining[next_start..].trim_start();
    }
    if !remaining.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}

fn byte_offset_at_char(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map(|(offset, _)| offset)
        .unwrap_or(text.len())
}

/// Chat ids carry an `oc_` prefix; anything else is addressed as a user
/// open id.
fn infer_receive_id_type(target: &str) -> FeishuReceiveIdType {
    if target.starts_with("oc_") {
        FeishuReceiveIdType::ChatId
    } else {
        FeishuReceiveIdType::OpenId
    }
}

fn build_message_content(message_type: FeishuMessageType, text: &str) -> String {
    match message_type {
        FeishuMessageType::Text => serde_json::json!({ "text": text }).to_string(),
        FeishuMessageType::Post => serde_json::json!({
            "content": [[{ "tag": "text", "text": text }]],
        })
        .to_string(),
    }
}

fn build_media_content(media_url: &str, caption: &str) -> String {
    let caption = if caption.is_empty() {
        "Shared media:"
    } else {
        caption
    };
    serde_json::json!({
        "content": [
            [{ "tag": "text", "text": caption }],
            [{ "tag": "a", "text": media_url, "href": media_url }],
        ],
    })
    .to_string()
}

const UNCONFIGURED_ERROR: &str = "Feishu app ID or app secret not configured";

fn build_dispatch_client(
    account: &ResolvedFeishuAccount,
    api_base: &str,
) -> Result<FeishuApiClient, String> {
    FeishuApiClient::new(
        FeishuApiClientConfig::new(account.app_id.clone(), account.app_secret.clone())
            .with_api_base(api_base),
    )
    .map_err(|error| error.to_string())
}

fn vendor_response_to_result(response: FeishuSendMessageResponse) -> FeishuSendResult {
    if response.code != 0 {
        return FeishuSendResult::failure(format!(
            "Feishu API error: {} (code: {})",
            response.msg, response.code
        ));
    }
    FeishuSendResult::success(response.data.and_then(|data| data.message_id))
}

/// Sends `text` to a user or chat, resolving the account per call.
pub async fn send_feishu_message(
    config: &FeishuChannelConfig,
    env: &FeishuEnvCredentials,
    to: &str,
    text: &str,
    options: &FeishuSendOptions,
) -> FeishuSendResult {
    let account = resolve_feishu_account(config, env, options.account_id.as_deref());
    if !account.is_configured() {
        return FeishuSendResult::failure(UNCONFIGURED_ERROR);
    }

    let client = match build_dispatch_client(&account, &options.api_base) {
        Ok(client) => client,
        Err(error) => return FeishuSendResult::failure(error),
    };
    let content = build_message_content(options.message_type, text);
    let receive_id_type = infer_receive_id_type(to);
    match client
        .send_message(to, &content, receive_id_type, options.message_type.as_str())
        .await
    {
        Ok(response) => vendor_response_to_result(response),
        Err(error) => FeishuSendResult::failure(error.to_string()),
    }
}

/// Replies to an existing vendor message id with the same payload rules as
/// [`send_feishu_message`].
pub async fn reply_feishu_message(
    config: &FeishuChannelConfig,
    env: &FeishuEnvCredentials,
    message_id: &str,
    text: &str,
    options: &FeishuSendOptions,
) -> FeishuSendResult {
    let account = resolve_feishu_account(config, env, options.account_id.as_deref());
    if !account.is_configured() {
        return FeishuSendResult::failure(UNCONFIGURED_ERROR);
    }

    let client = match build_dispatch_client(&account, &options.api_base) {
        Ok(client) => client,
        Err(error) => return FeishuSendResult::failure(error),
    };
    let content = build_message_content(options.message_type, text);
    match client
        .reply_message(message_id, &content, options.message_type.as_str())
        .await
    {
        Ok(response) => vendor_response_to_result(response),
        Err(error) => FeishuSendResult::failure(error.to_string()),
    }
}

/// Sends a media reference as rich text: optional caption line plus a
/// hyperlink block. Media is linked, never re-hosted.
pub async fn send_feishu_media(
    config: &FeishuChannelConfig,
    env: &FeishuEnvCredentials,
    to: &str,
    media_url: &str,
    text: &str,
    options: &FeishuSendOptions,
) -> FeishuSendResult {
    let account = resolve_feishu_account(config, env, options.account_id.as_deref());
    if !account.is_configured() {
        return FeishuSendResult::failure(UNCONFIGURED_ERROR);
    }

    let client = match build_dispatch_client(&account, &options.api_base) {
        Ok(client) => client,
        Err(error) => return FeishuSendResult::failure(error),
    };
    let content = build_media_content(media_url, text);
    let receive_id_type = infer_receive_id_type(to);
    match client
        .send_message(to, &content, receive_id_type, FeishuMessageType::Post.as_str())
        .await
    {
        Ok(response) => vendor_response_to_result(response),
        Err(error) => FeishuSendResult::failure(error.to_string()),
    }
}

/// Chunks `text` at the account's effective chunk limit and sends each chunk
/// in order, stopping after the first failed delivery.
pub async fn deliver_feishu_text(
    config: &FeishuChannelConfig,
    env: &FeishuEnvCredentials,
    to: &str,
    text: &str,
    options: &FeishuSendOptions,
) -> Vec<FeishuSendResult> {
    let account = resolve_feishu_account(config, env, options.account_id.as_deref());
    let limit = account.config.effective_text_chunk_limit();
    let chunks = chunk_feishu_text(text, limit);

    let mut results = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let result = send_feishu_message(config, env, to, &chunk, options).await;
        let failed = !result.ok;
        results.push(result);
        if failed {
            break;
        }
    }
    results
}
