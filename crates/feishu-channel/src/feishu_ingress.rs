//! Inbound webhook event parsing and normalization.
//!
//! Vendor events are converted into a transport-neutral envelope before
//! being handed to the caller's delivery sink. Verification challenges are
//! echoed immediately, application-originated messages are dropped silently
//! to prevent self-loops, and delivery runs detached from the webhook
//! acknowledgment so sink failures can only be observed in logs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::feishu_accounts::ResolvedFeishuAccount;

pub const FEISHU_CHANNEL_TAG: &str = "feishu";
pub const FEISHU_MESSAGE_RECEIVE_EVENT: &str = "im.message.receive_v1";
pub const DEFAULT_EVENT_DEDUPE_CAP: usize = 128;

#[derive(Debug, Clone, Default, Deserialize)]
/// Raw webhook envelope as posted by the vendor.
pub struct FeishuWebhookEvent {
    #[serde(default)]
    pub header: Option<FeishuEventHeader>,
    #[serde(default)]
    pub event: Option<FeishuEventBody>,
    #[serde(default)]
    pub challenge: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeishuEventHeader {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub tenant_key: String,
    #[serde(default)]
    pub app_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeishuEventBody {
    #[serde(default)]
    pub message: Option<FeishuIncomingMessage>,
    #[serde(default)]
    pub sender: Option<FeishuEventSender>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeishuEventSender {
    #[serde(default)]
    pub sender_id: Option<FeishuSenderId>,
    #[serde(default)]
    pub sender_type: String,
    #[serde(default)]
    pub tenant_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeishuSenderId {
    #[serde(default)]
    pub open_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub union_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
/// Message payload inside a `im.message.receive_v1` event. `content` is a
/// JSON-encoded string per the vendor contract.
pub struct FeishuIncomingMessage {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub sender: Option<FeishuEventSender>,
    #[serde(default)]
    pub chat_type: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub mentions: Vec<FeishuMentionRef>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub root_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeishuMentionRef {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub id: Option<FeishuSenderId>,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeishuChatType {
    Direct,
    Group,
}

impl FeishuChatType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeishuMention {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Canonical, vendor-agnostic view of one inbound message. Produced per
/// event and handed to the delivery sink; never retained.
pub struct FeishuInboundEnvelope {
    pub body: String,
    pub sender_id: String,
    pub target_id: String,
    pub channel: String,
    pub channel_account: String,
    pub message_id: String,
    pub chat_type: FeishuChatType,
    pub parent_id: Option<String>,
    pub mentions: Vec<FeishuMention>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// HTTP-facing outcome of one webhook invocation.
pub struct FeishuWebhookOutcome {
    pub challenge: Option<String>,
    pub handled: bool,
}

/// Destination for normalized envelopes, owned by the host.
#[async_trait]
pub trait FeishuInboundSink: Send + Sync {
    async fn deliver(&self, envelope: FeishuInboundEnvelope) -> Result<()>;
}

#[derive(Debug)]
/// Bounded window of recently seen event keys so redelivered webhooks are
/// acknowledged without reaching the sink twice.
pub struct FeishuEventDeduper {
    cap: usize,
    seen: Mutex<VecDeque<String>>,
}

impl FeishuEventDeduper {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            seen: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns true when `key` was already observed; records it otherwise,
    /// evicting the oldest entries past the cap.
    pub fn check_and_record(&self, key: &str) -> bool {
        let mut seen = self.seen.lock().expect("event dedupe lock poisoned");
        if seen.iter().any(|existing| existing == key) {
            return true;
        }
        seen.push_back(key.to_string());
        while seen.len() > self.cap {
            seen.pop_front();
        }
        false
    }
}

impl Default for FeishuEventDeduper {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_DEDUPE_CAP)
    }
}

/// Parses a raw webhook body.
pub fn parse_feishu_webhook_event(raw: &str) -> Result<FeishuWebhookEvent> {
    serde_json::from_str(raw).context("failed to parse feishu webhook event")
}

/// Handles one webhook event.
///
/// Challenge events are echoed back without touching the sink. Received
/// messages are normalized and delivered on a detached task; a sink failure
/// is logged and never reaches the webhook response. Any other event type is
/// reported as unhandled.
pub fn handle_feishu_webhook(
    event: &FeishuWebhookEvent,
    account: &ResolvedFeishuAccount,
    sink: Arc<dyn FeishuInboundSink>,
    deduper: Option<&FeishuEventDeduper>,
) -> FeishuWebhookOutcome {
    if let Some(challenge) = event.challenge.as_deref().filter(|value| !value.is_empty()) {
        return FeishuWebhookOutcome {
            challenge: Some(challenge.to_string()),
            handled: true,
        };
    }

    let event_type = event
        .header
        .as_ref()
        .map(|header| header.event_type.as_str())
        .unwrap_or_default();
    let message = event.event.as_ref().and_then(|body| body.message.as_ref());

    if event_type == FEISHU_MESSAGE_RECEIVE_EVENT {
        if let Some(message) = message {
            if let Some(deduper) = deduper {
                if !message.message_id.is_empty()
                    && deduper.check_and_record(&message.message_id)
                {
                    return FeishuWebhookOutcome {
                        challenge: None,
                        handled: true,
                    };
                }
            }
            if let Some(envelope) = normalize_feishu_message(message, account) {
                let message_id = envelope.message_id.clone();
                tokio::spawn(async move {
                    if let Err(error) = sink.deliver(envelope).await {
                        tracing::warn!(
                            message_id = %message_id,
                            error = %error,
                            "failed to deliver inbound feishu message"
                        );
                    }
                });
            }
            return FeishuWebhookOutcome {
                challenge: None,
                handled: true,
            };
        }
    }

    FeishuWebhookOutcome {
        challenge: None,
        handled: false,
    }
}

/// Normalizes a vendor message into the canonical envelope.
///
/// Returns `None` for application-originated messages (self-loop guard).
/// Message content that is not valid JSON is treated as the plain-text body.
pub fn normalize_feishu_message(
    message: &FeishuIncomingMessage,
    account: &ResolvedFeishuAccount,
) -> Option<FeishuInboundEnvelope> {
    let sender_type = message
        .sender
        .as_ref()
        .map(|sender| sender.sender_type.as_str())
        .unwrap_or_default();
    if sender_type == "app" {
        return None;
    }

    let body = match serde_json::from_str::<Value>(&message.content) {
        Ok(parsed) => parsed
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Err(_) => message.content.clone(),
    };

    let sender_id = message
        .sender
        .as_ref()
        .and_then(|sender| sender.sender_id.as_ref())
        .map(|sender_id| sender_id.open_id.clone())
        .unwrap_or_default();

    let chat_type = if message.chat_type == "p2p" {
        FeishuChatType::Direct
    } else {
        FeishuChatType::Group
    };

    let mentions = message
        .mentions
        .iter()
        .map(|mention| FeishuMention {
            id: mention
                .id
                .as_ref()
                .map(|id| id.open_id.clone())
                .unwrap_or_default(),
            name: mention.name.clone(),
        })
        .collect();

    Some(FeishuInboundEnvelope {
        body,
        sender_id,
        target_id: message.chat_id.clone(),
        channel: FEISHU_CHANNEL_TAG.to_string(),
        channel_account: format!("{}:{}", FEISHU_CHANNEL_TAG, account.account_id),
        message_id: message.message_id.clone(),
        chat_type,
        parent_id: message.parent_id.clone().filter(|id| !id.is_empty()),
        mentions,
    })
}

/// Webhook mount path for an account: a custom configured path verbatim, or
/// the per-account default pattern.
pub fn feishu_webhook_path(account_id: &str, custom_path: Option<&str>) -> String {
    if let Some(path) = custom_path.map(str::trim).filter(|path| !path.is_empty()) {
        return path.to_string();
    }
    format!("/feishu-webhook/{account_id}")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::feishu_accounts::{
        parse_feishu_channel_config, resolve_feishu_account, FeishuEnvCredentials,
    };

    struct RecordingSink {
        tx: mpsc::UnboundedSender<FeishuInboundEnvelope>,
    }

    #[async_trait]
    impl FeishuInboundSink for RecordingSink {
        async fn deliver(&self, envelope: FeishuInboundEnvelope) -> Result<()> {
            self.tx.send(envelope).ok();
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl FeishuInboundSink for FailingSink {
        async fn deliver(&self, _envelope: FeishuInboundEnvelope) -> Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    fn test_account() -> ResolvedFeishuAccount {
        let config = parse_feishu_channel_config(r#"{ "appId": "cli_a", "appSecret": "s" }"#)
            .expect("config");
        resolve_feishu_account(&config, &FeishuEnvCredentials::default(), None)
    }

    fn recording_sink() -> (
        Arc<dyn FeishuInboundSink>,
        mpsc::UnboundedReceiver<FeishuInboundEnvelope>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingSink { tx }), rx)
    }

    fn message_event(message: Value) -> FeishuWebhookEvent {
        serde_json::from_value(json!({
            "header": { "event_type": FEISHU_MESSAGE_RECEIVE_EVENT, "event_id": "evt-1" },
            "event": { "message": message },
        }))
        .expect("event should deserialize")
    }

    fn user_message(message_id: &str, content: &str) -> Value {
        json!({
            "message_id": message_id,
            "chat_id": "oc_chat",
            "chat_type": "p2p",
            "content": content,
            "sender": {
                "sender_type": "user",
                "sender_id": { "open_id": "ou_sender" },
            },
        })
    }

    async fn expect_delivery(
        rx: &mut mpsc::UnboundedReceiver<FeishuInboundEnvelope>,
    ) -> FeishuInboundEnvelope {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery should not time out")
            .expect("sink channel should stay open")
    }

    #[tokio::test]
    async fn unit_challenge_event_is_echoed_without_delivery() {
        let (sink, mut rx) = recording_sink();
        let event: FeishuWebhookEvent =
            serde_json::from_value(json!({ "challenge": "abc" })).expect("event");

        let outcome = handle_feishu_webhook(&event, &test_account(), sink, None);

        assert_eq!(outcome.challenge.as_deref(), Some("abc"));
        assert!(outcome.handled);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unit_unknown_event_type_is_unhandled() {
        let (sink, _rx) = recording_sink();
        let event: FeishuWebhookEvent = serde_json::from_value(json!({
            "header": { "event_type": "im.chat.updated_v1" },
            "event": {},
        }))
        .expect("event");

        let outcome = handle_feishu_webhook(&event, &test_account(), sink, None);
        assert!(!outcome.handled);
        assert!(outcome.challenge.is_none());
    }

    #[tokio::test]
    async fn functional_received_message_is_normalized_and_delivered() {
        let (sink, mut rx) = recording_sink();
        let event = message_event(user_message("om_1", r#"{"text":"hello there"}"#));

        let outcome = handle_feishu_webhook(&event, &test_account(), sink, None);
        assert!(outcome.handled);

        let envelope = expect_delivery(&mut rx).await;
        assert_eq!(envelope.body, "hello there");
        assert_eq!(envelope.sender_id, "ou_sender");
        assert_eq!(envelope.target_id, "oc_chat");
        assert_eq!(envelope.channel, FEISHU_CHANNEL_TAG);
        assert_eq!(envelope.channel_account, "feishu:default");
        assert_eq!(envelope.chat_type, FeishuChatType::Direct);
    }

    #[tokio::test]
    async fn functional_app_sender_is_dropped_silently() {
        let (sink, mut rx) = recording_sink();
        let mut message = user_message("om_2", r#"{"text":"echo"}"#);
        message["sender"]["sender_type"] = json!("app");
        let event = message_event(message);

        let outcome = handle_feishu_webhook(&event, &test_account(), sink, None);

        // Still acknowledged as handled; the drop is silent.
        assert!(outcome.handled);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn functional_duplicate_message_id_reaches_sink_once() {
        let (sink, mut rx) = recording_sink();
        let deduper = FeishuEventDeduper::default();
        let event = message_event(user_message("om_dup", r#"{"text":"hi"}"#));

        let first =
            handle_feishu_webhook(&event, &test_account(), Arc::clone(&sink), Some(&deduper));
        let second = handle_feishu_webhook(&event, &test_account(), sink, Some(&deduper));

        assert!(first.handled);
        assert!(second.handled);
        expect_delivery(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn functional_sink_failure_never_reaches_the_webhook_outcome() {
        let event = message_event(user_message("om_3", r#"{"text":"boom"}"#));
        let outcome = handle_feishu_webhook(&event, &test_account(), Arc::new(FailingSink), None);
        assert!(outcome.handled);
        // Give the detached task a chance to run; its failure is only logged.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn unit_non_json_content_falls_back_to_raw_body() {
        let message: FeishuIncomingMessage =
            serde_json::from_value(user_message("om_4", "just plain text")).expect("message");
        let envelope =
            normalize_feishu_message(&message, &test_account()).expect("envelope");
        assert_eq!(envelope.body, "just plain text");
    }

    #[test]
    fn unit_json_content_without_text_field_yields_empty_body() {
        let message: FeishuIncomingMessage =
            serde_json::from_value(user_message("om_5", r#"{"image_key":"img_x"}"#))
                .expect("message");
        let envelope =
            normalize_feishu_message(&message, &test_account()).expect("envelope");
        assert_eq!(envelope.body, "");
    }

    #[test]
    fn unit_group_message_carries_thread_and_mentions() {
        let mut raw = user_message("om_6", r#"{"text":"@bot ping"}"#);
        raw["chat_type"] = json!("group");
        raw["parent_id"] = json!("om_parent");
        raw["mentions"] = json!([
            { "key": "@_user_1", "id": { "open_id": "ou_bot" }, "name": "Helper" },
        ]);
        let message: FeishuIncomingMessage = serde_json::from_value(raw).expect("message");

        let envelope =
            normalize_feishu_message(&message, &test_account()).expect("envelope");
        assert_eq!(envelope.chat_type, FeishuChatType::Group);
        assert_eq!(envelope.parent_id.as_deref(), Some("om_parent"));
        assert_eq!(
            envelope.mentions,
            vec![FeishuMention {
                id: "ou_bot".to_string(),
                name: "Helper".to_string(),
            }]
        );
    }

    #[test]
    fn unit_event_deduper_evicts_oldest_past_cap() {
        let deduper = FeishuEventDeduper::new(2);
        assert!(!deduper.check_and_record("a"));
        assert!(!deduper.check_and_record("b"));
        assert!(deduper.check_and_record("a"));
        assert!(!deduper.check_and_record("c"));
        // "a" was evicted by "c".
        assert!(!deduper.check_and_record("a"));
    }

    #[test]
    fn unit_webhook_path_default_and_custom() {
        assert_eq!(feishu_webhook_path("default", None), "/feishu-webhook/default");
        assert_eq!(
            feishu_webhook_path("work", Some("/hooks/feishu")),
            "/hooks/feishu"
        );
        assert_eq!(feishu_webhook_path("work", Some("  ")), "/feishu-webhook/work");
    }

    #[test]
    fn unit_parse_webhook_event_rejects_invalid_json() {
        assert!(parse_feishu_webhook_event("not json").is_err());
        assert!(parse_feishu_webhook_event("{}").is_ok());
    }
}
