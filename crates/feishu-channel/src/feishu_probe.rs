//! Credential health probing against the bot-identity endpoint.
//!
//! A probe is a bounded-time liveness check for one credential pair. It
//! never raises: blank credentials, vendor rejections, transport failures,
//! and timeouts are all reported through the result, with timeouts
//! classified distinctly from other network errors.

use serde::Serialize;

use crate::feishu_accounts::ResolvedFeishuAccount;
use crate::feishu_api::{FeishuApiClient, FeishuApiClientConfig, FEISHU_API_BASE};

pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeishuBotIdentity {
    pub name: String,
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Snapshot of one credential health check.
pub struct FeishuProbeResult {
    pub ok: bool,
    pub bot: Option<FeishuBotIdentity>,
    pub error: Option<String>,
}

impl FeishuProbeResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            bot: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeishuStatusIssueLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeishuStatusIssue {
    pub level: FeishuStatusIssueLevel,
    pub message: String,
}

/// Probes the production API.
pub async fn probe_feishu(app_id: &str, app_secret: &str, timeout_ms: u64) -> FeishuProbeResult {
    probe_feishu_at(FEISHU_API_BASE, app_id, app_secret, timeout_ms).await
}

/// Probes an explicit API base; the seam tests use to target a mock server.
pub async fn probe_feishu_at(
    api_base: &str,
    app_id: &str,
    app_secret: &str,
    timeout_ms: u64,
) -> FeishuProbeResult {
    if app_id.trim().is_empty() || app_secret.trim().is_empty() {
        return FeishuProbeResult::failure("App ID or App Secret not configured");
    }

    let config = FeishuApiClientConfig::new(app_id, app_secret)
        .with_api_base(api_base)
        .with_http_timeout_ms(timeout_ms.max(1));
    let client = match FeishuApiClient::new(config) {
        Ok(client) => client,
        Err(error) => return FeishuProbeResult::failure(error.to_string()),
    };

    let response = match client.get_bot_info().await {
        Ok(response) => response,
        Err(error) if error.is_timeout() => return FeishuProbeResult::failure("Probe timed out"),
        Err(error) => return FeishuProbeResult::failure(error.to_string()),
    };

    if response.code != 0 {
        return FeishuProbeResult::failure(format!(
            "Feishu API error: {} (code: {})",
            response.msg, response.code
        ));
    }
    let Some(bot) = response.bot else {
        return FeishuProbeResult::failure("No bot info in response");
    };

    FeishuProbeResult {
        ok: true,
        bot: Some(FeishuBotIdentity {
            name: bot.app_name,
            id: bot.open_id,
            status: if bot.activate_status == Some(1) {
                "active"
            } else {
                "inactive"
            }
            .to_string(),
        }),
        error: None,
    }
}

/// Collects configuration problems worth surfacing in a status view.
pub fn collect_feishu_status_issues(account: &ResolvedFeishuAccount) -> Vec<FeishuStatusIssue> {
    let mut issues = Vec::new();
    if account.app_id.trim().is_empty() {
        issues.push(FeishuStatusIssue {
            level: FeishuStatusIssueLevel::Error,
            message: "Feishu app ID not configured".to_string(),
        });
    }
    if account.app_secret.trim().is_empty() {
        issues.push(FeishuStatusIssue {
            level: FeishuStatusIssueLevel::Error,
            message: "Feishu app secret not configured".to_string(),
        });
    }
    issues
}
