//! Account listing and credential resolution for the Feishu channel.
//!
//! Accounts are resolved from the externally owned configuration section plus
//! process environment on every call, so configuration edits take effect
//! without restarting the channel. Credential precedence is literal config,
//! then credential file, then environment (default account only), with the
//! winning branch recorded as a provenance tag for operator diagnostics.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Reserved id for the unnamed top-level account block.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

pub const FEISHU_APP_ID_ENV: &str = "FEISHU_APP_ID";
pub const FEISHU_APP_SECRET_ENV: &str = "FEISHU_APP_SECRET";

/// Feishu allows up to 4096 characters per text message; keep headroom.
pub const DEFAULT_TEXT_CHUNK_LIMIT: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
/// Direct-message admission policy for an account.
pub enum FeishuDmPolicy {
    Open,
    Allowlist,
    #[default]
    Pairing,
}

impl FeishuDmPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Allowlist => "allowlist",
            Self::Pairing => "pairing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
/// Group-chat admission policy for an account.
pub enum FeishuGroupPolicy {
    Open,
    #[default]
    Allowlist,
}

impl FeishuGroupPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Allowlist => "allowlist",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
/// Allow-list entries may be written as strings or bare numbers in config.
pub enum FeishuAllowFromEntry {
    Id(String),
    Numeric(i64),
}

impl FeishuAllowFromEntry {
    /// Canonical string form with any `feishu:`/`lark:` prefix stripped.
    pub fn normalized(&self) -> String {
        match self {
            Self::Id(raw) => strip_channel_prefix(raw.trim()).to_string(),
            Self::Numeric(raw) => raw.to_string(),
        }
    }
}

fn strip_channel_prefix(raw: &str) -> &str {
    for prefix in ["feishu:", "lark:"] {
        if let Some(head) = raw.get(..prefix.len()) {
            if head.eq_ignore_ascii_case(prefix) {
                return &raw[prefix.len()..];
            }
        }
    }
    raw
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
/// Per-group overrides keyed by chat id (or `"*"` as a wildcard).
pub struct FeishuGroupSettings {
    pub require_mention: Option<bool>,
    pub allow_from: Option<Vec<FeishuAllowFromEntry>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
/// One raw, possibly partial account configuration block. All fields are
/// optional; resolution fills in defaults and provenance.
pub struct FeishuAccountSettings {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    pub app_id_file: Option<String>,
    pub app_secret_file: Option<String>,
    pub encrypt_key: Option<String>,
    pub verification_token: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_path: Option<String>,
    pub dm_policy: Option<FeishuDmPolicy>,
    pub allow_from: Option<Vec<FeishuAllowFromEntry>>,
    pub group_allow_from: Option<Vec<FeishuAllowFromEntry>>,
    pub group_policy: Option<FeishuGroupPolicy>,
    pub text_chunk_limit: Option<usize>,
    pub media_max_mb: Option<f64>,
    pub markdown: Option<bool>,
    pub groups: Option<BTreeMap<String, FeishuGroupSettings>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
/// The whole `channels.feishu` configuration section: a default account
/// block plus an optional map of named sub-accounts.
pub struct FeishuChannelConfig {
    #[serde(flatten)]
    pub base: FeishuAccountSettings,
    pub accounts: Option<BTreeMap<String, FeishuAccountSettings>>,
}

/// Parses a raw JSON configuration section.
pub fn parse_feishu_channel_config(raw: &str) -> Result<FeishuChannelConfig> {
    serde_json::from_str(raw).context("failed to parse feishu channel config")
}

#[derive(Debug, Clone, Default)]
/// Environment-supplied fallback credentials, captured explicitly so callers
/// and tests control when the process environment is consulted.
pub struct FeishuEnvCredentials {
    pub app_id: String,
    pub app_secret: String,
}

impl FeishuEnvCredentials {
    pub fn from_env() -> Self {
        Self {
            app_id: trimmed_env_var(FEISHU_APP_ID_ENV),
            app_secret: trimmed_env_var(FEISHU_APP_SECRET_ENV),
        }
    }
}

fn trimmed_env_var(name: &str) -> String {
    std::env::var(name)
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Provenance of a resolved app id.
pub enum FeishuTokenSource {
    Config,
    File,
    Env,
    None,
}

impl FeishuTokenSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::File => "file",
            Self::Env => "env",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
/// Effective policy and delivery settings for one resolved account.
pub struct FeishuAccountRuntimeConfig {
    pub dm_policy: FeishuDmPolicy,
    pub allow_from: Vec<FeishuAllowFromEntry>,
    pub group_policy: FeishuGroupPolicy,
    pub group_allow_from: Vec<FeishuAllowFromEntry>,
    pub text_chunk_limit: Option<usize>,
    pub media_max_mb: Option<f64>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_path: Option<String>,
    pub encrypt_key: Option<String>,
    pub verification_token: Option<String>,
    pub markdown: Option<bool>,
    pub groups: BTreeMap<String, FeishuGroupSettings>,
}

impl FeishuAccountRuntimeConfig {
    /// Chunk limit with the platform default applied; zero is treated as
    /// unset.
    pub fn effective_text_chunk_limit(&self) -> usize {
        self.text_chunk_limit
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_TEXT_CHUNK_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Fully merged view of one account. Recomputed on every resolution call and
/// never cached.
pub struct ResolvedFeishuAccount {
    pub account_id: String,
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub app_id: String,
    pub app_secret: String,
    pub token_source: FeishuTokenSource,
    pub config: FeishuAccountRuntimeConfig,
}

impl ResolvedFeishuAccount {
    /// An account is usable only when both credentials resolved non-blank.
    pub fn is_configured(&self) -> bool {
        !self.app_id.trim().is_empty() && !self.app_secret.trim().is_empty()
    }

    /// Whether the bot must be @-mentioned in the given group chat.
    /// Falls back to the `"*"` wildcard entry, then to requiring a mention.
    pub fn require_mention(&self, group_id: &str) -> bool {
        if self.config.groups.is_empty() {
            return true;
        }
        self.config
            .groups
            .get(group_id)
            .or_else(|| self.config.groups.get("*"))
            .and_then(|group| group.require_mention)
            .unwrap_or(true)
    }
}

/// Lists configured account ids, lexicographically sorted without
/// duplicates. The default id is listed when the top-level block carries any
/// credential configuration, when the named-accounts map is present but
/// empty, or when the environment supplies an app id.
pub fn list_feishu_account_ids(
    config: &FeishuChannelConfig,
    env: &FeishuEnvCredentials,
) -> Vec<String> {
    let mut account_ids: Vec<String> = Vec::new();

    let has_default_account = non_empty(config.base.app_id.as_deref()).is_some()
        || non_empty(config.base.app_id_file.as_deref()).is_some()
        || config.accounts.as_ref().is_some_and(BTreeMap::is_empty);
    if has_default_account || !env.app_id.is_empty() {
        account_ids.push(DEFAULT_ACCOUNT_ID.to_string());
    }

    if let Some(accounts) = config.accounts.as_ref() {
        for account_id in accounts.keys() {
            if !account_ids.iter().any(|existing| existing == account_id) {
                account_ids.push(account_id.clone());
            }
        }
    }

    account_ids.sort();
    account_ids
}

/// First listed account id, or the default constant when nothing is
/// configured.
pub fn resolve_default_feishu_account_id(
    config: &FeishuChannelConfig,
    env: &FeishuEnvCredentials,
) -> String {
    list_feishu_account_ids(config, env)
        .into_iter()
        .next()
        .unwrap_or_else(|| DEFAULT_ACCOUNT_ID.to_string())
}

/// Field-by-field overlay merge; a field set in `overlay` wins.
pub fn merge_account_settings(
    base: &FeishuAccountSettings,
    overlay: &FeishuAccountSettings,
) -> FeishuAccountSettings {
    FeishuAccountSettings {
        name: overlay.name.clone().or_else(|| base.name.clone()),
        enabled: overlay.enabled.or(base.enabled),
        app_id: overlay.app_id.clone().or_else(|| base.app_id.clone()),
        app_secret: overlay
            .app_secret
            .clone()
            .or_else(|| base.app_secret.clone()),
        app_id_file: overlay
            .app_id_file
            .clone()
            .or_else(|| base.app_id_file.clone()),
        app_secret_file: overlay
            .app_secret_file
            .clone()
            .or_else(|| base.app_secret_file.clone()),
        encrypt_key: overlay
            .encrypt_key
            .clone()
            .or_else(|| base.encrypt_key.clone()),
        verification_token: overlay
            .verification_token
            .clone()
            .or_else(|| base.verification_token.clone()),
        webhook_url: overlay
            .webhook_url
            .clone()
            .or_else(|| base.webhook_url.clone()),
        webhook_secret: overlay
            .webhook_secret
            .clone()
            .or_else(|| base.webhook_secret.clone()),
        webhook_path: overlay
            .webhook_path
            .clone()
            .or_else(|| base.webhook_path.clone()),
        dm_policy: overlay.dm_policy.or(base.dm_policy),
        allow_from: overlay
            .allow_from
            .clone()
            .or_else(|| base.allow_from.clone()),
        group_allow_from: overlay
            .group_allow_from
            .clone()
            .or_else(|| base.group_allow_from.clone()),
        group_policy: overlay.group_policy.or(base.group_policy),
        text_chunk_limit: overlay.text_chunk_limit.or(base.text_chunk_limit),
        media_max_mb: overlay.media_max_mb.or(base.media_max_mb),
        markdown: overlay.markdown.or(base.markdown),
        groups: overlay.groups.clone().or_else(|| base.groups.clone()),
    }
}

/// Resolves one account to its effective credentials and settings.
///
/// A blank or absent `account_id` targets the default account. Named
/// accounts overlay their block on the top-level base block. Credential
/// precedence, evaluated independently for app id and app secret: literal
/// config value, then credential file contents (trimmed; an unreadable or
/// empty file falls through), then environment for the default account only.
pub fn resolve_feishu_account(
    config: &FeishuChannelConfig,
    env: &FeishuEnvCredentials,
    account_id: Option<&str>,
) -> ResolvedFeishuAccount {
    let resolved_account_id = account_id
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_ACCOUNT_ID)
        .to_string();
    let is_default_account = resolved_account_id == DEFAULT_ACCOUNT_ID;

    let overlay = if is_default_account {
        None
    } else {
        config
            .accounts
            .as_ref()
            .and_then(|accounts| accounts.get(&resolved_account_id))
    };
    let merged = match overlay {
        Some(overlay) => merge_account_settings(&config.base, overlay),
        None => config.base.clone(),
    };

    let (app_id, token_source) = resolve_credential(
        merged.app_id.as_deref(),
        merged.app_id_file.as_deref(),
        is_default_account.then_some(env.app_id.as_str()),
    );
    let (app_secret, _) = resolve_credential(
        merged.app_secret.as_deref(),
        merged.app_secret_file.as_deref(),
        is_default_account.then_some(env.app_secret.as_str()),
    );

    ResolvedFeishuAccount {
        account_id: resolved_account_id,
        name: merged.name,
        enabled: merged.enabled,
        app_id,
        app_secret,
        token_source,
        config: FeishuAccountRuntimeConfig {
            dm_policy: merged.dm_policy.unwrap_or_default(),
            allow_from: merged.allow_from.unwrap_or_default(),
            group_policy: merged.group_policy.unwrap_or_default(),
            group_allow_from: merged.group_allow_from.unwrap_or_default(),
            text_chunk_limit: merged.text_chunk_limit,
            media_max_mb: merged.media_max_mb,
            webhook_url: merged.webhook_url,
            webhook_secret: merged.webhook_secret,
            webhook_path: merged.webhook_path,
            encrypt_key: merged.encrypt_key,
            verification_token: merged.verification_token,
            markdown: merged.markdown,
            groups: merged.groups.unwrap_or_default(),
        },
    }
}

fn resolve_credential(
    literal: Option<&str>,
    file_path: Option<&str>,
    env_value: Option<&str>,
) -> (String, FeishuTokenSource) {
    if let Some(value) = non_empty(literal) {
        return (value.to_string(), FeishuTokenSource::Config);
    }
    if let Some(path) = non_empty(file_path) {
        let value = read_credential_file_or_empty(path);
        if !value.is_empty() {
            return (value, FeishuTokenSource::File);
        }
    }
    if let Some(value) = env_value.filter(|value| !value.is_empty()) {
        return (value.to_string(), FeishuTokenSource::Env);
    }
    (String::new(), FeishuTokenSource::None)
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.filter(|value| !value.is_empty())
}

// Unreadable files resolve to empty so precedence falls through to the next
// source instead of failing resolution.
fn read_credential_file_or_empty(path: &str) -> String {
    std::fs::read_to_string(path)
        .map(|raw| raw.trim().to_string())
        .unwrap_or_default()
}
