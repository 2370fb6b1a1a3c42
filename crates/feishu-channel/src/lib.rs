//! Feishu (Lark) channel integration core.
//!
//! Provides multi-tenant account and credential resolution, a
//! tenant-access-token caching API client, outbound text/rich-text dispatch
//! with boundary-aware chunking, inbound webhook normalization, and
//! credential health probing.
//!
//! ```rust
//! # fn main() -> anyhow::Result<()> {
//! use feishu_channel::{
//!     chunk_feishu_text, parse_feishu_channel_config, resolve_feishu_account,
//!     FeishuEnvCredentials, FeishuTokenSource,
//! };
//!
//! let config = parse_feishu_channel_config(
//!     r#"{ "appId": "cli_a1", "appSecret": "s1", "textChunkLimit": 2000 }"#,
//! )?;
//! let env = FeishuEnvCredentials::default();
//!
//! let account = resolve_feishu_account(&config, &env, None);
//! assert_eq!(account.token_source, FeishuTokenSource::Config);
//! assert!(account.is_configured());
//!
//! let chunks = chunk_feishu_text("first line\nsecond line", 14);
//! assert_eq!(chunks, vec!["first line", "second line"]);
//! # Ok(())
//! # }
//! ```

pub mod feishu_accounts;
pub mod feishu_api;
pub mod feishu_ingress;
pub mod feishu_outbound;
pub mod feishu_probe;

pub use feishu_accounts::*;
pub use feishu_api::*;
pub use feishu_ingress::*;
pub use feishu_outbound::*;
pub use feishu_probe::*;
