//! # 代理服务模块
//!
//! 认证、限流、密钥选择、转发重试与响应分类。

pub mod classify;
pub mod context;
pub mod handler;
pub mod headers;
pub mod prompt;
pub mod rate_limit;
pub mod retry_policy;
pub mod server;
pub mod upstream_url;

pub use classify::{REMEDIATION_MESSAGE, extract_error_hint, looks_like_payment_error, status_hint};
pub use context::{ProxyContext, build_upstream_client};
pub use handler::{RelayStream, handle_request};
pub use headers::{authorize, build_upstream_headers, filter_hop_by_hop};
pub use prompt::{PromptPreview, extract_prompt_preview};
pub use rate_limit::{KeyedRateLimiter, SlidingWindowLimiter};
pub use retry_policy::{RetryDecision, RetryPolicy, parse_retry_after};
pub use server::{ProxyServer, build_router};
pub use upstream_url::build_upstream_url;
