//! # 健康检查模块
//!
//! 查询上游用量、归一化解析，并为每个密钥计算健康状态

pub mod checker;
pub mod service;
pub mod types;
pub mod usage;

pub use checker::{HttpUsageFetcher, USAGE_FETCH_TIMEOUT, UsageFetcher, build_health_info, score_key};
pub use service::{HealthCache, HealthService};
pub use types::{
    Account, HealthInfo, HealthMap, HealthStatus, LimitInfo, Usage, UsageSource,
};
pub use usage::parse_usage;
