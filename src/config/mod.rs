//! # 配置管理模块
//!
//! 处理应用配置加载、验证和管理

mod app_config;
mod manager;

pub use app_config::{
    AppConfig, DEFAULT_PROXY_BASE_PATH, DEFAULT_PROXY_LISTEN, DEFAULT_PROXY_TOKEN_HEADER,
    DEFAULT_STATE_DIR, DEFAULT_UPSTREAM_BASE_URL, KeyEntry, expand_home, host_allowed,
    is_local_host, normalize_base_path, parse_listen, validate_base_url,
};
pub use manager::{ConfigManager, parse_bool};
