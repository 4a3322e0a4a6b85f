//! # 外部错误到 `ProxyError` 的自动转换

use super::ProxyError;

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::io("文件操作失败", err)
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("JSON处理失败", err)
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        Self::config_with_source("TOML解析失败", err)
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        Self::upstream_transport("上游请求失败", err)
    }
}

impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        Self::config_with_source("URL解析失败", err)
    }
}

impl From<tokio::task::JoinError> for ProxyError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::internal_with_source("后台任务异常退出", err)
    }
}
