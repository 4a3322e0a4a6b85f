//! # 错误类型定义

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// 限流作用域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    /// 全局限流
    Global,
    /// 单个密钥限流
    PerKey,
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::PerKey => f.write_str("per_key"),
        }
    }
}

/// 应用主要错误类型
#[derive(Debug, Error)]
pub enum ProxyError {
    /// 配置相关错误，只在启动阶段出现
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 代理令牌缺失或不匹配
    #[error("认证错误: {message}")]
    AuthRejected { message: String },

    /// 全局或单密钥限流
    #[error("速率限制({scope}): {message}")]
    RateLimited {
        scope: RateLimitScope,
        message: String,
    },

    /// 没有可用密钥
    #[error("无可用密钥: {message}")]
    NoEligibleKey { message: String },

    /// 上游传输失败（重试耗尽）
    #[error("上游传输错误: {message}")]
    UpstreamTransport {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 上游返回错误状态码
    #[error("上游HTTP错误 {status}: {message}")]
    UpstreamHttp { status: u16, message: String },

    /// 状态文件损坏，已隔离
    #[error("状态文件损坏: {}", path.display())]
    StateCorrupted {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// 系统内部错误
    #[error("内部错误: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// IO相关错误
    #[error("IO错误: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// 序列化/反序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// 附加了上下文的错误
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ProxyError>,
    },
}

impl ProxyError {
    /// 将错误转换为HTTP状态码和错误代码
    #[must_use]
    pub fn to_http_response_parts(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Config { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_INVALID"),
            Self::AuthRejected { .. } => (StatusCode::UNAUTHORIZED, "AUTH_REJECTED"),
            Self::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            Self::NoEligibleKey { .. } => (StatusCode::SERVICE_UNAVAILABLE, "NO_ELIGIBLE_KEY"),
            Self::UpstreamTransport { .. } => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
            Self::UpstreamHttp { status, .. } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                "UPSTREAM_HTTP_ERROR",
            ),
            Self::StateCorrupted { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "STATE_CORRUPTED"),
            Self::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            Self::Io { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Self::Serialization { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "SERIALIZATION_ERROR"),
            Self::Context { source, .. } => source.to_http_response_parts(),
        }
    }

    /// 去掉上下文包装后的根错误
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// 面向客户端的 `(error, hint)` 文本
    #[must_use]
    pub fn client_message(&self) -> (String, Option<&'static str>) {
        match self.root() {
            Self::AuthRejected { .. } => (
                "Unauthorized proxy access".to_string(),
                Some("Send Authorization: Bearer <token> or x-kmi-proxy-token header."),
            ),
            Self::RateLimited {
                scope: RateLimitScope::Global,
                ..
            } => ("Proxy rate limit exceeded".to_string(), None),
            Self::RateLimited {
                scope: RateLimitScope::PerKey,
                ..
            } => ("Per-key rate limit exceeded".to_string(), None),
            Self::NoEligibleKey { message } => (message.clone(), None),
            Self::UpstreamTransport { .. } => (
                "Upstream request failed".to_string(),
                Some("Check connectivity or upstream status."),
            ),
            Self::UpstreamHttp { message, .. } => (message.clone(), None),
            other => (other.to_string(), None),
        }
    }

    /// 创建配置错误
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的配置错误
    pub fn config_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建认证错误
    pub fn auth_rejected<T: Into<String>>(message: T) -> Self {
        Self::AuthRejected {
            message: message.into(),
        }
    }

    /// 创建限流错误
    pub fn rate_limited<T: Into<String>>(scope: RateLimitScope, message: T) -> Self {
        Self::RateLimited {
            scope,
            message: message.into(),
        }
    }

    /// 创建无可用密钥错误
    pub fn no_eligible_key<T: Into<String>>(message: T) -> Self {
        Self::NoEligibleKey {
            message: message.into(),
        }
    }

    /// 创建上游传输错误
    pub fn upstream_transport<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::UpstreamTransport {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建上游HTTP错误
    pub fn upstream_http<T: Into<String>>(status: u16, message: T) -> Self {
        Self::UpstreamHttp {
            status,
            message: message.into(),
        }
    }

    /// 创建状态损坏错误
    pub fn state_corrupted<E: Into<anyhow::Error>>(path: impl Into<PathBuf>, source: E) -> Self {
        Self::StateCorrupted {
            path: path.into(),
            source: source.into(),
        }
    }

    /// 创建内部错误
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的内部错误
    pub fn internal_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建IO错误
    pub fn io<T: Into<String>>(message: T, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// 创建序列化错误
    pub fn serialization<T: Into<String>, E: Into<anyhow::Error>>(message: T, source: E) -> Self {
        Self::Serialization {
            message: message.into(),
            source: source.into(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, code) = self.to_http_response_parts();

        // 无可用密钥时直接返回纯文本修复建议
        if let Self::NoEligibleKey { message } = self.root() {
            return (status, message.clone()).into_response();
        }

        let (error, hint) = self.client_message();
        let body = match hint {
            Some(hint) => json!({ "error": error, "hint": hint }),
            None => json!({ "error": error }),
        };

        if self.category() == super::ErrorCategory::Server {
            tracing::debug!(code = code, error = %self, "request failed");
        }

        (status, Json(body)).into_response()
    }
}
