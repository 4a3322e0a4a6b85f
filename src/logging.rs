//! # 日志配置模块
//!
//! 提供日志系统初始化，以及带有请求ID、阶段、组件标签的结构化日志宏。
//!
//! 所有结构化事件都通过 `linfo!` / `ldebug!` / `lwarn!` / `lerror!` 输出，
//! 统一携带 `request_id`、`stage`、`component`、`operation` 四个字段：
//!
//! ```ignore
//! linfo!(
//!     "system",
//!     LogStage::Startup,
//!     LogComponent::Main,
//!     "service_starting",
//!     "服务启动",
//!     listen = %addr
//! );
//! ```

use std::env;
use std::fmt;
use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 日志阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStage {
    /// 启动
    Startup,
    /// 关闭
    Shutdown,
    /// 配置加载
    Configuration,
    /// 请求进入
    RequestStart,
    /// 身份验证
    Authentication,
    /// 限流判定
    RateLimit,
    /// 密钥调度
    Scheduling,
    /// 上游请求
    UpstreamRequest,
    /// 响应处理
    Response,
    /// 响应失败
    ResponseFailure,
    /// 健康检查
    HealthCheck,
    /// 后台任务
    BackgroundTask,
    /// 状态持久化
    Persistence,
    /// 内部错误
    Internal,
}

impl LogStage {
    /// 转换为日志字段值
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Configuration => "configuration",
            Self::RequestStart => "request_start",
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Scheduling => "scheduling",
            Self::UpstreamRequest => "upstream_request",
            Self::Response => "response",
            Self::ResponseFailure => "response_failure",
            Self::HealthCheck => "health_check",
            Self::BackgroundTask => "background_task",
            Self::Persistence => "persistence",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for LogStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 日志组件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogComponent {
    /// 主程序
    Main,
    /// 服务装配
    ServerSetup,
    /// 配置
    Config,
    /// 代理管线
    Proxy,
    /// 代理令牌认证
    Auth,
    /// 限流器
    RateLimiter,
    /// 轮换调度
    Scheduler,
    /// 密钥池
    KeyPool,
    /// 健康检查
    HealthChecker,
    /// 状态存储
    StateStore,
    /// 追踪日志
    Tracing,
    /// 上游
    Upstream,
}

impl LogComponent {
    /// 转换为日志字段值
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::ServerSetup => "server_setup",
            Self::Config => "config",
            Self::Proxy => "proxy",
            Self::Auth => "auth",
            Self::RateLimiter => "rate_limiter",
            Self::Scheduler => "scheduler",
            Self::KeyPool => "key_pool",
            Self::HealthChecker => "health_checker",
            Self::StateStore => "state_store",
            Self::Tracing => "tracing",
            Self::Upstream => "upstream",
        }
    }
}

impl fmt::Display for LogComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 结构化 info 日志
#[macro_export]
macro_rules! linfo {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($fields:tt)*)?) => {
        ::tracing::info!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation
            $(, $($fields)*)?,
            "{}",
            $message
        )
    };
}

/// 结构化 debug 日志
#[macro_export]
macro_rules! ldebug {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($fields:tt)*)?) => {
        ::tracing::debug!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation
            $(, $($fields)*)?,
            "{}",
            $message
        )
    };
}

/// 结构化 warn 日志
#[macro_export]
macro_rules! lwarn {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($fields:tt)*)?) => {
        ::tracing::warn!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation
            $(, $($fields)*)?,
            "{}",
            $message
        )
    };
}

/// 结构化 error 日志
#[macro_export]
macro_rules! lerror {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($fields:tt)*)?) => {
        ::tracing::error!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation
            $(, $($fields)*)?,
            "{}",
            $message
        )
    };
}

static LOGGING_INIT: OnceLock<()> = OnceLock::new();

/// 初始化日志系统
///
/// 进程内只生效一次，重复调用直接返回。`RUST_LOG` 优先于传入的级别。
pub fn init_logging(log_level: Option<&str>) {
    LOGGING_INIT.get_or_init(|| {
        let level = log_level.unwrap_or("info");
        let default_filter = format!("{level},kmi_rotor=debug,hyper=warn,reqwest=warn");
        let log_filter = env::var("RUST_LOG").unwrap_or(default_filter);

        let result = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
            .with(
                tracing_fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .compact(),
            )
            .try_init();

        if result.is_ok() {
            tracing::debug!("logging initialized");
        }
    });
}

/// 环境变量设置指南
pub fn print_logging_help() {
    println!("日志配置指南:");
    println!("  RUST_LOG=info                      # 标准日志级别");
    println!("  RUST_LOG=debug                     # 调试级别");
    println!("  RUST_LOG=kmi_rotor=trace           # 应用详细追踪");
    println!("  RUST_LOG=info,reqwest=debug        # 查看上游 HTTP 客户端细节");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_and_component_render_snake_case() {
        assert_eq!(LogStage::ResponseFailure.to_string(), "response_failure");
        assert_eq!(LogComponent::HealthChecker.to_string(), "health_checker");
    }

    #[test]
    fn init_is_idempotent() {
        init_logging(Some("debug"));
        init_logging(Some("info"));
        linfo!("test", LogStage::Startup, LogComponent::Main, "init_twice", "logging ready", attempt = 2);
    }
}
