//! # 应用配置结构定义

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{ProxyError, Result};

/// 默认监听地址
pub const DEFAULT_PROXY_LISTEN: &str = "127.0.0.1:54123";
/// 默认挂载路径
pub const DEFAULT_PROXY_BASE_PATH: &str = "/kmi-rotor/v1";
/// 默认上游地址
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.kimi.com/coding/v1";
/// 默认状态目录
pub const DEFAULT_STATE_DIR: &str = "~/.kmi";
/// 默认代理令牌头
pub const DEFAULT_PROXY_TOKEN_HEADER: &str = "x-kmi-proxy-token";

const MIB: u64 = 1024 * 1024;

/// 配置文件中内联的密钥条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    /// 展示用标签
    pub label: String,
    /// 凭据
    pub secret: String,
    /// 优先级，越大越靠前
    #[serde(default)]
    pub priority: i64,
    /// 是否禁用
    #[serde(default)]
    pub disabled: bool,
}

/// 应用主配置结构
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 代理监听地址 `host:port`
    pub proxy_listen: String,
    /// 代理挂载路径
    pub proxy_base_path: String,
    /// 上游基础地址
    pub upstream_base_url: String,
    /// 上游主机白名单，支持 `*.suffix`
    pub upstream_allowlist: Vec<String>,
    /// 状态目录
    pub state_dir: PathBuf,
    /// 演练模式，不访问上游
    pub dry_run: bool,
    /// 是否允许自动轮换
    pub auto_rotate_allowed: bool,
    /// 默认耗尽冷却（秒）
    pub rotation_cooldown_seconds: u64,
    /// 手动轮换时并列最佳是否前进
    pub rotate_on_tie: bool,
    /// 是否允许非本地监听
    pub proxy_allow_remote: bool,
    /// 代理访问令牌，空表示不校验
    pub proxy_token: String,
    /// 令牌备用请求头
    pub proxy_token_header: String,
    /// 远程监听时是否要求 TLS
    pub proxy_require_tls: bool,
    /// 前置代理是否已终止 TLS
    pub proxy_tls_terminated: bool,
    /// 全局每秒上限
    pub proxy_max_rps: u32,
    /// 全局每分钟上限
    pub proxy_max_rpm: u32,
    /// 单密钥每秒上限
    pub proxy_max_rps_per_key: u32,
    /// 单密钥每分钟上限
    pub proxy_max_rpm_per_key: u32,
    /// 最大重试次数
    pub proxy_retry_max: u32,
    /// 重试退避基数（毫秒）
    pub proxy_retry_base_ms: u64,
    /// 上游请求超时（秒）
    pub upstream_timeout_seconds: u64,
    /// 请求前要求用量数据正常
    pub require_usage_before_request: bool,
    /// 用量缓存为空时放行
    pub fail_open_on_empty_cache: bool,
    /// 健康缓存 TTL（秒），0 关闭后台刷新
    pub usage_cache_seconds: u64,
    /// 封禁复查周期（秒）
    pub blocklist_recheck_seconds: u64,
    /// 每轮最多复查的封禁密钥数
    pub blocklist_recheck_max: usize,
    /// 付费失败封禁时长（秒），0 表示无限期
    pub payment_block_seconds: u64,
    /// 追踪文件轮转阈值（字节）
    pub trace_max_bytes: u64,
    /// 追踪文件备份数
    pub trace_max_backups: usize,
    /// 追踪队列容量
    pub trace_queue_capacity: usize,
    /// 状态写入防抖（毫秒）
    pub state_debounce_ms: u64,
    /// 追踪展示时区
    pub time_zone: String,
    /// 日志级别
    pub log_level: String,
    /// 内联密钥
    pub keys: Vec<KeyEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy_listen: DEFAULT_PROXY_LISTEN.to_string(),
            proxy_base_path: DEFAULT_PROXY_BASE_PATH.to_string(),
            upstream_base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            upstream_allowlist: Vec::new(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            dry_run: true,
            auto_rotate_allowed: false,
            rotation_cooldown_seconds: 300,
            rotate_on_tie: true,
            proxy_allow_remote: false,
            proxy_token: String::new(),
            proxy_token_header: DEFAULT_PROXY_TOKEN_HEADER.to_string(),
            proxy_require_tls: true,
            proxy_tls_terminated: false,
            proxy_max_rps: 0,
            proxy_max_rpm: 0,
            proxy_max_rps_per_key: 0,
            proxy_max_rpm_per_key: 0,
            proxy_retry_max: 0,
            proxy_retry_base_ms: 250,
            upstream_timeout_seconds: 30,
            require_usage_before_request: false,
            fail_open_on_empty_cache: true,
            usage_cache_seconds: 600,
            blocklist_recheck_seconds: 3600,
            blocklist_recheck_max: 3,
            payment_block_seconds: 7 * 24 * 3600,
            trace_max_bytes: 5 * MIB,
            trace_max_backups: 3,
            trace_queue_capacity: 1000,
            state_debounce_ms: 50,
            time_zone: "local".to_string(),
            log_level: "info".to_string(),
            keys: Vec::new(),
        }
    }
}

impl AppConfig {
    /// 解析 MiB 数值为字节
    #[must_use]
    pub const fn mib_to_bytes(mib: u64) -> u64 {
        mib * MIB
    }

    /// 展开 `~` 后的状态目录
    #[must_use]
    pub fn resolved_state_dir(&self) -> PathBuf {
        expand_home(&self.state_dir)
    }

    /// 状态文件路径
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.resolved_state_dir().join("state.json")
    }

    /// 追踪文件路径
    #[must_use]
    pub fn trace_path(&self) -> PathBuf {
        self.resolved_state_dir().join("trace").join("trace.jsonl")
    }

    /// 解析监听地址为 `(host, port)`
    pub fn listen_parts(&self) -> Result<(String, u16)> {
        parse_listen(&self.proxy_listen)
    }

    /// 客户端访问代理的基础地址
    pub fn proxy_base_url(&self) -> Result<String> {
        let (host, port) = self.listen_parts()?;
        let host = if host == "0.0.0.0" || host == "::" {
            "127.0.0.1".to_string()
        } else {
            host
        };
        let scheme = if self.proxy_tls_terminated { "https" } else { "http" };
        Ok(format!("{scheme}://{host}:{port}{}", self.proxy_base_path))
    }

    /// 验证配置的有效性
    pub fn validate(&mut self) -> Result<()> {
        crate::ensure_config!(
            !self.proxy_listen.trim().is_empty(),
            "KMI_PROXY_LISTEN must not be empty"
        );
        self.listen_parts()?;
        self.proxy_base_path = normalize_base_path(&self.proxy_base_path)?;
        self.upstream_allowlist = self
            .upstream_allowlist
            .iter()
            .map(|item| item.trim().to_lowercase())
            .filter(|item| !item.is_empty())
            .collect();
        self.upstream_base_url = validate_base_url(
            "KMI_UPSTREAM_BASE_URL",
            &self.upstream_base_url,
            &self.upstream_allowlist,
        )?;
        crate::ensure_config!(
            !self.proxy_token_header.trim().is_empty(),
            "proxy_token_header must not be empty"
        );
        crate::ensure_config!(
            self.upstream_timeout_seconds > 0,
            "upstream_timeout_seconds must be greater than 0"
        );
        crate::ensure_config!(
            self.trace_queue_capacity > 0,
            "trace_queue_capacity must be greater than 0"
        );
        Ok(())
    }

    /// 校验监听策略：非本地地址需要显式允许、令牌以及 TLS
    pub fn ensure_bind_allowed(&self) -> Result<()> {
        let (host, _) = self.listen_parts()?;
        if is_local_host(&host) {
            return Ok(());
        }
        if !self.proxy_allow_remote {
            return Err(ProxyError::config(format!(
                "Refusing to bind {host}: set KMI_PROXY_ALLOW_REMOTE=1 to expose the proxy"
            )));
        }
        if self.proxy_token.is_empty() {
            return Err(ProxyError::config(
                "KMI_PROXY_TOKEN is required when binding to a non-local address",
            ));
        }
        if self.proxy_require_tls && !self.proxy_tls_terminated {
            return Err(ProxyError::config(
                "Remote proxy requires TLS termination: set KMI_PROXY_TLS_TERMINATED=1 behind a TLS proxy or KMI_PROXY_REQUIRE_TLS=0",
            ));
        }
        Ok(())
    }
}

/// 解析 `host:port`，支持 `[::1]:port`
pub fn parse_listen(value: &str) -> Result<(String, u16)> {
    let value = value.trim();
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::config(format!("Invalid listen address: {value}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ProxyError::config(format!("Invalid listen address: {value}")));
    }
    let port = port
        .parse::<u16>()
        .map_err(|e| ProxyError::config_with_source(format!("Invalid listen port: {value}"), e))?;
    Ok((host.to_string(), port))
}

/// 是否为回环地址
#[must_use]
pub fn is_local_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

/// 规范化挂载路径
pub fn normalize_base_path(value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ProxyError::config("KMI_PROXY_BASE_PATH must not be empty"));
    }
    if !value.starts_with('/') {
        return Err(ProxyError::config("KMI_PROXY_BASE_PATH must start with '/'"));
    }
    let trimmed = value.trim_end_matches('/');
    Ok(if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    })
}

/// 主机是否命中白名单；空白名单全部放行
#[must_use]
pub fn host_allowed(host: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    let host = host.to_lowercase();
    allowlist.iter().any(|entry| {
        let entry = entry.to_lowercase();
        entry
            .strip_prefix('*')
            .filter(|suffix| suffix.starts_with('.'))
            .map_or(host == entry, |suffix| host.ends_with(suffix))
    })
}

/// 校验上游基础地址：必须 https、带主机且命中白名单
pub fn validate_base_url(name: &str, value: &str, allowlist: &[String]) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ProxyError::config(format!("{name} must not be empty")));
    }
    let parsed = Url::parse(value)
        .map_err(|e| ProxyError::config_with_source(format!("{name} is not a valid URL"), e))?;
    if !parsed.scheme().eq_ignore_ascii_case("https") {
        return Err(ProxyError::config(format!("{name} must use https://")));
    }
    let host = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ProxyError::config(format!("{name} must include a host")))?;
    if !host_allowed(host, allowlist) {
        return Err(ProxyError::config(format!(
            "{name} host '{host}' is not in KMI_UPSTREAM_ALLOWLIST"
        )));
    }
    Ok(value.trim_end_matches('/').to_string())
}

/// 展开路径开头的 `~`
#[must_use]
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map_or_else(|| path.to_path_buf(), |home| PathBuf::from(home).join(rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.proxy_listen, "127.0.0.1:54123");
        assert_eq!(config.proxy_base_path, "/kmi-rotor/v1");
        assert!(config.dry_run);
        assert_eq!(config.trace_max_bytes, 5 * 1024 * 1024);
        assert_eq!(config.payment_block_seconds, 604_800);
    }

    #[test]
    fn base_path_normalization() {
        assert_eq!(normalize_base_path("/kmi/v1/").unwrap(), "/kmi/v1");
        assert_eq!(normalize_base_path("/").unwrap(), "/");
        assert!(normalize_base_path("kmi").is_err());
        assert!(normalize_base_path("  ").is_err());
    }

    #[test]
    fn base_url_requires_https_and_allowlist() {
        let allow = vec!["*.kimi.com".to_string()];
        assert_eq!(
            validate_base_url("X", "https://api.kimi.com/coding/v1/", &allow).unwrap(),
            "https://api.kimi.com/coding/v1"
        );
        assert!(validate_base_url("X", "http://api.kimi.com", &allow).is_err());
        assert!(validate_base_url("X", "https://evil.example", &allow).is_err());
        assert!(validate_base_url("X", "https://evil.example", &[]).is_ok());
    }

    #[test]
    fn listen_parsing_and_locality() {
        assert_eq!(parse_listen("127.0.0.1:8080").unwrap(), ("127.0.0.1".to_string(), 8080));
        assert_eq!(parse_listen("[::1]:9000").unwrap(), ("::1".to_string(), 9000));
        assert!(parse_listen("localhost").is_err());
        assert!(is_local_host("localhost"));
        assert!(is_local_host("::1"));
        assert!(!is_local_host("0.0.0.0"));
    }

    #[test]
    fn remote_bind_policy() {
        let mut config = AppConfig {
            proxy_listen: "0.0.0.0:54123".to_string(),
            ..AppConfig::default()
        };
        assert!(config.ensure_bind_allowed().is_err());

        config.proxy_allow_remote = true;
        assert!(config.ensure_bind_allowed().is_err());

        config.proxy_token = "secret".to_string();
        assert!(config.ensure_bind_allowed().is_err());

        config.proxy_tls_terminated = true;
        assert!(config.ensure_bind_allowed().is_ok());
        assert_eq!(
            config.proxy_base_url().unwrap(),
            "https://127.0.0.1:54123/kmi-rotor/v1"
        );
    }

    #[test]
    fn inline_keys_deserialize_with_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            dry_run = false
            [[keys]]
            label = "alpha"
            secret = "sk-alpha"
            [[keys]]
            label = "beta"
            secret = "sk-beta"
            priority = 5
            disabled = true
            "#,
        )
        .unwrap();
        assert!(!config.dry_run);
        assert_eq!(config.keys.len(), 2);
        assert_eq!(config.keys[0].priority, 0);
        assert!(config.keys[1].disabled);
        assert_eq!(config.proxy_retry_base_ms, 250);
    }
}
