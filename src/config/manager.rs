//! # 配置管理器
//!
//! 统一的配置加载入口：TOML 文件 → `KMI_*` 环境变量覆盖 → 校验

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{AppConfig, KeyEntry};
use crate::error::{ProxyError, Result};

const ENV_PREFIX: &str = "KMI_";

/// 配置管理器
#[derive(Debug, Clone)]
pub struct ConfigManager {
    /// 当前配置
    config: Arc<AppConfig>,
    /// 来源文件
    source_path: Option<PathBuf>,
    /// 生效的环境变量覆盖数量
    override_count: usize,
}

impl ConfigManager {
    /// 加载配置；未指定文件时使用 `KMI_CONFIG_PATH`，都没有则仅用默认值与环境变量
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os("KMI_CONFIG_PATH").map(PathBuf::from));
        let overrides = Self::build_env_overrides();
        Self::load_with_overrides(path.as_deref(), &overrides)
    }

    /// 使用显式覆盖表加载
    pub fn load_with_overrides(
        config_path: Option<&Path>,
        overrides: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::load_config_file(path)?,
            None => AppConfig::default(),
        };

        Self::apply_env_overrides(&mut config, overrides)?;
        config.validate()?;

        info!(
            source = ?config_path,
            overrides = overrides.len(),
            keys = config.keys.len(),
            dry_run = config.dry_run,
            "配置加载完成"
        );

        Ok(Self {
            config: Arc::new(config),
            source_path: config_path.map(Path::to_path_buf),
            override_count: overrides.len(),
        })
    }

    /// 获取当前配置
    #[must_use]
    pub fn config(&self) -> Arc<AppConfig> {
        Arc::clone(&self.config)
    }

    /// 配置来源文件
    #[must_use]
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// 生效的环境变量覆盖数量
    #[must_use]
    pub const fn override_count(&self) -> usize {
        self.override_count
    }

    /// 加载配置文件
    fn load_config_file(path: &Path) -> Result<AppConfig> {
        if !path.exists() {
            return Err(ProxyError::config(format!("配置文件不存在: {}", path.display())));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config_with_source(format!("读取配置文件失败: {}", path.display()), e)
        })?;

        toml::from_str(&content).map_err(|e| {
            ProxyError::config_with_source(
                format!("TOML解析失败 - 配置文件: {}, 详细错误: {e}", path.display()),
                e,
            )
        })
    }

    /// 收集所有 `KMI_` 开头的环境变量
    #[must_use]
    pub fn build_env_overrides() -> HashMap<String, String> {
        let overrides: HashMap<String, String> = env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix(ENV_PREFIX)
                    .map(|name| (name.to_string(), value))
            })
            .collect();
        debug!("发现 {} 个环境变量覆盖", overrides.len());
        overrides
    }

    /// 应用环境变量覆盖
    pub fn apply_env_overrides(
        config: &mut AppConfig,
        overrides: &HashMap<String, String>,
    ) -> Result<()> {
        for (name, value) in overrides {
            debug!(
                "应用环境变量覆盖: {ENV_PREFIX}{} = {}",
                name,
                if name.contains("TOKEN") || name.contains("SECRET") {
                    "***"
                } else {
                    value
                }
            );
            Self::apply_override_to_config(config, name, value)?;
        }
        Ok(())
    }

    /// 将单个覆盖写入配置对象
    fn apply_override_to_config(config: &mut AppConfig, name: &str, value: &str) -> Result<()> {
        match name {
            "PROXY_LISTEN" => config.proxy_listen = value.to_string(),
            "PROXY_BASE_PATH" => config.proxy_base_path = value.to_string(),
            "UPSTREAM_BASE_URL" => config.upstream_base_url = value.to_string(),
            "UPSTREAM_ALLOWLIST" => {
                config.upstream_allowlist = value
                    .split(',')
                    .map(|item| item.trim().to_lowercase())
                    .filter(|item| !item.is_empty())
                    .collect();
            }
            "STATE_DIR" => config.state_dir = PathBuf::from(value),
            "DRY_RUN" => config.dry_run = parse_bool(value),
            "AUTO_ROTATE_ALLOWED" => config.auto_rotate_allowed = parse_bool(value),
            "ROTATION_COOLDOWN_SECONDS" => {
                config.rotation_cooldown_seconds = parse_number(name, value)?;
            }
            "ROTATE_ON_TIE" => config.rotate_on_tie = parse_bool(value),
            "PROXY_ALLOW_REMOTE" => config.proxy_allow_remote = parse_bool(value),
            "PROXY_TOKEN" => config.proxy_token = value.to_string(),
            "PROXY_REQUIRE_TLS" => config.proxy_require_tls = parse_bool(value),
            "PROXY_TLS_TERMINATED" => config.proxy_tls_terminated = parse_bool(value),
            "PROXY_MAX_RPS" => config.proxy_max_rps = parse_number(name, value)?,
            "PROXY_MAX_RPM" => config.proxy_max_rpm = parse_number(name, value)?,
            "PROXY_MAX_RPS_PER_KEY" => config.proxy_max_rps_per_key = parse_number(name, value)?,
            "PROXY_MAX_RPM_PER_KEY" => config.proxy_max_rpm_per_key = parse_number(name, value)?,
            "PROXY_RETRY_MAX" => config.proxy_retry_max = parse_number(name, value)?,
            "PROXY_RETRY_BASE_MS" => config.proxy_retry_base_ms = parse_number(name, value)?,
            "REQUIRE_USAGE_BEFORE_REQUEST" => {
                config.require_usage_before_request = parse_bool(value);
            }
            "FAIL_OPEN_ON_EMPTY_CACHE" => config.fail_open_on_empty_cache = parse_bool(value),
            "USAGE_CACHE_SECONDS" => config.usage_cache_seconds = parse_number(name, value)?,
            "BLOCKLIST_RECHECK_SECONDS" => {
                config.blocklist_recheck_seconds = parse_number(name, value)?;
            }
            "BLOCKLIST_RECHECK_MAX" => config.blocklist_recheck_max = parse_number(name, value)?,
            "PAYMENT_BLOCK_SECONDS" => config.payment_block_seconds = parse_number(name, value)?,
            "TRACE_MAX_MB" => {
                config.trace_max_bytes = AppConfig::mib_to_bytes(parse_number(name, value)?);
            }
            "TRACE_BACKUPS" => config.trace_max_backups = parse_number(name, value)?,
            "TIME_ZONE" => config.time_zone = value.to_string(),
            "CONFIG_PATH" => {}
            _ => {
                warn!("未知的配置项，忽略环境变量覆盖: {ENV_PREFIX}{name}");
            }
        }
        Ok(())
    }
}

/// 布尔值解析：`1/true/yes/on` 为真，其余为假
#[must_use]
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_number<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.trim().parse::<T>().map_err(|e| {
        ProxyError::config_with_source(format!("无效的数值 {ENV_PREFIX}{name}: {value}"), e)
    })
}

impl From<&KeyEntry> for crate::key_pool::KeyRecord {
    fn from(entry: &KeyEntry) -> Self {
        Self::new(&entry.label, &entry.secret, entry.priority, entry.disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn overrides(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn env_overrides_win_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "proxy_max_rps = 3\ndry_run = true").unwrap();

        let manager = ConfigManager::load_with_overrides(
            Some(file.path()),
            &overrides(&[
                ("PROXY_MAX_RPS", "7"),
                ("DRY_RUN", "off"),
                ("UPSTREAM_ALLOWLIST", " API.kimi.com , *.moonshot.cn "),
                ("TRACE_MAX_MB", "2"),
            ]),
        )
        .unwrap();
        let config = manager.config();

        assert_eq!(config.proxy_max_rps, 7);
        assert!(!config.dry_run);
        assert_eq!(
            config.upstream_allowlist,
            vec!["api.kimi.com".to_string(), "*.moonshot.cn".to_string()]
        );
        assert_eq!(config.trace_max_bytes, 2 * 1024 * 1024);
        assert_eq!(manager.override_count(), 4);
    }

    #[test]
    fn invalid_number_is_config_error() {
        let err = ConfigManager::load_with_overrides(None, &overrides(&[("PROXY_RETRY_MAX", "x")]))
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config { .. }));
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = ConfigManager::load_with_overrides(
            Some(Path::new("/definitely/not/here.toml")),
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("配置文件不存在"));
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("YES"));
        assert!(parse_bool(" 1 "));
        assert!(!parse_bool("nope"));
    }
}
