//! # 凭据提供者
//!
//! 核心只消费构建好的 [`Registry`]，凭据文件的格式解析由外部提供者负责。

use async_trait::async_trait;

use super::{KeyRecord, Registry};
use crate::config::AppConfig;
use crate::error::Result;

/// 凭据提供者
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// 提供者名称，用于日志
    fn name(&self) -> &'static str;

    /// 构建注册表
    async fn load_registry(&self) -> Result<Registry>;
}

/// 读取配置中内联的 `[[keys]]`
#[derive(Debug, Clone)]
pub struct ConfigKeyProvider {
    records: Vec<KeyRecord>,
}

impl ConfigKeyProvider {
    /// 从配置创建
    #[must_use]
    pub fn new(config: &AppConfig) -> Self {
        Self {
            records: config.keys.iter().map(KeyRecord::from).collect(),
        }
    }
}

#[async_trait]
impl KeyProvider for ConfigKeyProvider {
    fn name(&self) -> &'static str {
        "config"
    }

    async fn load_registry(&self) -> Result<Registry> {
        Ok(Registry::from_records(self.records.clone()))
    }
}

/// 固定记录集合，便于嵌入方直接注入
#[derive(Debug, Clone, Default)]
pub struct StaticKeyProvider {
    records: Vec<KeyRecord>,
}

impl StaticKeyProvider {
    /// 创建
    #[must_use]
    pub const fn new(records: Vec<KeyRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn load_registry(&self) -> Result<Registry> {
        Ok(Registry::from_records(self.records.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyEntry;

    #[tokio::test]
    async fn config_provider_builds_sorted_registry() {
        let config = AppConfig {
            keys: vec![
                KeyEntry {
                    label: "low".to_string(),
                    secret: "sk-low".to_string(),
                    priority: 0,
                    disabled: false,
                },
                KeyEntry {
                    label: "high".to_string(),
                    secret: "sk-high".to_string(),
                    priority: 3,
                    disabled: true,
                },
            ],
            ..AppConfig::default()
        };
        let registry = ConfigKeyProvider::new(&config).load_registry().await.unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.keys()[0].label, "high");
        assert!(registry.keys()[0].disabled);
    }
}
