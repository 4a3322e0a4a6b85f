//! # 健康服务
//!
//! 每个密钥/账户一次用量往返，结果与状态计数组合为 [`HealthMap`]，
//! 并以 TTL 缓存在内存中供调度读取。

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::checker::{UsageFetcher, build_health_info};
use super::types::{Account, HealthInfo, HealthMap, Usage};
use crate::key_pool::Registry;
use crate::scheduler::is_exhausted;
use crate::state::{KeyState, RotationState};

/// 健康服务
#[derive(Debug, Clone)]
pub struct HealthService {
    fetcher: Arc<dyn UsageFetcher>,
    base_url: String,
    dry_run: bool,
}

impl HealthService {
    /// 创建服务
    pub fn new(fetcher: Arc<dyn UsageFetcher>, base_url: impl Into<String>, dry_run: bool) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
            dry_run,
        }
    }

    /// 查询单个凭据的用量；演练模式直接返回满额数据
    pub async fn fetch_usage(
        &self,
        base_url: &str,
        secret: &str,
        label: &str,
        dry_run: bool,
    ) -> Option<Usage> {
        if dry_run {
            return Some(Usage::dry_run());
        }
        self.fetcher.fetch_usage(base_url, secret, label).await
    }

    /// 按注册表顺序查询所有密钥的用量
    pub async fn fetch_registry_usages(
        &self,
        registry: &Registry,
        force_real: bool,
    ) -> Vec<Option<Usage>> {
        let dry_run = self.dry_run && !force_real;
        join_all(
            registry
                .keys()
                .iter()
                .map(|key| self.fetch_usage(&self.base_url, &key.secret, &key.label, dry_run)),
        )
        .await
    }

    /// 实时探测单个密钥（忽略演练模式）
    pub async fn probe_live(&self, secret: &str, label: &str) -> Option<Usage> {
        self.fetch_usage(&self.base_url, secret, label, false).await
    }

    /// 用已取得的用量与当前状态计算健康表
    #[must_use]
    pub fn build_health_map(
        registry: &Registry,
        usages: &[Option<Usage>],
        state: &RotationState,
    ) -> HealthMap {
        let empty = KeyState::default();
        registry
            .keys()
            .iter()
            .zip(usages)
            .map(|(key, usage)| {
                let key_state = state.key_state(&key.label).unwrap_or(&empty);
                let info = build_health_info(
                    usage.as_ref(),
                    key_state,
                    is_exhausted(state, &key.label),
                );
                (key.label.clone(), info)
            })
            .collect()
    }

    /// 查询并计算注册表的健康表
    pub async fn get_health_map(
        &self,
        registry: &Registry,
        state: &RotationState,
        force_real: bool,
    ) -> HealthMap {
        let usages = self.fetch_registry_usages(registry, force_real).await;
        Self::build_health_map(registry, &usages, state)
    }

    /// 查询外部账户的健康信息，结果以账户 ID 为键
    pub async fn get_accounts_health(
        &self,
        accounts: &[Account],
        state: &RotationState,
        force_real: bool,
    ) -> HashMap<String, HealthInfo> {
        let dry_run = self.dry_run && !force_real;
        let usages = join_all(accounts.iter().map(|account| {
            self.fetch_usage(&account.base_url, &account.secret, &account.label, dry_run)
        }))
        .await;

        let empty = KeyState::default();
        accounts
            .iter()
            .zip(usages)
            .map(|(account, usage)| {
                let key_state = state.key_state(&account.label).unwrap_or(&empty);
                let info = build_health_info(
                    usage.as_ref(),
                    key_state,
                    is_exhausted(state, &account.label),
                );
                (account.id.clone(), info)
            })
            .collect()
    }
}

/// 带 TTL 的健康缓存；过期后保留旧数据直到下一次刷新成功
#[derive(Debug)]
pub struct HealthCache {
    ttl: Duration,
    inner: RwLock<CacheEntry>,
}

#[derive(Debug, Default)]
struct CacheEntry {
    map: Arc<HealthMap>,
    refreshed_at: Option<Instant>,
}

impl HealthCache {
    /// 创建缓存
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(CacheEntry::default()),
        }
    }

    /// 当前缓存的健康表（可能为空）
    pub async fn snapshot(&self) -> Arc<HealthMap> {
        Arc::clone(&self.inner.read().await.map)
    }

    /// 是否仍在 TTL 内
    pub async fn is_fresh(&self) -> bool {
        self.inner
            .read()
            .await
            .refreshed_at
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// 写入新的健康表
    pub async fn store(&self, map: HealthMap) {
        let mut inner = self.inner.write().await;
        inner.map = Arc::new(map);
        inner.refreshed_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::types::HealthStatus;
    use crate::key_pool::KeyRecord;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UsageFetcher for CountingFetcher {
        async fn fetch_usage(&self, _base_url: &str, secret: &str, _label: &str) -> Option<Usage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (secret != "sk-down").then(|| Usage {
                remaining_percent: Some(55.0),
                ..Usage::dry_run()
            })
        }
    }

    fn registry() -> Registry {
        Registry::from_records([
            KeyRecord::new("a", "sk-a", 0, false),
            KeyRecord::new("b", "sk-down", 0, false),
        ])
    }

    #[tokio::test]
    async fn dry_run_skips_network_unless_forced() {
        let fetcher = Arc::new(CountingFetcher::default());
        let service = HealthService::new(fetcher.clone(), "https://example.invalid", true);
        let state = RotationState::default();

        let map = service.get_health_map(&registry(), &state, false).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(map["a"].remaining_percent, Some(100.0));
        assert_eq!(map["a"].status, HealthStatus::Healthy);

        let forced = service.get_health_map(&registry(), &state, true).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(forced["a"].remaining_percent, Some(55.0));
        assert_eq!(forced["b"].status, HealthStatus::Warn);
        assert!(!forced["b"].usage_ok);
    }

    #[tokio::test]
    async fn accounts_health_is_keyed_by_id() {
        let fetcher = Arc::new(CountingFetcher::default());
        let service = HealthService::new(fetcher, "https://example.invalid", false);
        let accounts = vec![Account {
            id: "acct-1".to_string(),
            label: "a".to_string(),
            base_url: "https://other.invalid".to_string(),
            secret: "sk-a".to_string(),
        }];
        let map = service
            .get_accounts_health(&accounts, &RotationState::default(), false)
            .await;
        assert_eq!(map.len(), 1);
        assert_eq!(map["acct-1"].remaining_percent, Some(55.0));
    }

    #[tokio::test]
    async fn cache_ttl() {
        let cache = HealthCache::new(Duration::from_secs(60));
        assert!(!cache.is_fresh().await);
        assert!(cache.snapshot().await.is_empty());

        let mut map = HealthMap::new();
        map.insert(
            "a".to_string(),
            build_health_info(Some(&Usage::dry_run()), &KeyState::default(), false),
        );
        cache.store(map).await;
        assert!(cache.is_fresh().await);
        assert_eq!(cache.snapshot().await.len(), 1);

        let expired = HealthCache::new(Duration::ZERO);
        expired.store(HealthMap::new()).await;
        assert!(!expired.is_fresh().await);
    }
}
