//! # 代理上下文
//!
//! 请求处理与后台任务共享的全部资源：配置、注册表、轮换状态及其锁、
//! 健康缓存、限流器、写入器和上游客户端。

use reqwest::Client;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::rate_limit::{KeyedRateLimiter, SlidingWindowLimiter};
use crate::config::AppConfig;
use crate::error::{ProxyError, Result};
use crate::health::{HealthCache, HealthService, HttpUsageFetcher, UsageFetcher};
use crate::key_pool::Registry;
use crate::logging::{LogComponent, LogStage};
use crate::scheduler::{UsagePolicy, clear_blocked, is_blocked};
use crate::state::{RotationState, StateStore, StateWriter};
use crate::trace::{TraceFileConfig, TraceWriter};
use crate::utils::time::{self, DisplayZone};
use crate::{linfo, lwarn};

/// 代理上下文
#[derive(Debug)]
pub struct ProxyContext {
    /// 配置
    pub config: Arc<AppConfig>,
    /// 注册表，进程内不可变
    pub registry: Arc<Registry>,
    /// 轮换状态；选择与计数更新都在这把锁内完成
    pub state: Arc<Mutex<RotationState>>,
    /// 状态存储
    pub store: StateStore,
    /// 防抖状态写入器
    pub state_writer: StateWriter,
    /// 追踪写入器
    pub trace_writer: TraceWriter,
    /// 健康服务
    pub health: HealthService,
    /// 健康缓存
    pub health_cache: HealthCache,
    /// 全局限流
    pub rate_limiter: SlidingWindowLimiter,
    /// 单密钥限流
    pub key_rate_limiter: KeyedRateLimiter,
    /// 上游客户端
    pub client: Client,
    /// 追踪时间的展示时区
    pub display_zone: DisplayZone,
    blocklist_checked_at: StdMutex<Option<Instant>>,
}

impl ProxyContext {
    /// 使用 HTTP 用量查询器创建上下文
    pub fn new(config: Arc<AppConfig>, registry: Registry, state: RotationState) -> Result<Self> {
        let client = build_upstream_client(&config)?;
        let fetcher: Arc<dyn UsageFetcher> = Arc::new(HttpUsageFetcher::new()?);
        Ok(Self::with_parts(config, registry, state, client, fetcher))
    }

    /// 使用指定的客户端与用量查询器创建上下文
    #[must_use]
    pub fn with_parts(
        config: Arc<AppConfig>,
        registry: Registry,
        state: RotationState,
        client: Client,
        fetcher: Arc<dyn UsageFetcher>,
    ) -> Self {
        let state = Arc::new(Mutex::new(state));
        let store = StateStore::new(config.state_path());
        let state_writer = StateWriter::new(
            store.clone(),
            Arc::clone(&state),
            Duration::from_millis(config.state_debounce_ms),
        );
        let trace_writer = TraceWriter::new(
            TraceFileConfig {
                path: config.trace_path(),
                max_bytes: config.trace_max_bytes,
                max_backups: config.trace_max_backups,
            },
            config.trace_queue_capacity,
        );
        let health = HealthService::new(fetcher, config.upstream_base_url.clone(), config.dry_run);
        let health_cache = HealthCache::new(Duration::from_secs(config.usage_cache_seconds));

        Self {
            rate_limiter: SlidingWindowLimiter::new(config.proxy_max_rps, config.proxy_max_rpm),
            key_rate_limiter: KeyedRateLimiter::new(
                config.proxy_max_rps_per_key,
                config.proxy_max_rpm_per_key,
            ),
            display_zone: DisplayZone::resolve(&config.time_zone),
            registry: Arc::new(registry),
            state,
            store,
            state_writer,
            trace_writer,
            health,
            health_cache,
            client,
            config,
            blocklist_checked_at: StdMutex::new(None),
        }
    }

    /// 用量门控策略
    #[must_use]
    pub fn usage_policy(&self) -> UsagePolicy {
        UsagePolicy::new(
            self.config.require_usage_before_request,
            self.config.fail_open_on_empty_cache,
        )
    }

    /// 追踪记录的时间戳
    #[must_use]
    pub fn trace_timestamp(&self) -> String {
        self.display_zone.format(time::now_utc())
    }

    /// 请求保存状态，失败只记录日志
    pub async fn persist(&self, request_id: &str) {
        if let Err(e) = self.state_writer.request_save().await {
            lwarn!(
                request_id,
                LogStage::Persistence,
                LogComponent::StateStore,
                "state_save_failed",
                "保存轮换状态失败",
                error = %e
            );
        }
    }

    /// 健康缓存过期时刷新；返回是否执行了刷新
    ///
    /// 用量查询在锁外进行，计算健康表时才持有状态锁。
    pub async fn refresh_health(&self) -> Result<bool> {
        if self.config.usage_cache_seconds == 0 || self.health_cache.is_fresh().await {
            return Ok(false);
        }
        let usages = self.health.fetch_registry_usages(&self.registry, false).await;
        let map = {
            let mut state = self.state.lock().await;
            let map = HealthService::build_health_map(&self.registry, &usages, &state);
            state.last_health_refresh = Some(time::now_iso());
            map
        };
        let keys = map.len();
        self.health_cache.store(map).await;
        self.state_writer.request_save().await?;
        linfo!(
            "system",
            LogStage::HealthCheck,
            LogComponent::HealthChecker,
            "health_refreshed",
            "健康缓存已刷新",
            keys = keys
        );
        Ok(true)
    }

    /// 按间隔实时探测被封禁的密钥，探测成功即解除封禁；返回解除数量
    pub async fn recheck_blocked(&self) -> Result<usize> {
        let interval = Duration::from_secs(self.config.blocklist_recheck_seconds);
        if interval.is_zero() {
            return Ok(0);
        }
        {
            let mut checked_at = self
                .blocklist_checked_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if checked_at.is_some_and(|at| at.elapsed() < interval) {
                return Ok(0);
            }
            *checked_at = Some(Instant::now());
        }

        let limit = self.config.blocklist_recheck_max;
        let candidates: Vec<(String, String)> = {
            let state = self.state.lock().await;
            let blocked = self
                .registry
                .keys()
                .iter()
                .filter(|key| is_blocked(&state, &key.label))
                .map(|key| (key.label.clone(), key.secret.clone()));
            if limit > 0 {
                blocked.take(limit).collect()
            } else {
                blocked.collect()
            }
        };
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut recovered = Vec::new();
        for (label, secret) in &candidates {
            if self.health.probe_live(secret, label).await.is_some() {
                recovered.push(label.as_str());
            }
        }
        if recovered.is_empty() {
            return Ok(0);
        }

        let cleared = {
            let mut state = self.state.lock().await;
            recovered
                .iter()
                .map(|&label| clear_blocked(&mut state, Some(label)))
                .sum::<usize>()
        };
        self.state_writer.request_save().await?;
        linfo!(
            "system",
            LogStage::HealthCheck,
            LogComponent::HealthChecker,
            "blocklist_recovered",
            "封禁密钥探测成功，已解除封禁",
            cleared = cleared,
            labels = ?recovered
        );
        Ok(cleared)
    }
}

/// 上游客户端：连接与读取分别超时，不设整体超时
pub fn build_upstream_client(config: &AppConfig) -> Result<Client> {
    let timeout = Duration::from_secs(config.upstream_timeout_seconds);
    Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .pool_max_idle_per_host(20)
        .build()
        .map_err(|e| ProxyError::internal_with_source("创建上游客户端失败", e))
}
