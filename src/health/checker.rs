//! # 用量查询与健康评分

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::fmt::Debug;
use std::time::Duration;

use super::types::{HealthInfo, HealthStatus, Usage};
use super::usage::parse_usage;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;
use crate::state::KeyState;

/// `/usages` 请求超时
pub const USAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// 用量查询接口
#[async_trait]
pub trait UsageFetcher: Send + Sync + Debug {
    /// 查询一次用量；任何失败都返回 `None`
    async fn fetch_usage(&self, base_url: &str, secret: &str, label: &str) -> Option<Usage>;
}

/// 基于 reqwest 的 `GET {base}/usages` 实现
#[derive(Debug, Clone)]
pub struct HttpUsageFetcher {
    client: Client,
}

impl HttpUsageFetcher {
    /// 创建查询器
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(USAGE_FETCH_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::internal_with_source("创建用量查询客户端失败", e))?;
        Ok(Self { client })
    }

    /// 复用已有客户端
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn request(&self, base_url: &str, secret: &str) -> anyhow::Result<Value> {
        let url = format!("{}/usages", base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .bearer_auth(secret)
            .timeout(USAGE_FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl UsageFetcher for HttpUsageFetcher {
    async fn fetch_usage(&self, base_url: &str, secret: &str, label: &str) -> Option<Usage> {
        match self.request(base_url, secret).await {
            Ok(payload) => Some(parse_usage(&payload)),
            Err(e) => {
                lwarn!(
                    "system",
                    LogStage::HealthCheck,
                    LogComponent::HealthChecker,
                    "usage_fetch_failed",
                    "用量查询失败",
                    base_url = %base_url,
                    key_label = %label,
                    error = %e
                );
                None
            }
        }
    }
}

/// 按规则顺序评分，先命中者生效
#[must_use]
pub fn score_key(usage: Option<&Usage>, key_state: &KeyState, exhausted: bool) -> HealthStatus {
    if exhausted {
        return HealthStatus::Exhausted;
    }
    if key_state.error_401 > 0 {
        return HealthStatus::Blocked;
    }
    let remaining_percent = usage.and_then(|usage| usage.remaining_percent);
    if remaining_percent.is_some_and(|percent| percent <= 0.0) {
        return HealthStatus::Blocked;
    }
    if key_state.error_403 > 0 {
        return HealthStatus::Warn;
    }
    if usage.is_none() {
        return HealthStatus::Warn;
    }
    if remaining_percent.is_some_and(|percent| percent < 20.0) {
        return HealthStatus::Warn;
    }
    let throttled = key_state.error_429 + key_state.error_5xx;
    let throttle_rate = throttled as f64 / key_state.request_count.max(1) as f64;
    if throttled > 0 || throttle_rate >= 0.05 {
        return HealthStatus::Warn;
    }
    HealthStatus::Healthy
}

/// 组合用量与计数得到健康信息
#[must_use]
pub fn build_health_info(usage: Option<&Usage>, key_state: &KeyState, exhausted: bool) -> HealthInfo {
    let status = score_key(usage, key_state, exhausted);
    HealthInfo {
        status,
        remaining_percent: usage.and_then(|u| u.remaining_percent),
        used: usage.and_then(|u| u.used),
        limit: usage.and_then(|u| u.limit),
        remaining: usage.and_then(|u| u.remaining),
        reset_hint: usage.and_then(|u| u.reset_hint.clone()),
        limits: usage.map(|u| u.limits.clone()).unwrap_or_default(),
        error_rate: key_state.error_rate(),
        email: usage.and_then(|u| u.email.clone()),
        usage_ok: usage.is_some_and(|u| u.remaining_percent.is_none_or(|percent| percent > 0.0)),
    }
}
