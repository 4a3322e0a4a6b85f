//! # 重试策略评估
//!
//! 上游重试决策、指数退避、`Retry-After` 解析以及耗尽冷却时长计算。

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::ldebug;
use crate::logging::{LogComponent, LogStage};

/// 5xx 冷却上限（秒）
pub const SERVER_ERROR_COOLDOWN_CAP: u64 = 60;

/// 重试决策结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// 是否应该重试
    pub should_retry: bool,
    /// 退避时长
    pub delay: Duration,
    /// 原因
    pub reason: RetryReason,
}

/// 重试决策原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// 达到重试上限
    MaxRetryExceeded,
    /// 未配置重试预算
    NoRetryBudget,
    /// 响应状态不需要重试
    NotRetryable,
    /// 可以重试
    Retryable,
}

impl RetryDecision {
    /// 创建不重试的决策
    #[must_use]
    pub const fn no_retry(reason: RetryReason) -> Self {
        Self {
            should_retry: false,
            delay: Duration::ZERO,
            reason,
        }
    }

    /// 创建重试的决策
    #[must_use]
    pub const fn retry(delay: Duration) -> Self {
        Self {
            should_retry: true,
            delay,
            reason: RetryReason::Retryable,
        }
    }
}

/// 一次上游尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 传输层失败
    TransportError,
    /// 收到响应
    Status(u16),
}

/// 429 与 5xx 需要重试
#[must_use]
pub const fn is_retryable_status(status: u16) -> bool {
    status == 429 || matches!(status, 500..=599)
}

/// `base_ms * 2^attempt`
#[must_use]
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

/// 重试策略：同一密钥最多重试 `max_retries` 次
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大重试次数
    pub max_retries: u32,
    /// 退避基数（毫秒）
    pub base_ms: u64,
}

impl RetryPolicy {
    /// 创建策略
    #[must_use]
    pub const fn new(max_retries: u32, base_ms: u64) -> Self {
        Self {
            max_retries,
            base_ms,
        }
    }

    /// 评估第 `attempt` 次（从 0 开始）尝试之后是否继续
    #[must_use]
    pub fn evaluate(&self, attempt: u32, outcome: AttemptOutcome) -> RetryDecision {
        if let AttemptOutcome::Status(status) = outcome {
            if !is_retryable_status(status) {
                return RetryDecision::no_retry(RetryReason::NotRetryable);
            }
        }
        if self.max_retries == 0 {
            return RetryDecision::no_retry(RetryReason::NoRetryBudget);
        }
        if attempt >= self.max_retries {
            return RetryDecision::no_retry(RetryReason::MaxRetryExceeded);
        }
        RetryDecision::retry(backoff_delay(self.base_ms, attempt))
    }
}

/// 解析 `Retry-After`：整数秒或 HTTP 日期，负值按 0 处理
#[must_use]
pub fn parse_retry_after(value: Option<&str>, now: DateTime<Utc>) -> Option<u64> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<i64>() {
        return Some(u64::try_from(seconds).unwrap_or(0));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc).signed_duration_since(now).num_seconds();
    Some(u64::try_from(delta).unwrap_or(0))
}

/// 计算错误响应对应的耗尽冷却（秒），不需要冷却时返回 `None`
///
/// 429 优先使用 `Retry-After`（至少 1 秒），5xx 不超过 60 秒，403 使用默认值。
#[must_use]
pub fn exhaustion_cooldown(status: u16, default_seconds: u64, retry_after: Option<u64>) -> Option<u64> {
    match status {
        429 => Some(retry_after.map_or(default_seconds, |seconds| seconds.max(1))),
        500..=599 => Some(default_seconds.min(SERVER_ERROR_COOLDOWN_CAP)),
        403 => Some(default_seconds),
        _ => None,
    }
}

/// 记录重试决策
pub fn log_retry_decision(
    request_id: &str,
    outcome: AttemptOutcome,
    decision: &RetryDecision,
    attempt: u32,
) {
    let status_code = match outcome {
        AttemptOutcome::Status(status) => Some(status),
        AttemptOutcome::TransportError => None,
    };
    if decision.should_retry {
        ldebug!(
            request_id,
            LogStage::ResponseFailure,
            LogComponent::Upstream,
            "retry_scheduled",
            "满足重试条件，使用同一密钥重试",
            status_code = ?status_code,
            attempt = attempt,
            delay_ms = u64::try_from(decision.delay.as_millis()).unwrap_or(u64::MAX)
        );
    } else if decision.reason == RetryReason::MaxRetryExceeded {
        ldebug!(
            request_id,
            LogStage::ResponseFailure,
            LogComponent::Upstream,
            "retry_skipped",
            "未触发重试（已达重试上限）",
            status_code = ?status_code,
            attempt = attempt
        );
    }
}
