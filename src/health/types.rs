//! # 健康检查类型定义

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// 标签 → 健康信息
pub type HealthMap = HashMap<String, HealthInfo>;

/// 用量数据来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    /// 演练模式下的合成满额数据
    DryRun,
    /// 上游 `/usages` 实际返回
    Live,
}

/// 单个配额窗口
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitInfo {
    /// 展示标签，如 `5h limit`
    pub label: String,
    /// 已用
    pub used: Option<i64>,
    /// 上限
    pub limit: Option<i64>,
    /// 剩余
    pub remaining: Option<i64>,
    /// 重置提示
    pub reset_hint: Option<String>,
    /// 窗口长度（小时）
    pub window_hours: Option<f64>,
}

/// 归一化后的用量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// 剩余百分比
    pub remaining_percent: Option<f64>,
    /// 已用
    pub used: Option<i64>,
    /// 上限
    pub limit: Option<i64>,
    /// 剩余
    pub remaining: Option<i64>,
    /// 重置提示
    pub reset_hint: Option<String>,
    /// 各窗口明细
    pub limits: Vec<LimitInfo>,
    /// 账户邮箱（尽力提取，仅供展示）
    pub email: Option<String>,
    /// 来源
    pub source: UsageSource,
}

impl Usage {
    /// 演练模式的满额数据
    #[must_use]
    pub const fn dry_run() -> Self {
        Self {
            remaining_percent: Some(100.0),
            used: Some(0),
            limit: Some(100),
            remaining: Some(100),
            reset_hint: None,
            limits: Vec::new(),
            email: None,
            source: UsageSource::DryRun,
        }
    }
}

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// 健康
    Healthy,
    /// 告警
    Warn,
    /// 封禁
    Blocked,
    /// 耗尽
    Exhausted,
    /// 禁用
    Disabled,
    /// 未知
    Unknown,
}

impl HealthStatus {
    /// 字符串表示
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warn => "warn",
            Self::Blocked => "blocked",
            Self::Exhausted => "exhausted",
            Self::Disabled => "disabled",
            Self::Unknown => "unknown",
        }
    }

    /// 手动评分中的状态名次：healthy 0，warn 1，其余 2
    #[must_use]
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Warn => 1,
            _ => 2,
        }
    }

    /// 是否会让密钥失去资格
    #[must_use]
    pub const fn is_disqualifying(&self) -> bool {
        matches!(self, Self::Blocked | Self::Exhausted)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "healthy" => Ok(Self::Healthy),
            "warn" => Ok(Self::Warn),
            "blocked" => Ok(Self::Blocked),
            "exhausted" => Ok(Self::Exhausted),
            "disabled" => Ok(Self::Disabled),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("unknown health status: {s}")),
        }
    }
}

/// 单个密钥的健康信息，只缓存在内存中
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthInfo {
    /// 状态
    pub status: HealthStatus,
    /// 剩余百分比
    pub remaining_percent: Option<f64>,
    /// 已用
    pub used: Option<i64>,
    /// 上限
    pub limit: Option<i64>,
    /// 剩余
    pub remaining: Option<i64>,
    /// 重置提示
    pub reset_hint: Option<String>,
    /// 窗口明细
    pub limits: Vec<LimitInfo>,
    /// `(403 + 429 + 5xx) / max(请求数, 1)`
    pub error_rate: f64,
    /// 账户邮箱
    pub email: Option<String>,
    /// 用量数据存在且剩余未知或大于 0
    pub usage_ok: bool,
}

impl HealthInfo {
    /// 以剩余百分比表示的资源量；没有百分比时用 remaining/limit 推算
    #[must_use]
    pub fn resource_value(&self) -> Option<f64> {
        if let Some(percent) = self.remaining_percent {
            return Some(percent);
        }
        match (self.remaining, self.limit) {
            (Some(remaining), Some(limit)) if limit > 0 => {
                Some(remaining as f64 / limit as f64 * 100.0)
            }
            _ => None,
        }
    }
}

/// 外部账户（非注册表密钥）的健康查询入参
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    /// 账户 ID，作为结果的键
    pub id: String,
    /// 标签，用于关联状态计数
    pub label: String,
    /// 该账户的上游基础地址
    pub base_url: String,
    /// 凭据
    pub secret: String,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("base_url", &self.base_url)
            .field("secret", &crate::key_pool::mask_key(&self.secret))
            .finish()
    }
}
