//! # 调度类型定义

use std::cmp::Ordering;

use crate::key_pool::KeyRecord;
use crate::state::RotationState;

/// 用量门控策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsagePolicy {
    /// 是否要求用量数据正常
    pub require_usage_ok: bool,
    /// 尚无用量数据时是否放行
    pub fail_open_on_empty_cache: bool,
}

impl UsagePolicy {
    /// 创建策略
    #[must_use]
    pub const fn new(require_usage_ok: bool, fail_open_on_empty_cache: bool) -> Self {
        Self {
            require_usage_ok,
            fail_open_on_empty_cache,
        }
    }
}

/// 选中的密钥
#[derive(Debug, Clone)]
pub struct Selection<'a> {
    /// 注册表下标
    pub index: usize,
    /// 密钥
    pub key: &'a KeyRecord,
    /// 选择时被覆盖的 `last_used`；`None` 表示未改动
    pub replaced_last_used: Option<Option<String>>,
}

/// 选择前的游标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorSnapshot {
    /// 手动游标
    pub active_index: usize,
    /// 轮询游标
    pub rotation_index: usize,
}

impl CursorSnapshot {
    /// 记录当前游标
    #[must_use]
    pub const fn capture(state: &RotationState) -> Self {
        Self {
            active_index: state.active_index,
            rotation_index: state.rotation_index,
        }
    }
}

/// 手动轮换结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualRotation {
    /// 结果下标
    pub index: usize,
    /// 结果标签
    pub label: String,
    /// 是否发生了切换
    pub rotated: bool,
    /// 可读原因
    pub reason: Option<String>,
}

/// 手动评分，越小越好：`(状态名次, -剩余百分比, 错误率)`，缺失剩余百分比时排最后
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManualScore {
    /// 状态名次
    pub status_rank: u8,
    /// 剩余百分比取负，未知为 1.0
    pub remaining_sort: f64,
    /// 错误率
    pub error_rate: f64,
}

impl ManualScore {
    /// 全序比较
    #[must_use]
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        self.status_rank
            .cmp(&other.status_rank)
            .then_with(|| self.remaining_sort.total_cmp(&other.remaining_sort))
            .then_with(|| self.error_rate.total_cmp(&other.error_rate))
    }
}
