//! # 轮换状态类型
//!
//! 单一持久化文档：游标、自动轮换开关以及每个标签的计数器和冷却信息。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::key_pool::Registry;
use crate::utils::time;

/// 当前状态文档版本
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// 单个密钥的可变状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyState {
    /// 最近一次被选中的时间
    pub last_used: Option<String>,
    /// 请求总数
    pub request_count: u64,
    /// 401 次数
    pub error_401: u64,
    /// 403 次数
    pub error_403: u64,
    /// 429 次数
    pub error_429: u64,
    /// 5xx 次数
    pub error_5xx: u64,
    /// 耗尽冷却截止时间
    pub exhausted_until: Option<String>,
    /// 封禁原因
    pub blocked_reason: Option<String>,
    /// 封禁截止时间，缺省且有原因时表示无限期
    pub blocked_until: Option<String>,
}

impl KeyState {
    /// 403 + 429 + 5xx 占请求数的比例
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let errors = self.error_403 + self.error_429 + self.error_5xx;
        errors as f64 / self.request_count.max(1) as f64
    }
}

/// 持久化的轮换状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationState {
    /// 文档版本
    pub schema_version: u32,
    /// 手动/粘滞模式游标
    pub active_index: usize,
    /// 轮询游标
    pub rotation_index: usize,
    /// 是否开启自动轮换
    pub auto_rotate: bool,
    /// 最近一次健康刷新时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_refresh: Option<String>,
    /// 标签 → 状态
    pub keys: BTreeMap<String, KeyState>,
}

impl Default for RotationState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            active_index: 0,
            rotation_index: 0,
            auto_rotate: false,
            last_health_refresh: None,
            keys: BTreeMap::new(),
        }
    }
}

impl RotationState {
    /// 获取或惰性创建标签状态
    pub fn key_state_mut(&mut self, label: &str) -> &mut KeyState {
        self.keys.entry(label.to_string()).or_default()
    }

    /// 只读获取
    #[must_use]
    pub fn key_state(&self, label: &str) -> Option<&KeyState> {
        self.keys.get(label)
    }

    /// 更新最近使用时间，返回旧值
    pub fn mark_last_used(&mut self, label: &str) -> Option<String> {
        std::mem::replace(
            &mut self.key_state_mut(label).last_used,
            Some(time::now_iso()),
        )
    }

    /// 按响应状态码累加计数
    pub fn record_request(&mut self, label: &str, status: u16) {
        let state = self.key_state_mut(label);
        state.request_count += 1;
        match status {
            401 => state.error_401 += 1,
            403 => state.error_403 += 1,
            429 => state.error_429 += 1,
            500..=599 => state.error_5xx += 1,
            _ => {}
        }
    }

    /// 按注册表补齐缺失的标签、夹紧游标、升级版本；返回是否有改动
    pub fn reconcile(&mut self, registry: &Registry) -> bool {
        let mut changed = false;

        if self.schema_version != STATE_SCHEMA_VERSION {
            self.schema_version = STATE_SCHEMA_VERSION;
            changed = true;
        }

        for key in registry.keys() {
            if !self.keys.contains_key(&key.label) {
                self.keys.insert(key.label.clone(), KeyState::default());
                changed = true;
            }
        }

        let clamped = registry
            .len()
            .checked_sub(1)
            .map_or(0, |last| self.active_index.min(last));
        if clamped != self.active_index {
            self.active_index = clamped;
            changed = true;
        }

        let rotation = match registry.len() {
            0 => 0,
            len => self.rotation_index % len,
        };
        if rotation != self.rotation_index {
            self.rotation_index = rotation;
            changed = true;
        }

        changed
    }
}
