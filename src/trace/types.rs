//! 追踪记录类型

use serde::{Deserialize, Serialize};

/// 错误分类：上游状态码，或 `payment_required` / `upstream_error` 之类的标签
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraceErrorCode {
    /// 上游状态码
    Status(u16),
    /// 分类标签
    Label(String),
}

impl TraceErrorCode {
    /// 付费失败
    #[must_use]
    pub fn payment_required() -> Self {
        Self::Label("payment_required".to_string())
    }

    /// 上游传输失败
    #[must_use]
    pub fn upstream_error() -> Self {
        Self::Label("upstream_error".to_string())
    }
}

fn unknown_label() -> String {
    "unknown".to_string()
}

/// 每个代理请求一条的追踪记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceEntry {
    /// 展示时区下的时间
    pub ts: String,
    /// 请求 ID
    pub request_id: String,
    /// HTTP 方法
    pub method: String,
    /// 截断后的提示词预览
    pub prompt_hint: String,
    /// 提示词第一个词
    pub prompt_head: String,
    /// 密钥标签
    #[serde(default = "unknown_label")]
    pub key_label: String,
    /// 密钥摘要
    pub key_hash: String,
    /// `/{path}`
    pub endpoint: String,
    /// 记录的状态码
    pub status: u16,
    /// 耗时（毫秒）
    pub latency_ms: u64,
    /// 错误分类
    pub error_code: Option<TraceErrorCode>,
    /// 记录时的轮询游标
    pub rotation_index: usize,
}

impl Default for TraceEntry {
    fn default() -> Self {
        Self {
            ts: String::new(),
            request_id: String::new(),
            method: String::new(),
            prompt_hint: String::new(),
            prompt_head: String::new(),
            key_label: unknown_label(),
            key_hash: String::new(),
            endpoint: String::new(),
            status: 0,
            latency_ms: 0,
            error_code: None,
            rotation_index: 0,
        }
    }
}
