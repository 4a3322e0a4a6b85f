//! # 追踪读取与分布诊断

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use super::types::TraceEntry;
use crate::error::{ProxyError, Result};

/// 默认读取窗口
pub const DEFAULT_TRACE_WINDOW: usize = 200;

/// 读取文件末尾 `window` 行，跳过无法解析的行；文件不存在时返回空
pub fn load_trace_entries(path: &Path, window: usize) -> Result<Vec<TraceEntry>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(ProxyError::io(
                format!("读取追踪文件失败: {}", path.display()),
                e,
            ));
        }
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(window);
    Ok(lines[start..]
        .iter()
        .filter_map(|line| serde_json::from_str::<TraceEntry>(line).ok())
        .collect())
}

/// 分布置信度：100 减去各标签实际占比相对均分的最大偏差百分比，最低 0，保留两位小数
#[must_use]
pub fn compute_confidence(entries: &[TraceEntry]) -> f64 {
    if entries.is_empty() {
        return 100.0;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for entry in entries {
        *counts.entry(entry.key_label.as_str()).or_default() += 1;
    }
    let expected = entries.len() as f64 / counts.len().max(1) as f64;
    let max_dev = counts
        .values()
        .map(|&count| (count as f64 - expected).abs() / expected)
        .fold(0.0_f64, f64::max);
    let confidence = (100.0 - max_dev * 100.0).max(0.0);
    (confidence * 100.0).round() / 100.0
}
