//! # 时间工具
//!
//! 持久化的时间戳统一为 UTC ISO-8601 字符串（`2024-01-01T00:00:00Z`），
//! 展示时再按配置的时区转换。

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, Utc};

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// 当前 UTC 时间
#[must_use]
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// 格式化为持久化使用的 ISO 字符串
#[must_use]
pub fn to_iso(value: DateTime<Utc>) -> String {
    value.format(ISO_FORMAT).to_string()
}

/// 当前时间的 ISO 字符串
#[must_use]
pub fn now_iso() -> String {
    to_iso(now_utc())
}

/// 解析 ISO 字符串；不带时区的值按 UTC 处理
#[must_use]
pub fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// 展示时区
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayZone {
    /// 本机时区
    Local,
    /// UTC
    Utc,
    /// 固定偏移，如 `+08:00`
    Fixed(FixedOffset),
}

impl DisplayZone {
    /// 从配置值解析，无法识别时回退到本机时区
    #[must_use]
    pub fn resolve(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("local") {
            return Self::Local;
        }
        if trimmed.eq_ignore_ascii_case("utc") || trimmed == "Z" {
            return Self::Utc;
        }
        trimmed
            .parse::<FixedOffset>()
            .map_or(Self::Local, Self::Fixed)
    }

    /// 按该时区格式化
    #[must_use]
    pub fn format(&self, value: DateTime<Utc>) -> String {
        const DISPLAY: &str = "%Y-%m-%d %H:%M:%S %:z";
        match self {
            Self::Local => value.with_timezone(&Local).format(DISPLAY).to_string(),
            Self::Utc => value.format(DISPLAY).to_string(),
            Self::Fixed(offset) => value.with_timezone(offset).format(DISPLAY).to_string(),
        }
    }
}
