//! # 用量响应解析
//!
//! 上游 `/usages` 的返回结构不固定，这里只在边界处读取 JSON，
//! 产出带显式可选字段的 [`Usage`]。
//!
//! 剩余百分比的取值顺序：
//! 1. 顶层 `remaining_percent`
//! 2. 顶层 `remaining / total`
//! 3. `data.{remaining|remaining_quota|remain} / data.total`
//! 4. 汇总的 `remaining / limit`，或 `used / limit` 推算
//! 5. 窗口最长且带上限的配额条目
//!
//! 显式值与 `used / limit` 算出的值相差超过 1 个百分点时以计算值为准。

use serde_json::{Map, Value};

use super::types::{LimitInfo, Usage, UsageSource};

const EMAIL_KEYS: [&str; 3] = ["email", "account_email", "user_email"];

/// 解析一次 `/usages` 返回
#[must_use]
pub fn parse_usage(payload: &Value) -> Usage {
    let empty = Map::new();
    let payload = payload.as_object().unwrap_or(&empty);

    let limits = parse_limits(payload);
    let email = extract_email(payload);
    let (mut used, mut limit, mut remaining, reset_hint) = extract_summary(payload);
    let mut remaining_percent = extract_remaining_percent(payload);

    if remaining_percent.is_none() {
        if let (Some(rem), Some(lim)) = (remaining, limit) {
            if lim != 0 {
                remaining_percent = Some(round2(rem as f64 / lim as f64 * 100.0));
            }
        }
    }

    if remaining_percent.is_none() {
        if let (Some(u), Some(lim)) = (used, limit) {
            let rem = *remaining.get_or_insert(lim.saturating_sub(u).max(0));
            remaining_percent = (lim != 0).then(|| round2(rem as f64 / lim as f64 * 100.0));
        }
    }

    if let (Some(percent), Some(u), Some(lim)) = (remaining_percent, used, limit) {
        if lim > 0 {
            let computed = round2(lim.saturating_sub(u) as f64 / lim as f64 * 100.0);
            if (percent - computed).abs() > 1.0 {
                remaining_percent = Some(computed);
            }
        }
    }

    if remaining_percent.is_none() {
        if let Some(candidate) = longest_window_with_limit(&limits) {
            used = used.or(candidate.used);
            limit = limit.or(candidate.limit);
            remaining = remaining.or(candidate.remaining);
            if let (Some(u), Some(lim)) = (used, limit) {
                let rem = *remaining.get_or_insert(lim.saturating_sub(u).max(0));
                remaining_percent = (lim != 0).then(|| round2(rem as f64 / lim as f64 * 100.0));
            }
        }
    }

    Usage {
        remaining_percent,
        used,
        limit,
        remaining,
        reset_hint,
        limits,
        email,
        source: UsageSource::Live,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// 宽松的整数转换：数字截断、数字字符串解析、布尔转 0/1
fn to_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).filter(|value| is_truthy(value))
}

fn ratio_percent(remaining: &Value, total: &Value) -> Option<f64> {
    let remaining = to_float(remaining)?;
    let total = to_float(total)?;
    Some(if total > 0.0 {
        remaining / total * 100.0
    } else {
        0.0
    })
}

fn extract_remaining_percent(payload: &Map<String, Value>) -> Option<f64> {
    if let Some(value) = payload.get("remaining_percent") {
        return to_float(value);
    }
    if let (Some(remaining), Some(total)) = (payload.get("remaining"), payload.get("total")) {
        return ratio_percent(remaining, total);
    }
    let data = payload.get("data").and_then(Value::as_object)?;
    let total = data.get("total")?;
    ["remaining", "remaining_quota", "remain"]
        .iter()
        .find_map(|key| data.get(*key))
        .and_then(|remaining| ratio_percent(remaining, total))
}

/// 重置提示：绝对时间优先，其次相对秒数
#[must_use]
pub fn extract_reset_hint(map: &Map<String, Value>) -> Option<String> {
    for key in ["reset_at", "resetAt", "reset_time", "resetTime"] {
        if let Some(value) = truthy(map, key) {
            return Some(display_value(value));
        }
    }
    for key in ["reset_in", "resetIn", "ttl", "window"] {
        if let Some(value) = truthy(map, key) {
            return Some(format!("resets in {}s", display_value(value)));
        }
    }
    None
}

fn looks_like_email(value: Option<&Value>) -> Option<String> {
    let text = value?.as_str()?;
    (text.contains('@') && text.contains('.')).then(|| text.trim().to_string())
}

fn extract_email(payload: &Map<String, Value>) -> Option<String> {
    let nested = ["data", "account"]
        .into_iter()
        .filter_map(|key| payload.get(key).and_then(Value::as_object));
    std::iter::once(payload)
        .chain(nested)
        .find_map(|map| EMAIL_KEYS.iter().find_map(|key| looks_like_email(map.get(*key))))
}

/// 窗口长度换算为小时
fn window_hours(window: &Map<String, Value>) -> Option<f64> {
    let duration = to_int(window.get("duration"))? as f64;
    let unit = window
        .get("timeUnit")
        .filter(|value| is_truthy(value))
        .map(display_value)
        .unwrap_or_default()
        .to_uppercase();
    if unit.contains("MINUTE") {
        Some(duration / 60.0)
    } else if unit.contains("HOUR") {
        Some(duration)
    } else if unit.contains("DAY") {
        Some(duration * 24.0)
    } else if unit.contains("WEEK") {
        Some(duration * 24.0 * 7.0)
    } else {
        None
    }
}

/// 窗口标签：显式名称优先，其次按时长合成，最后 `Limit #N`
fn limit_label(
    item: &Map<String, Value>,
    detail: &Map<String, Value>,
    hours: Option<f64>,
    index: usize,
) -> String {
    for key in ["name", "title", "scope"] {
        if let Some(value) = truthy(item, key).or_else(|| truthy(detail, key)) {
            return display_value(value);
        }
    }
    match hours {
        Some(h) if h >= 24.0 && h % 24.0 == 0.0 => format!("{}d limit", (h / 24.0) as i64),
        Some(h) if h.fract() == 0.0 => format!("{}h limit", h as i64),
        Some(h) => format!("{h:.1}h limit"),
        None => format!("Limit #{}", index + 1),
    }
}

fn detail_of(item: &Map<String, Value>) -> &Map<String, Value> {
    item.get("detail").and_then(Value::as_object).unwrap_or(item)
}

fn parse_limits(payload: &Map<String, Value>) -> Vec<LimitInfo> {
    let Some(items) = payload.get("limits").and_then(Value::as_array) else {
        return Vec::new();
    };
    let empty = Map::new();
    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let item = item.as_object()?;
            let detail = detail_of(item);
            let window = item.get("window").and_then(Value::as_object).unwrap_or(&empty);
            let hours = window_hours(window);
            Some(LimitInfo {
                label: limit_label(item, detail, hours, index),
                used: to_int(detail.get("used")),
                limit: to_int(detail.get("limit")),
                remaining: to_int(detail.get("remaining")),
                reset_hint: extract_reset_hint(detail),
                window_hours: hours,
            })
        })
        .collect()
}

type Summary = (Option<i64>, Option<i64>, Option<i64>, Option<String>);

/// `usage.*` 汇总，缺失的字段从第一个配额条目补齐
fn extract_summary(payload: &Map<String, Value>) -> Summary {
    let (mut used, mut limit, mut remaining, mut reset_hint) = (None, None, None, None);

    if let Some(usage) = payload.get("usage").and_then(Value::as_object) {
        used = to_int(usage.get("used"));
        limit = to_int(usage.get("limit"));
        remaining = to_int(usage.get("remaining"));
        reset_hint = extract_reset_hint(usage);
    }

    let first = payload
        .get("limits")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(Value::as_object);
    if let Some(first) = first {
        let detail = detail_of(first);
        used = used.or_else(|| to_int(detail.get("used")));
        limit = limit.or_else(|| to_int(detail.get("limit")));
        remaining = remaining.or_else(|| to_int(detail.get("remaining")));
        if reset_hint.is_none() {
            reset_hint = extract_reset_hint(detail);
        }
    }

    (used, limit, remaining, reset_hint)
}

/// 带非零上限、窗口最长的条目；并列时取靠前者
fn longest_window_with_limit(limits: &[LimitInfo]) -> Option<&LimitInfo> {
    limits
        .iter()
        .filter(|entry| entry.limit.is_some_and(|limit| limit != 0))
        .fold(None, |best: Option<&LimitInfo>, entry| {
            let hours = entry.window_hours.unwrap_or(-1.0);
            match best {
                Some(current) if current.window_hours.unwrap_or(-1.0) >= hours => Some(current),
                _ => Some(entry),
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn explicit_percent_wins_when_consistent() {
        let usage = parse_usage(&json!({"remaining_percent": "42.5"}));
        assert_eq!(usage.remaining_percent, Some(42.5));
        assert_eq!(usage.source, UsageSource::Live);
    }

    #[test]
    fn extreme_counters_saturate_instead_of_overflowing() {
        let usage = parse_usage(&json!({"usage": {"used": i64::MIN, "limit": 1}}));
        assert_eq!(usage.remaining, Some(i64::MAX));
        assert!(usage.remaining_percent.is_some_and(f64::is_finite));

        let usage = parse_usage(&json!({"usage": {"used": i64::MAX, "limit": -1}}));
        assert_eq!(usage.remaining, Some(0));
        assert_eq!(usage.remaining_percent, Some(0.0));

        let usage = parse_usage(&json!({"remaining_percent": 50, "usage": {"used": i64::MIN, "limit": 10}}));
        assert!(usage.remaining_percent.is_some_and(f64::is_finite));
    }

    #[test]
    fn malformed_explicit_percent_yields_none_without_fallthrough() {
        let usage = parse_usage(&json!({"remaining_percent": "n/a", "remaining": 1, "total": 2}));
        assert_eq!(usage.remaining_percent, None);
    }

    #[test]
    fn top_level_and_nested_ratios() {
        assert_eq!(
            parse_usage(&json!({"remaining": 25, "total": 100})).remaining_percent,
            Some(25.0)
        );
        assert_eq!(
            parse_usage(&json!({"data": {"remain": 3, "total": 4}})).remaining_percent,
            Some(75.0)
        );
        assert_eq!(
            parse_usage(&json!({"data": {"remaining_quota": 3, "total": 0}})).remaining_percent,
            Some(0.0)
        );
    }

    #[test]
    fn summary_from_usage_block() {
        let usage = parse_usage(&json!({
            "usage": {"used": 30, "limit": 120, "resetAt": "2024-01-01T00:00:00Z"}
        }));
        assert_eq!(usage.remaining, Some(90));
        assert_eq!(usage.remaining_percent, Some(75.0));
        assert_eq!(usage.reset_hint.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn computed_value_overrides_disagreeing_explicit() {
        let usage = parse_usage(&json!({
            "remaining_percent": 90,
            "usage": {"used": 50, "limit": 100}
        }));
        assert_eq!(usage.remaining_percent, Some(50.0));
    }

    #[test]
    fn limits_windows_labels_and_longest_window_fallback() {
        let usage = parse_usage(&json!({
            "limits": [
                {"window": {"duration": 300, "timeUnit": "TIME_UNIT_MINUTE"},
                 "detail": {"remaining": 10, "resetIn": 120}},
                {"window": {"duration": 7, "timeUnit": "TIME_UNIT_DAY"},
                 "detail": {"used": 20, "limit": 200}},
                {"window": {"duration": 90, "timeUnit": "MINUTE"},
                 "detail": {"used": 1, "limit": 10}},
                {"name": "burst", "detail": {"used": 1}},
                {"detail": {}}
            ]
        }));
        let labels: Vec<&str> = usage.limits.iter().map(|l| l.label.as_str()).collect();
        assert_eq!(labels, vec!["5h limit", "7d limit", "1.5h limit", "burst", "Limit #5"]);
        assert_eq!(usage.limits[0].reset_hint.as_deref(), Some("resets in 120s"));
        assert_eq!(usage.limits[1].window_hours, Some(168.0));

        // 汇总来自第一个条目（只有 remaining），于是回退到最长窗口
        assert_eq!(usage.limit, Some(200));
        assert_eq!(usage.used, Some(20));
        assert_eq!(usage.remaining, Some(10));
        assert_eq!(usage.remaining_percent, Some(5.0));
    }

    #[test]
    fn email_extraction_order() {
        let usage = parse_usage(&json!({
            "email": "not-an-email",
            "data": {"account_email": "ops@example.com"},
            "account": {"email": "other@example.com"}
        }));
        assert_eq!(usage.email.as_deref(), Some("ops@example.com"));
    }

    #[test]
    fn non_object_payload_is_empty_usage() {
        let usage = parse_usage(&json!([1, 2, 3]));
        assert_eq!(usage.remaining_percent, None);
        assert!(usage.limits.is_empty());
    }
}
