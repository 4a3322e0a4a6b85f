//! # 上游响应分类
//!
//! 从错误响应体提取可读提示，识别付费/余额类失败，给出状态码提示。

use serde_json::Value;

/// 付费/余额相关关键词（含中文）
pub const PAYMENT_ERROR_TOKENS: [&str; 24] = [
    "payment",
    "payment_required",
    "natpament",
    "notpayment",
    "billing",
    "balance",
    "insufficient_balance",
    "insufficient_quota",
    "balance_insufficient",
    "credit",
    "subscription",
    "plan",
    "top up",
    "top-up",
    "recharge",
    "余额不足",
    "账户余额不足",
    "请充值",
    "充值",
    "欠费",
    "未付费",
    "未支付",
    "订阅",
    "套餐",
];

/// 递归展开的错误字段
const ERROR_FIELDS: [&str; 13] = [
    "error",
    "message",
    "code",
    "error_code",
    "errorcode",
    "err_code",
    "errcode",
    "type",
    "detail",
    "title",
    "status",
    "status_code",
    "reason",
];

const MAX_DEPTH: usize = 100;

/// 没有可用密钥时返回给调用方的修复建议
pub const REMEDIATION_MESSAGE: &str = "All keys are unavailable.\n\
Next steps:\n\
- Check _auths/ for valid KMI_API_KEY entries\n\
- Verify quotas via /usages\n\
- Wait for cooldown if keys were rate-limited\n\
- Disable auto-rotation if prohibited by your provider";

fn collect_error_strings(payload: &Value, bucket: &mut Vec<String>, depth: usize) {
    if depth > MAX_DEPTH {
        return;
    }
    match payload {
        Value::Object(map) => {
            for (key, value) in map {
                let key = key.to_lowercase();
                if ERROR_FIELDS.contains(&key.as_str()) {
                    collect_error_strings(value, bucket, depth + 1);
                } else if key.starts_with("error") {
                    if let Value::String(text) = value {
                        bucket.push(text.clone());
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_error_strings(item, bucket, depth + 1);
            }
        }
        Value::String(text) => bucket.push(text.clone()),
        Value::Number(number) => bucket.push(number.to_string()),
        Value::Bool(_) | Value::Null => {}
    }
}

/// 提取错误提示：JSON 时拼接各错误字段，否则回退为原始文本
#[must_use]
pub fn extract_error_hint(content: &[u8], content_type: &str) -> String {
    let text = String::from_utf8_lossy(content);
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    if !content_type.to_lowercase().contains("json") && !text.starts_with('{') {
        return text.to_string();
    }
    let Ok(payload) = serde_json::from_str::<Value>(text) else {
        return text.to_string();
    };
    let mut parts = Vec::new();
    collect_error_strings(&payload, &mut parts, 0);
    if parts.is_empty() {
        text.to_string()
    } else {
        parts.join(" ")
    }
}

/// 402 一律视为付费失败；400/403 按关键词匹配
#[must_use]
pub fn looks_like_payment_error(status: u16, hint: &str) -> bool {
    match status {
        402 => true,
        400 | 403 => {
            let lowered = hint.to_lowercase();
            PAYMENT_ERROR_TOKENS
                .iter()
                .any(|token| lowered.contains(token))
        }
        _ => false,
    }
}

/// 状态码的粗分类
#[must_use]
pub const fn status_hint(status: u16) -> &'static str {
    match status {
        401 | 403 => "blocked",
        429 => "rate_limited",
        500..=599 => "upstream_error",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn hint_walks_nested_error_fields() {
        let body = br#"{"error":{"message":"Insufficient balance","type":"insufficient_balance","param":"x"},"error_id":"abc","id":"ignored"}"#;
        let hint = extract_error_hint(body, "application/json");
        assert!(hint.contains("Insufficient balance"));
        assert!(hint.contains("insufficient_balance"));
        assert!(hint.contains("abc"));
        assert!(!hint.contains("ignored"));
        assert!(!hint.contains('x'));
    }

    #[test]
    fn hint_falls_back_to_raw_text() {
        assert_eq!(extract_error_hint(b"  upstream down  ", "text/plain"), "upstream down");
        assert_eq!(extract_error_hint(b"{not json", "application/json"), "{not json");
        assert_eq!(extract_error_hint(br#"{"id":1}"#, ""), r#"{"id":1}"#);
        assert_eq!(extract_error_hint(b"", "application/json"), "");
    }

    #[rstest]
    #[case(402, "", true)]
    #[case(403, "insufficient_balance", true)]
    #[case(400, "账户余额不足，请充值", true)]
    #[case(403, "Forbidden", false)]
    #[case(429, "billing", false)]
    fn payment_detection(#[case] status: u16, #[case] hint: &str, #[case] expected: bool) {
        assert_eq!(looks_like_payment_error(status, hint), expected);
    }

    #[rstest]
    #[case(401, "blocked")]
    #[case(403, "blocked")]
    #[case(429, "rate_limited")]
    #[case(503, "upstream_error")]
    #[case(404, "unknown")]
    fn status_hints(#[case] status: u16, #[case] expected: &str) {
        assert_eq!(status_hint(status), expected);
    }
}
