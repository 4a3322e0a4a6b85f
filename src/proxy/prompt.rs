//! # 提示词预览
//!
//! 从聊天类 JSON 请求体中截取一段简短预览写入追踪记录，不保存完整内容。

use serde_json::Value;

const MAX_WORDS: usize = 6;
const MAX_CHARS: usize = 60;

/// 提示词预览
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptPreview {
    /// 截断后的预览
    pub hint: String,
    /// 第一个词
    pub head: String,
}

fn coerce_text(value: &Value) -> Option<&str> {
    match value {
        Value::String(text) => Some(text.as_str()),
        Value::Object(map) => map
            .get("text")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .or_else(|| map.get("content").and_then(Value::as_str)),
        Value::Array(items) => items.iter().find_map(coerce_text),
        _ => None,
    }
    .filter(|text| !text.is_empty())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 最多保留 6 个词、60 个字符，截断时追加 `...`
#[must_use]
pub fn trim_prompt(text: &str) -> String {
    let cleaned = collapse_whitespace(text);
    if cleaned.is_empty() {
        return String::new();
    }
    let mut trimmed = cleaned
        .split(' ')
        .take(MAX_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    if trimmed.chars().count() > MAX_CHARS {
        trimmed = trimmed.chars().take(MAX_CHARS).collect::<String>();
        trimmed.truncate(trimmed.trim_end().len());
    }
    if trimmed == cleaned {
        trimmed
    } else {
        format!("{trimmed}...")
    }
}

/// 第一个词
#[must_use]
pub fn first_word(text: &str) -> String {
    text.split_whitespace().next().unwrap_or_default().to_string()
}

/// 从请求体提取预览：最后一条有内容的消息优先，其次 prompt/input/query/text 字段
#[must_use]
pub fn extract_prompt_preview(body: &[u8], content_type: &str) -> PromptPreview {
    if body.is_empty() || !content_type.to_lowercase().contains("json") {
        return PromptPreview::default();
    }
    let Ok(payload) = serde_json::from_slice::<Value>(body) else {
        return PromptPreview::default();
    };
    let Value::Object(map) = &payload else {
        return PromptPreview::default();
    };

    let from_messages = map
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| {
            messages
                .iter()
                .rev()
                .find_map(|message| message.get("content").and_then(coerce_text))
        });
    let text = from_messages.or_else(|| {
        ["prompt", "input", "query", "text"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
    });

    match text {
        Some(text) if !text.is_empty() => PromptPreview {
            hint: trim_prompt(text),
            head: first_word(text),
        },
        _ => PromptPreview::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_uses_last_message_with_content() {
        let body = br#"{"messages":[{"role":"user","content":"first question"},{"role":"assistant","content":""},{"role":"user","content":[{"type":"text","text":"Explain   the borrow checker in plain words please now"}]}]}"#;
        let preview = extract_prompt_preview(body, "application/json");
        assert_eq!(preview.hint, "Explain the borrow checker in plain...");
        assert_eq!(preview.head, "Explain");
    }

    #[test]
    fn preview_falls_back_to_prompt_fields() {
        let preview = extract_prompt_preview(br#"{"input":"short one"}"#, "application/json; charset=utf-8");
        assert_eq!(preview.hint, "short one");
        assert_eq!(preview.head, "short");
    }

    #[test]
    fn non_json_or_invalid_bodies_yield_nothing() {
        assert_eq!(extract_prompt_preview(b"hello", "text/plain"), PromptPreview::default());
        assert_eq!(extract_prompt_preview(b"{oops", "application/json"), PromptPreview::default());
        assert_eq!(extract_prompt_preview(b"[1,2]", "application/json"), PromptPreview::default());
    }

    #[test]
    fn long_words_are_cut_at_char_limit() {
        let word = "x".repeat(80);
        let trimmed = trim_prompt(&word);
        assert_eq!(trimmed.chars().count(), 63);
        assert!(trimmed.ends_with("..."));
    }
}
