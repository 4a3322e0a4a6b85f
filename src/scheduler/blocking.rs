//! # 封禁与耗尽原语
//!
//! 封禁是较长期的排除（付费失败或人工操作），耗尽是限流/服务端错误触发的短期冷却。
//! 时间戳格式损坏时：封禁视为仍然有效，耗尽视为已经结束。

use chrono::{DateTime, Duration, Utc};

use crate::state::{KeyState, RotationState};
use crate::utils::time;

/// 封禁标签；`ttl_seconds` 为 `None` 或 0 时无限期，直到显式解除
pub fn mark_blocked(state: &mut RotationState, label: &str, reason: &str, ttl_seconds: Option<u64>) {
    mark_blocked_at(state, label, reason, ttl_seconds, time::now_utc());
}

/// 以指定时间为基准封禁
pub fn mark_blocked_at(
    state: &mut RotationState,
    label: &str,
    reason: &str,
    ttl_seconds: Option<u64>,
    now: DateTime<Utc>,
) {
    let key_state = state.key_state_mut(label);
    key_state.blocked_reason = Some(reason.to_string());
    key_state.blocked_until = ttl_seconds
        .filter(|ttl| *ttl > 0)
        .map(|ttl| time::to_iso(now + seconds(ttl)));
}

/// 解除封禁，`label` 为 `None` 时解除全部；返回实际改动的数量
pub fn clear_blocked(state: &mut RotationState, label: Option<&str>) -> usize {
    let clear = |key_state: &mut KeyState| -> usize {
        if key_state.blocked_reason.is_none() && key_state.blocked_until.is_none() {
            return 0;
        }
        key_state.blocked_reason = None;
        key_state.blocked_until = None;
        1
    };
    match label {
        Some(label) => state.keys.get_mut(label).map_or(0, clear),
        None => state.keys.values_mut().map(clear).sum(),
    }
}

/// 当前是否处于封禁
#[must_use]
pub fn is_blocked(state: &RotationState, label: &str) -> bool {
    is_blocked_at(state, label, time::now_utc())
}

/// 指定时间是否处于封禁
#[must_use]
pub fn is_blocked_at(state: &RotationState, label: &str, now: DateTime<Utc>) -> bool {
    let Some(key_state) = state.key_state(label) else {
        return false;
    };
    match (&key_state.blocked_reason, &key_state.blocked_until) {
        (None, None) => false,
        (_, Some(until)) if !until.is_empty() => time::parse_iso(until).is_none_or(|until| now < until),
        _ => true,
    }
}

/// 设置耗尽冷却；标签尚无状态时一并创建
pub fn mark_exhausted(state: &mut RotationState, label: &str, cooldown_seconds: u64) {
    mark_exhausted_at(state, label, cooldown_seconds, time::now_utc());
}

/// 以指定时间为基准设置耗尽冷却
pub fn mark_exhausted_at(
    state: &mut RotationState,
    label: &str,
    cooldown_seconds: u64,
    now: DateTime<Utc>,
) {
    state.key_state_mut(label).exhausted_until = Some(time::to_iso(now + seconds(cooldown_seconds)));
}

/// 当前是否处于耗尽冷却
#[must_use]
pub fn is_exhausted(state: &RotationState, label: &str) -> bool {
    is_exhausted_at(state, label, time::now_utc())
}

/// 指定时间是否处于耗尽冷却
#[must_use]
pub fn is_exhausted_at(state: &RotationState, label: &str, now: DateTime<Utc>) -> bool {
    state
        .key_state(label)
        .and_then(|key_state| key_state.exhausted_until.as_deref())
        .and_then(time::parse_iso)
        .is_some_and(|until| now < until)
}

/// 当前被封禁的标签，按标签排序
#[must_use]
pub fn blocked_labels(state: &RotationState) -> Vec<String> {
    let now = time::now_utc();
    state
        .keys
        .keys()
        .filter(|label| is_blocked_at(state, label, now))
        .cloned()
        .collect()
}

fn seconds(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn ttl_block_expires_and_never_flips_back() {
        let mut state = RotationState::default();
        mark_blocked_at(&mut state, "a", "payment_required", Some(3600), at(0));
        assert!(is_blocked_at(&state, "a", at(0)));
        assert!(!is_blocked_at(&state, "a", at(1)));
        assert!(!is_blocked_at(&state, "a", at(5)));
        assert_eq!(state.keys["a"].blocked_reason.as_deref(), Some("payment_required"));
    }

    #[test]
    fn zero_ttl_is_indefinite() {
        let mut state = RotationState::default();
        mark_blocked(&mut state, "a", "manual", Some(0));
        assert!(state.keys["a"].blocked_until.is_none());
        assert!(is_blocked(&state, "a"));
        mark_blocked(&mut state, "b", "manual", None);
        assert!(is_blocked(&state, "b"));
    }

    #[test]
    fn malformed_timestamps_are_asymmetric() {
        let mut state = RotationState::default();
        let key = state.key_state_mut("a");
        key.blocked_until = Some("garbage".to_string());
        key.exhausted_until = Some("garbage".to_string());
        assert!(is_blocked(&state, "a"));
        assert!(!is_exhausted(&state, "a"));
    }

    #[test]
    fn clear_blocked_counts_changes() {
        let mut state = RotationState::default();
        mark_blocked(&mut state, "a", "x", None);
        mark_blocked(&mut state, "b", "y", Some(60));
        state.key_state_mut("c");
        assert_eq!(clear_blocked(&mut state, Some("missing")), 0);
        assert_eq!(clear_blocked(&mut state, Some("a")), 1);
        assert_eq!(clear_blocked(&mut state, Some("a")), 0);
        assert_eq!(clear_blocked(&mut state, None), 1);
        assert!(blocked_labels(&state).is_empty());
    }

    #[test]
    fn exhaustion_creates_state_and_expires() {
        let mut state = RotationState::default();
        mark_exhausted_at(&mut state, "new", 30, at(2));
        assert_eq!(state.keys["new"].exhausted_until.as_deref(), Some("2024-05-01T02:00:30Z"));
        assert!(is_exhausted_at(&state, "new", at(2)));
        assert!(!is_exhausted_at(&state, "new", at(3)));
        assert!(!is_exhausted(&state, "unknown"));
    }
}
