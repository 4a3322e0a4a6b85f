//! # 密钥选择算法
//!
//! 资格过滤、用量门控、手动评分、轮询以及请求时的密钥解析。
//! 所有函数都是同步的，调用方在共享状态锁内调用，保证选择与游标修改的原子性。

use std::cmp::Ordering;

use super::blocking::{is_blocked, is_exhausted};
use super::types::{CursorSnapshot, ManualRotation, ManualScore, Selection, UsagePolicy};
use crate::error::{ProxyError, Result};
use crate::health::{HealthInfo, HealthMap, HealthStatus};
use crate::key_pool::{KeyRecord, Registry};
use crate::state::RotationState;

/// 资格：未禁用、未封禁、未出现 401、未耗尽；提供健康表时还要求状态不是 blocked/exhausted
#[must_use]
pub fn is_eligible(key: &KeyRecord, state: &RotationState, health: Option<&HealthMap>) -> bool {
    if key.disabled || is_blocked(state, &key.label) {
        return false;
    }
    if state
        .key_state(&key.label)
        .is_some_and(|key_state| key_state.error_401 > 0)
    {
        return false;
    }
    if is_exhausted(state, &key.label) {
        return false;
    }
    health
        .and_then(|map| map.get(&key.label))
        .is_none_or(|info| !info.status.is_disqualifying())
}

/// 用量门控
#[must_use]
pub fn usage_ok(health: Option<&HealthMap>, label: &str, policy: UsagePolicy) -> bool {
    if !policy.require_usage_ok {
        return true;
    }
    match health {
        Some(map) if !map.is_empty() => map
            .get(label)
            .map_or(policy.fail_open_on_empty_cache, |info| info.usage_ok),
        _ => policy.fail_open_on_empty_cache,
    }
}

fn admissible(
    key: &KeyRecord,
    state: &RotationState,
    health: Option<&HealthMap>,
    policy: UsagePolicy,
) -> bool {
    is_eligible(key, state, health) && usage_ok(health, &key.label, policy)
}

/// 从 `active_index + 1` 开始向后扫描一圈，返回第一个可用下标
#[must_use]
pub fn next_healthy_index(
    registry: &Registry,
    state: &RotationState,
    health: Option<&HealthMap>,
    policy: UsagePolicy,
) -> Option<usize> {
    let total = registry.len();
    if total == 0 {
        return None;
    }
    let start = state.active_index % total;
    (1..=total)
        .map(|offset| (start + offset) % total)
        .find(|&index| admissible(&registry.keys()[index], state, health, policy))
}

/// 计算手动评分
#[must_use]
pub fn manual_score(info: Option<&HealthInfo>) -> ManualScore {
    let remaining = info.and_then(HealthInfo::resource_value);
    ManualScore {
        status_rank: info.map_or(2, |info| info.status.rank()),
        remaining_sort: remaining.map_or(1.0, |value| -value),
        error_rate: info.map_or(0.0, |info| info.error_rate),
    }
}

/// 候选排序：评分 → 是否当前（当前优先）→ 标签
fn candidate_order(
    a: (&KeyRecord, Option<&HealthInfo>, bool),
    b: (&KeyRecord, Option<&HealthInfo>, bool),
) -> Ordering {
    manual_score(a.1)
        .total_cmp(&manual_score(b.1))
        .then_with(|| b.2.cmp(&a.2))
        .then_with(|| a.0.label.cmp(&b.0.label))
}

type Candidate<'a> = (usize, &'a KeyRecord, Option<&'a HealthInfo>);

fn manual_candidates<'a>(
    registry: &'a Registry,
    state: &RotationState,
    health: Option<&'a HealthMap>,
) -> Vec<Candidate<'a>> {
    registry
        .keys()
        .iter()
        .enumerate()
        .filter(|(_, key)| is_eligible(key, state, health))
        .map(|(index, key)| (index, key, health.and_then(|map| map.get(&key.label))))
        .collect()
}

/// 资源最充足的可用下标；没有健康表时退化为 [`next_healthy_index`]
#[must_use]
pub fn most_resourceful_index(
    registry: &Registry,
    state: &RotationState,
    health: Option<&HealthMap>,
    policy: UsagePolicy,
) -> Option<usize> {
    if registry.is_empty() {
        return None;
    }
    if health.is_none() {
        return next_healthy_index(registry, state, health, policy);
    }
    let current = state.active_index;
    manual_candidates(registry, state, health)
        .into_iter()
        .min_by(|a, b| candidate_order((a.1, a.2, a.0 == current), (b.1, b.2, b.0 == current)))
        .map(|(index, _, _)| index)
}

/// 手动轮换
///
/// 当前密钥已是最佳时不切换，并按优先级给出原因：
/// 完全并列 > 剩余额度不同 > 错误率不同 > 状态不同 > 通用“已是最佳”。
/// `prefer_next_on_tie` 打开且存在多个并列最佳时，前进到下一个并列者。
pub fn rotate_manual(
    registry: &Registry,
    state: &mut RotationState,
    health: Option<&HealthMap>,
    prefer_next_on_tie: bool,
) -> Result<ManualRotation> {
    let current = state.active_index;

    let Some(health) = health else {
        let index = most_resourceful_index(registry, state, None, UsagePolicy::default())
            .ok_or_else(|| ProxyError::no_eligible_key("No eligible keys to rotate"))?;
        let rotated = index != current;
        return Ok(switch_to(registry, state, index, rotated, None));
    };

    let candidates = manual_candidates(registry, state, Some(health));
    if candidates.is_empty() {
        return Err(ProxyError::no_eligible_key("No eligible keys to rotate"));
    }

    let scored: Vec<(usize, ManualScore)> = candidates
        .iter()
        .map(|(index, _, info)| (*index, manual_score(*info)))
        .collect();
    let best_score = scored
        .iter()
        .map(|(_, score)| *score)
        .min_by(ManualScore::total_cmp)
        .ok_or_else(|| ProxyError::no_eligible_key("No eligible keys to rotate"))?;
    let best: Vec<usize> = scored
        .iter()
        .filter(|(_, score)| *score == best_score)
        .map(|(index, _)| *index)
        .collect();

    if let Some(position) = best.iter().position(|&index| index == current) {
        if prefer_next_on_tie && best.len() > 1 {
            let index = best[(position + 1) % best.len()];
            return Ok(switch_to(
                registry,
                state,
                index,
                true,
                Some("Tie for best score; rotating to next eligible.".to_string()),
            ));
        }
        let reason = keep_reason(&candidates, current, health.get(&registry.keys()[current].label));
        return Ok(switch_to(registry, state, current, false, reason));
    }

    let index = best[0];
    Ok(switch_to(registry, state, index, true, None))
}

fn switch_to(
    registry: &Registry,
    state: &mut RotationState,
    index: usize,
    rotated: bool,
    reason: Option<String>,
) -> ManualRotation {
    let label = registry.keys()[index].label.clone();
    if rotated {
        state.active_index = index;
        state.mark_last_used(&label);
    }
    ManualRotation {
        index,
        label,
        rotated,
        reason,
    }
}

/// 保持当前密钥时的原因
fn keep_reason(
    candidates: &[Candidate<'_>],
    current: usize,
    current_info: Option<&HealthInfo>,
) -> Option<String> {
    let mut sorted: Vec<&Candidate<'_>> = candidates.iter().collect();
    sorted.sort_by(|a, b| candidate_order((a.1, a.2, false), (b.1, b.2, false)));
    let runner = sorted.into_iter().find(|(index, _, _)| *index != current);

    let reason = runner.and_then(|(_, runner_key, runner_info)| {
        let runner_label = &runner_key.label;
        let current_remaining = current_info.and_then(HealthInfo::resource_value);
        let runner_remaining = runner_info.and_then(HealthInfo::resource_value);

        if manual_score(current_info) == manual_score(*runner_info) {
            return Some(current_remaining.map_or_else(
                || format!("Current key ties for best score. Keeping current over {runner_label}."),
                |remaining| {
                    format!(
                        "Current key ties for best remaining quota ({remaining:.0}%). Keeping current over {runner_label}."
                    )
                },
            ));
        }
        if let (Some(cur), Some(run)) = (current_remaining, runner_remaining) {
            return Some(format!(
                "Current key has higher remaining quota ({cur:.0}%), next best {runner_label} has {run:.0}%."
            ));
        }
        let (cur, run) = (current_info?, (*runner_info)?);
        if cur.error_rate != run.error_rate {
            return Some(format!(
                "Current key has lower error rate ({:.1}%), next best {runner_label} has {:.1}%.",
                cur.error_rate * 100.0,
                run.error_rate * 100.0
            ));
        }
        (cur.status != run.status).then(|| {
            format!(
                "Current key has better status ({}) than {runner_label} ({}).",
                cur.status, run.status
            )
        })
    });

    reason.or_else(|| {
        current_info.map(|info| format!("Current key already ranks best (status={}).", info.status))
    })
}

/// 轮询选择：第一轮只接受 healthy，第二轮接受任何可用密钥；游标总是前进到选中者之后
pub fn select_key_round_robin<'a>(
    registry: &'a Registry,
    state: &mut RotationState,
    health: Option<&HealthMap>,
    policy: UsagePolicy,
) -> Option<Selection<'a>> {
    let total = registry.len();
    if total == 0 {
        return None;
    }
    let start = state.rotation_index % total;
    let order = || (0..total).map(move |offset| (start + offset) % total);
    let keys = registry.keys();

    let healthy_pass = health.filter(|map| !map.is_empty()).and_then(|map| {
        order().find(|&index| {
            let key = &keys[index];
            map.get(&key.label)
                .is_some_and(|info| info.status == HealthStatus::Healthy)
                && admissible(key, state, Some(map), policy)
        })
    });
    let index = healthy_pass
        .or_else(|| order().find(|&index| admissible(&keys[index], state, health, policy)))?;

    state.rotation_index = (index + 1) % total;
    let replaced = state.mark_last_used(&keys[index].label);
    Some(Selection {
        index,
        key: &keys[index],
        replaced_last_used: Some(replaced),
    })
}

/// 请求时解析密钥
///
/// 自动轮换时走轮询；否则保留仍然可用的当前密钥，不可用时前进到下一个可用者并更新游标。
pub fn select_key_for_request<'a>(
    registry: &'a Registry,
    state: &mut RotationState,
    auto_rotate: bool,
    health: Option<&HealthMap>,
    policy: UsagePolicy,
) -> Option<Selection<'a>> {
    if auto_rotate {
        return select_key_round_robin(registry, state, health, policy);
    }
    let last = registry.len().checked_sub(1)?;
    let active = state.active_index.min(last);
    let active_key = &registry.keys()[active];
    if admissible(active_key, state, health, policy) {
        return Some(Selection {
            index: active,
            key: active_key,
            replaced_last_used: None,
        });
    }

    let index = next_healthy_index(registry, state, health, policy)?;
    let key = &registry.keys()[index];
    state.active_index = index;
    let replaced = state.mark_last_used(&key.label);
    Some(Selection {
        index,
        key,
        replaced_last_used: Some(replaced),
    })
}

/// 撤销一次选择：恢复游标与被选密钥的 `last_used`
///
/// 必须与选择处于同一段锁内，否则会覆盖其他请求的游标推进。
pub fn revert_selection(state: &mut RotationState, cursor: CursorSnapshot, selection: &Selection<'_>) {
    state.active_index = cursor.active_index;
    state.rotation_index = cursor.rotation_index;
    if let Some(previous) = &selection.replaced_last_used {
        state.key_state_mut(&selection.key.label).last_used = previous.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use crate::scheduler::blocking::{mark_blocked, mark_exhausted};
    use pretty_assertions::assert_eq;

    fn registry(labels: &[&str]) -> Registry {
        Registry::from_records(
            labels
                .iter()
                .map(|label| KeyRecord::new(*label, format!("sk-{label}"), 0, false)),
        )
    }

    fn info(status: HealthStatus, remaining: Option<f64>, error_rate: f64) -> HealthInfo {
        HealthInfo {
            status,
            remaining_percent: remaining,
            used: None,
            limit: None,
            remaining: None,
            reset_hint: None,
            limits: Vec::new(),
            error_rate,
            email: None,
            usage_ok: remaining.is_none_or(|value| value > 0.0),
        }
    }

    fn fresh_state(registry: &Registry) -> RotationState {
        let mut state = RotationState::default();
        state.reconcile(registry);
        state
    }

    #[test]
    fn round_robin_visits_each_key_once_per_cycle() {
        let registry = registry(&["a", "b", "c"]);
        let mut state = fresh_state(&registry);
        let picked: Vec<String> = (0..6)
            .filter_map(|_| {
                select_key_round_robin(&registry, &mut state, None, UsagePolicy::default())
                    .map(|selection| selection.key.label.clone())
            })
            .collect();
        assert_eq!(picked, vec!["a", "b", "c", "a", "b", "c"]);
        assert_eq!(state.rotation_index, 0);
    }

    #[test]
    fn round_robin_prefers_healthy_then_falls_back() {
        let registry = registry(&["a", "b"]);
        let mut state = fresh_state(&registry);
        let mut health = HealthMap::new();
        health.insert("a".into(), info(HealthStatus::Warn, Some(50.0), 0.0));
        health.insert("b".into(), info(HealthStatus::Healthy, Some(50.0), 0.0));

        let first = select_key_round_robin(&registry, &mut state, Some(&health), UsagePolicy::default());
        assert_eq!(first.map(|s| s.index), Some(1));

        health.insert("b".into(), info(HealthStatus::Warn, Some(50.0), 0.0));
        let second = select_key_round_robin(&registry, &mut state, Some(&health), UsagePolicy::default());
        assert_eq!(second.map(|s| s.index), Some(0));
    }

    #[test]
    fn blocked_and_exhausted_keys_are_never_selected() {
        let registry = registry(&["a", "b", "c"]);
        let mut state = fresh_state(&registry);
        mark_blocked(&mut state, "a", "payment_required", None);
        mark_exhausted(&mut state, "b", 600);

        for _ in 0..4 {
            let selection =
                select_key_round_robin(&registry, &mut state, None, UsagePolicy::default());
            assert_eq!(selection.map(|s| s.key.label.as_str()), Some("c"));
        }
        assert!(
            select_key_for_request(&registry, &mut state, false, None, UsagePolicy::default())
                .is_some_and(|s| s.key.label == "c")
        );
        assert_eq!(state.active_index, 2);
    }

    #[test]
    fn unauthorized_or_disabled_keys_are_ineligible() {
        let registry = Registry::from_records([
            KeyRecord::new("a", "sk-a", 0, true),
            KeyRecord::new("b", "sk-b", 0, false),
        ]);
        let mut state = fresh_state(&registry);
        state.record_request("b", 401);
        assert!(!is_eligible(&registry.keys()[0], &state, None));
        assert!(!is_eligible(&registry.keys()[1], &state, None));
        assert!(select_key_for_request(&registry, &mut state, true, None, UsagePolicy::default()).is_none());
    }

    #[test]
    fn usage_gate_honours_fail_open() {
        let strict = UsagePolicy::new(true, false);
        let open = UsagePolicy::new(true, true);
        let empty = HealthMap::new();
        assert!(!usage_ok(None, "a", strict));
        assert!(usage_ok(None, "a", open));
        assert!(!usage_ok(Some(&empty), "a", strict));
        assert!(usage_ok(Some(&empty), "a", UsagePolicy::default()));

        let mut health = HealthMap::new();
        health.insert("a".into(), info(HealthStatus::Blocked, Some(0.0), 0.0));
        assert!(!usage_ok(Some(&health), "a", open));
        assert!(!usage_ok(Some(&health), "missing", strict));
        assert!(usage_ok(Some(&health), "missing", open));
    }

    #[test]
    fn manual_rotation_moves_to_most_remaining_quota() {
        let registry = registry(&["a", "b"]);
        let mut state = fresh_state(&registry);
        let mut health = HealthMap::new();
        health.insert("a".into(), info(HealthStatus::Healthy, Some(30.0), 0.0));
        health.insert("b".into(), info(HealthStatus::Healthy, Some(70.0), 0.0));

        let outcome = rotate_manual(&registry, &mut state, Some(&health), false).unwrap();
        assert_eq!(outcome.label, "b");
        assert!(outcome.rotated);
        assert_eq!(outcome.reason, None);
        assert_eq!(state.active_index, 1);

        let again = rotate_manual(&registry, &mut state, Some(&health), false).unwrap();
        assert!(!again.rotated);
        assert_eq!(again.label, "b");
        assert_eq!(
            again.reason.as_deref(),
            Some("Current key has higher remaining quota (70%), next best a has 30%.")
        );
    }

    #[test]
    fn manual_rotation_tie_handling() {
        let registry = registry(&["a", "b"]);
        let mut state = fresh_state(&registry);
        let mut health = HealthMap::new();
        health.insert("a".into(), info(HealthStatus::Healthy, Some(50.0), 0.0));
        health.insert("b".into(), info(HealthStatus::Healthy, Some(50.0), 0.0));

        let kept = rotate_manual(&registry, &mut state, Some(&health), false).unwrap();
        assert!(!kept.rotated);
        assert_eq!(
            kept.reason.as_deref(),
            Some("Current key ties for best remaining quota (50%). Keeping current over b.")
        );

        let moved = rotate_manual(&registry, &mut state, Some(&health), true).unwrap();
        assert!(moved.rotated);
        assert_eq!(moved.label, "b");
        assert_eq!(
            moved.reason.as_deref(),
            Some("Tie for best score; rotating to next eligible.")
        );
    }

    #[test]
    fn manual_rotation_explains_status_and_error_rate() {
        let registry = registry(&["a", "b"]);
        let mut state = fresh_state(&registry);
        let mut health = HealthMap::new();
        health.insert("a".into(), info(HealthStatus::Healthy, None, 0.01));
        health.insert("b".into(), info(HealthStatus::Healthy, None, 0.2));
        let outcome = rotate_manual(&registry, &mut state, Some(&health), false).unwrap();
        assert_eq!(
            outcome.reason.as_deref(),
            Some("Current key has lower error rate (1.0%), next best b has 20.0%.")
        );

        health.insert("b".into(), info(HealthStatus::Warn, None, 0.01));
        let outcome = rotate_manual(&registry, &mut state, Some(&health), false).unwrap();
        assert_eq!(
            outcome.reason.as_deref(),
            Some("Current key has better status (healthy) than b (warn).")
        );
    }

    #[test]
    fn manual_rotation_without_eligible_keys_fails() {
        let registry = registry(&["a"]);
        let mut state = fresh_state(&registry);
        mark_blocked(&mut state, "a", "manual", None);
        let err = rotate_manual(&registry, &mut state, Some(&HealthMap::new()), false).unwrap_err();
        assert!(matches!(err, ProxyError::NoEligibleKey { .. }));
        assert!(rotate_manual(&registry, &mut state, None, false).is_err());
    }

    #[test]
    fn manual_rotation_without_health_advances_to_next() {
        let registry = registry(&["a", "b", "c"]);
        let mut state = fresh_state(&registry);
        let outcome = rotate_manual(&registry, &mut state, None, false).unwrap();
        assert_eq!(outcome.index, 1);
        assert!(outcome.rotated);
    }

    #[test]
    fn sticky_selection_keeps_active_key() {
        let registry = registry(&["a", "b"]);
        let mut state = fresh_state(&registry);
        state.active_index = 1;
        for _ in 0..3 {
            let selection =
                select_key_for_request(&registry, &mut state, false, None, UsagePolicy::default());
            assert_eq!(selection.map(|s| s.index), Some(1));
        }
        assert!(select_key_for_request(&Registry::default(), &mut state, false, None, UsagePolicy::default()).is_none());
    }

    #[test]
    fn reverting_a_selection_restores_cursor_and_last_used() {
        let registry = registry(&["a", "b"]);
        let mut state = fresh_state(&registry);
        state.key_state_mut("a").last_used = Some("2026-01-01T00:00:00Z".into());
        let before = state.clone();

        let cursor = CursorSnapshot::capture(&state);
        let selection =
            select_key_round_robin(&registry, &mut state, None, UsagePolicy::default()).unwrap();
        assert_eq!(selection.key.label, "a");
        assert_ne!(state, before);
        revert_selection(&mut state, cursor, &selection);
        assert_eq!(state, before);

        state.active_index = 0;
        mark_blocked(&mut state, "a", "test", None);
        let before = state.clone();
        let cursor = CursorSnapshot::capture(&state);
        let selection =
            select_key_for_request(&registry, &mut state, false, None, UsagePolicy::default())
                .unwrap();
        assert_eq!(selection.key.label, "b");
        revert_selection(&mut state, cursor, &selection);
        assert_eq!(state, before);
    }

    #[test]
    fn most_resourceful_prefers_current_on_tie() {
        let registry = registry(&["a", "b"]);
        let mut state = fresh_state(&registry);
        state.active_index = 1;
        let mut health = HealthMap::new();
        health.insert("a".into(), info(HealthStatus::Healthy, Some(40.0), 0.0));
        health.insert("b".into(), info(HealthStatus::Healthy, Some(40.0), 0.0));
        assert_eq!(
            most_resourceful_index(&registry, &state, Some(&health), UsagePolicy::default()),
            Some(1)
        );
    }
}
