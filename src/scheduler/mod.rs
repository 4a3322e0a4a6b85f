//! # 轮换调度模块
//!
//! 资格判定、评分与选择算法，以及封禁/耗尽原语

pub mod algorithms;
pub mod blocking;
pub mod types;

pub use algorithms::{
    is_eligible, manual_score, most_resourceful_index, next_healthy_index, revert_selection,
    rotate_manual, select_key_for_request, select_key_round_robin, usage_ok,
};
pub use blocking::{
    blocked_labels, clear_blocked, is_blocked, is_blocked_at, is_exhausted, is_exhausted_at,
    mark_blocked, mark_blocked_at, mark_exhausted, mark_exhausted_at,
};
pub use types::{CursorSnapshot, ManualRotation, ManualScore, Selection, UsagePolicy};
