//! # 轮换状态模块
//!
//! 持久化的轮换状态、跨进程文件锁、原子写入以及防抖写入器

pub mod lock;
pub mod store;
pub mod types;
pub mod writer;

pub use store::StateStore;
pub use types::{KeyState, RotationState, STATE_SCHEMA_VERSION};
pub use writer::StateWriter;
