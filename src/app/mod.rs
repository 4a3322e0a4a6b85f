//! # 应用生命周期
//!
//! 后台任务的顺序启动与逆序停止。

pub mod health_refresh;
pub mod tasks;

pub use health_refresh::HealthRefreshTask;
pub use tasks::{AppTasks, TaskType};
