//! # KMI Rotor
//!
//! 面向限流上游 API 的凭据轮换反向代理核心库：密钥注册表、轮换调度、
//! 健康评分、状态持久化、请求追踪与代理管线。

pub mod app;
pub mod config;
pub mod error;
pub mod health;
pub mod key_pool;
pub mod logging;
pub mod proxy;
pub mod scheduler;
pub mod state;
pub mod trace;
pub mod utils;

pub use config::AppConfig;
pub use error::{ProxyError, Result};
