//! # 请求追踪
//!
//! 每个代理请求一条 JSON Lines 记录，以及用于诊断密钥分布的读取工具

pub mod reader;
pub mod types;
pub mod writer;

pub use reader::{DEFAULT_TRACE_WINDOW, compute_confidence, load_trace_entries};
pub use types::{TraceEntry, TraceErrorCode};
pub use writer::{TraceFileConfig, TraceWriter, append_trace};
