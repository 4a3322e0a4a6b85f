//! The unified error handling system for the application.

use std::fmt::Display;

pub use types::{ProxyError, RateLimitScope};

/// A unified `Result` type for the entire application.
pub type Result<T> = std::result::Result<T, ProxyError>;

pub mod conversion;
pub mod macros;
pub mod types;

/// Context trait for adding context to errors.
pub trait Context<T, E> {
    /// 附加固定上下文
    #[track_caller]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display;

    /// 惰性附加上下文
    #[track_caller]
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: Into<ProxyError>,
{
    #[track_caller]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display,
    {
        self.with_context(|| context)
    }

    #[track_caller]
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display,
    {
        match self {
            Ok(value) => Ok(value),
            Err(error) => Err(ProxyError::Context {
                context: context().to_string(),
                source: Box::new(error.into()),
            }),
        }
    }
}

/// Error category for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// 4xx
    Client,
    /// 5xx
    Server,
}

impl ProxyError {
    /// 错误分类
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        if self.to_http_response_parts().0.is_client_error() {
            ErrorCategory::Client
        } else {
            ErrorCategory::Server
        }
    }
}
