//! # 代理服务器
//!
//! 在 `{base}/{*path}` 上挂载代理处理器，负责监听、后台任务生命周期与优雅停机。

use axum::Router;
use axum::routing::{MethodFilter, on};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use super::context::ProxyContext;
use super::handler::{proxy_path, proxy_root};
use crate::app::AppTasks;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{lerror, linfo};

/// 代理接受的方法
pub const PROXY_METHODS: MethodFilter = MethodFilter::GET
    .or(MethodFilter::POST)
    .or(MethodFilter::PUT)
    .or(MethodFilter::PATCH)
    .or(MethodFilter::DELETE)
    .or(MethodFilter::OPTIONS)
    .or(MethodFilter::HEAD);

/// 构建代理路由
pub fn build_router(ctx: Arc<ProxyContext>) -> Router {
    let base = match ctx.config.proxy_base_path.trim_end_matches('/') {
        "" => String::new(),
        base => base.to_string(),
    };

    let mut router = Router::new()
        .route(&format!("{base}/{{*path}}"), on(PROXY_METHODS, proxy_path))
        .route(&format!("{base}/"), on(PROXY_METHODS, proxy_root));
    if !base.is_empty() {
        router = router.route(&base, on(PROXY_METHODS, proxy_root));
    }

    router
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(ctx)
}

/// 代理服务器
pub struct ProxyServer {
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    #[must_use]
    pub const fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    /// 共享上下文
    #[must_use]
    pub fn context(&self) -> Arc<ProxyContext> {
        Arc::clone(&self.ctx)
    }

    /// 校验监听策略并绑定地址
    pub async fn bind(&self) -> Result<TcpListener> {
        let config = &self.ctx.config;
        config.ensure_bind_allowed()?;
        let (host, port) = config.listen_parts()?;
        TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| ProxyError::io(format!("监听 {host}:{port} 失败"), e))
    }

    /// 绑定并运行，直到 `shutdown` 完成
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// 在已绑定的监听器上服务；启动后台任务，停机后逆序停止
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tasks = AppTasks::new(&self.ctx);
        tasks.start_all().await?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::io("读取监听地址失败", e))?;
        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::ServerSetup,
            "proxy_started",
            "代理服务已启动",
            listen = %local_addr,
            base_path = %self.ctx.config.proxy_base_path,
            upstream = %self.ctx.config.upstream_base_url,
            keys = self.ctx.registry.len(),
            dry_run = self.ctx.config.dry_run
        );

        let served = axum::serve(listener, build_router(Arc::clone(&self.ctx)))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ProxyError::io("代理服务异常退出", e));
        if let Err(e) = &served {
            lerror!(
                "system",
                LogStage::Shutdown,
                LogComponent::ServerSetup,
                "proxy_serve_failed",
                "代理服务异常退出",
                error = %e
            );
        }

        tasks.shutdown().await;
        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::ServerSetup,
            "proxy_stopped",
            "代理服务已停止",
            trace_dropped = self.ctx.trace_writer.dropped()
        );
        served
    }
}
