//! # 健康刷新任务
//!
//! 每秒一轮：健康缓存过期时刷新，随后按间隔探测被封禁的密钥。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::proxy::ProxyContext;
use crate::{ldebug, linfo, lwarn};

/// 轮询间隔
pub const REFRESH_TICK: Duration = Duration::from_secs(1);

/// 后台健康刷新
#[derive(Clone)]
pub struct HealthRefreshTask {
    ctx: Arc<ProxyContext>,
    cancel: Arc<RwLock<Option<CancellationToken>>>,
    task_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl HealthRefreshTask {
    #[must_use]
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self {
            ctx,
            cancel: Arc::new(RwLock::new(None)),
            task_handle: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut handle = self.task_handle.write().await;
        if handle.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        *handle = Some(tokio::spawn(run(Arc::clone(&self.ctx), token.clone())));
        *self.cancel.write().await = Some(token);

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::HealthChecker,
            "health_refresh_started",
            "健康刷新任务已启动",
            usage_cache_seconds = self.ctx.config.usage_cache_seconds,
            blocklist_recheck_seconds = self.ctx.config.blocklist_recheck_seconds
        );
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(token) = self.cancel.write().await.take() {
            token.cancel();
        }
        let handle = self.task_handle.write().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                lwarn!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::HealthChecker,
                    "health_refresh_join_failed",
                    "健康刷新任务异常退出",
                    error = %e
                );
            }
        }
        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::HealthChecker,
            "health_refresh_stopped",
            "健康刷新任务已停止"
        );
    }
}

/// 执行一轮刷新；错误只记录日志
pub async fn run_cycle(ctx: &ProxyContext) {
    if let Err(e) = cycle(ctx).await {
        lwarn!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::HealthChecker,
            "health_refresh_error",
            "健康刷新失败",
            error = %e
        );
    }
}

async fn cycle(ctx: &ProxyContext) -> Result<()> {
    let refreshed = ctx.refresh_health().await?;
    let recovered = ctx.recheck_blocked().await?;
    if refreshed || recovered > 0 {
        ldebug!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::HealthChecker,
            "health_cycle_done",
            "健康刷新轮次完成",
            refreshed = refreshed,
            recovered = recovered
        );
    }
    Ok(())
}

async fn run(ctx: Arc<ProxyContext>, token: CancellationToken) {
    loop {
        run_cycle(&ctx).await;
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(REFRESH_TICK) => {}
        }
    }
}
