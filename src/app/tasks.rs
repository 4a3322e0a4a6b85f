//! # 后台任务
//!
//! 写入器先于健康刷新启动，停止时逆序：健康刷新先停，写入器最后把剩余数据落盘。
//! 启动中途失败时，已启动的任务会被逆序停止。

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::app::health_refresh::HealthRefreshTask;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::proxy::ProxyContext;
use crate::{lerror, linfo};

/// 后台任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// 防抖状态写入
    StateWriter,
    /// 追踪队列写入
    TraceWriter,
    /// 健康刷新与封禁复查
    HealthRefresh,
}

impl TaskType {
    /// 启动顺序
    pub const STARTUP_ORDER: [Self; 3] = [Self::StateWriter, Self::TraceWriter, Self::HealthRefresh];

    /// 日志名
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StateWriter => "state_writer",
            Self::TraceWriter => "trace_writer",
            Self::HealthRefresh => "health_refresh",
        }
    }
}

/// 后台任务集合
pub struct AppTasks {
    ctx: Arc<ProxyContext>,
    health_refresh: HealthRefreshTask,
    started: Mutex<Vec<TaskType>>,
}

impl AppTasks {
    /// 绑定上下文，尚未启动任何任务
    #[must_use]
    pub fn new(ctx: &Arc<ProxyContext>) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            health_refresh: HealthRefreshTask::new(Arc::clone(ctx)),
            started: Mutex::new(Vec::new()),
        }
    }

    /// 按顺序启动全部任务；重复调用只启动尚未运行的任务
    pub async fn start_all(&self) -> Result<()> {
        let mut started = self.started.lock().await;
        for task in TaskType::STARTUP_ORDER {
            if started.contains(&task) {
                continue;
            }
            if let Err(e) = self.start_one(task).await {
                lerror!(
                    "system",
                    LogStage::BackgroundTask,
                    LogComponent::ServerSetup,
                    "task_start_failed",
                    "后台任务启动失败，回滚已启动的任务",
                    task = task.as_str(),
                    error = %e
                );
                while let Some(running) = started.pop() {
                    self.stop_one(running).await;
                }
                return Err(e);
            }
            started.push(task);
        }
        Ok(())
    }

    /// 逆序停止已启动的任务
    pub async fn shutdown(&self) {
        let mut started = self.started.lock().await;
        while let Some(task) = started.pop() {
            self.stop_one(task).await;
        }
    }

    /// 正在运行的任务，按启动顺序
    pub async fn running(&self) -> Vec<TaskType> {
        self.started.lock().await.clone()
    }

    async fn start_one(&self, task: TaskType) -> Result<()> {
        linfo!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::ServerSetup,
            "task_start",
            "启动后台任务",
            task = task.as_str()
        );
        match task {
            TaskType::StateWriter => self.ctx.state_writer.start(),
            TaskType::TraceWriter => self.ctx.trace_writer.start(),
            TaskType::HealthRefresh => self.health_refresh.start().await?,
        }
        Ok(())
    }

    async fn stop_one(&self, task: TaskType) {
        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::ServerSetup,
            "task_stop",
            "停止后台任务",
            task = task.as_str()
        );
        match task {
            TaskType::StateWriter => self.ctx.state_writer.stop().await,
            TaskType::TraceWriter => self.ctx.trace_writer.stop().await,
            TaskType::HealthRefresh => self.health_refresh.stop().await,
        }
    }
}
