//! # 防抖状态写入器
//!
//! 请求路径只标记脏位并发信号，后台任务在防抖窗口后合并写入一次。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use super::store::StateStore;
use super::types::RotationState;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lerror};

/// 防抖状态写入器
#[derive(Debug)]
pub struct StateWriter {
    store: StateStore,
    state: Arc<Mutex<RotationState>>,
    debounce: Duration,
    shared: Arc<WriterShared>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Default)]
struct WriterShared {
    dirty: AtomicBool,
    stopping: AtomicBool,
    notify: Notify,
}

impl StateWriter {
    /// 创建写入器，尚未启动后台任务
    #[must_use]
    pub fn new(store: StateStore, state: Arc<Mutex<RotationState>>, debounce: Duration) -> Self {
        Self {
            store,
            state,
            debounce,
            shared: Arc::new(WriterShared::default()),
            handle: std::sync::Mutex::new(None),
        }
    }

    /// 启动后台任务；重复调用无效果
    pub fn start(&self) {
        let mut handle = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if handle.is_some() {
            return;
        }
        self.shared.stopping.store(false, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let state = Arc::clone(&self.state);
        let store = self.store.clone();
        let debounce = self.debounce;

        *handle = Some(tokio::spawn(async move {
            loop {
                shared.notify.notified().await;
                if shared.stopping.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(debounce).await;
                if shared.dirty.swap(false, Ordering::SeqCst) {
                    flush(&store, &state).await;
                }
            }
            if shared.dirty.swap(false, Ordering::SeqCst) {
                flush(&store, &state).await;
            }
        }));

        ldebug!(
            "system",
            LogStage::Startup,
            LogComponent::StateStore,
            "state_writer_started",
            "状态写入器已启动",
            debounce_ms = u64::try_from(self.debounce.as_millis()).unwrap_or(u64::MAX)
        );
    }

    /// 是否有后台任务在运行
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }

    /// 请求保存：后台任务运行时合并写入，否则立即同步写入
    pub async fn request_save(&self) -> Result<()> {
        if self.is_running() {
            self.shared.dirty.store(true, Ordering::SeqCst);
            self.shared.notify.notify_one();
            return Ok(());
        }
        let snapshot = self.state.lock().await.clone();
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&snapshot)).await?
    }

    /// 停止后台任务并等待最后一次写入完成
    pub async fn stop(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
        if let Err(e) = handle.await {
            lerror!(
                "system",
                LogStage::Shutdown,
                LogComponent::StateStore,
                "state_writer_join_failed",
                "状态写入任务异常退出",
                error = %e
            );
        }
    }
}

async fn flush(store: &StateStore, state: &Arc<Mutex<RotationState>>) {
    let snapshot = state.lock().await.clone();
    let store = store.clone();
    let result = tokio::task::spawn_blocking(move || store.save(&snapshot)).await;
    let error = match result {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(e) => e.to_string(),
    };
    lerror!(
        "system",
        LogStage::Persistence,
        LogComponent::StateStore,
        "state_save_failed",
        "状态保存失败",
        error = %error
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saves_synchronously_without_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::in_dir(dir.path());
        let state = Arc::new(Mutex::new(RotationState::default()));
        let writer = StateWriter::new(store.clone(), Arc::clone(&state), Duration::from_millis(10));

        state.lock().await.record_request("a", 200);
        writer.request_save().await.unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("\"request_count\": 1"));
    }

    #[tokio::test]
    async fn coalesces_and_flushes_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::in_dir(dir.path());
        let state = Arc::new(Mutex::new(RotationState::default()));
        let writer = StateWriter::new(store.clone(), Arc::clone(&state), Duration::from_millis(20));
        writer.start();

        for _ in 0..5 {
            state.lock().await.record_request("a", 429);
            writer.request_save().await.unwrap();
        }
        writer.stop().await;

        let saved: RotationState =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(saved.keys["a"].error_429, 5);
        assert!(!writer.is_running());
    }
}
