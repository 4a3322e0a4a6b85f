//! # 追踪写入器
//!
//! 请求路径只做非阻塞入队，队列满时丢弃并计数；后台任务逐条追加到 JSON Lines 文件，
//! 文件超过阈值时轮转编号备份。

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::types::TraceEntry;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::state::lock::{FileLock, sibling_path};
use crate::{ldebug, lerror, lwarn};

/// 文件轮转参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFileConfig {
    /// 追踪文件路径
    pub path: PathBuf,
    /// 超过该字节数时轮转，0 表示不轮转
    pub max_bytes: u64,
    /// 保留的备份数量
    pub max_backups: usize,
}

/// 追踪写入器
#[derive(Debug)]
pub struct TraceWriter {
    file: TraceFileConfig,
    capacity: usize,
    dropped: AtomicU64,
    sender: Mutex<Option<mpsc::Sender<TraceEntry>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TraceWriter {
    /// 创建写入器，尚未启动后台任务
    #[must_use]
    pub fn new(file: TraceFileConfig, capacity: usize) -> Self {
        Self {
            file,
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            sender: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// 追踪文件路径
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// 累计丢弃的记录数
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 启动后台任务；重复调用无效果
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::channel::<TraceEntry>(self.capacity);
        let file = self.file.clone();
        *handle = Some(tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let file = file.clone();
                let written = tokio::task::spawn_blocking(move || append_trace(&file, &entry)).await;
                let failure = match written {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(error) = failure {
                    lerror!(
                        "system",
                        LogStage::Persistence,
                        LogComponent::Tracing,
                        "trace_write_failed",
                        "写入追踪记录失败",
                        error = %error
                    );
                }
            }
        }));
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        ldebug!(
            "system",
            LogStage::Startup,
            LogComponent::Tracing,
            "trace_writer_started",
            "追踪写入器已启动",
            capacity = self.capacity,
            path = %self.file.path.display()
        );
    }

    /// 入队一条记录；未启动时直接同步写入
    pub fn enqueue(&self, entry: TraceEntry) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            if let Err(e) = append_trace(&self.file, &entry) {
                lerror!(
                    &entry.request_id,
                    LogStage::Persistence,
                    LogComponent::Tracing,
                    "trace_write_failed",
                    "写入追踪记录失败",
                    error = %e
                );
            }
            return;
        };
        match sender.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                lwarn!(
                    &entry.request_id,
                    LogStage::Persistence,
                    LogComponent::Tracing,
                    "trace_queue_full",
                    "追踪队列已满，丢弃记录",
                    dropped = 1,
                    dropped_total = total
                );
            }
            Err(TrySendError::Closed(entry)) => {
                if let Err(e) = append_trace(&self.file, &entry) {
                    lerror!(
                        &entry.request_id,
                        LogStage::Persistence,
                        LogComponent::Tracing,
                        "trace_write_failed",
                        "写入追踪记录失败",
                        error = %e
                    );
                }
            }
        }
    }

    /// 关闭队列，等待剩余记录写完
    pub async fn stop(&self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                lerror!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::Tracing,
                    "trace_writer_join_failed",
                    "追踪写入任务异常退出",
                    error = %e
                );
            }
        }
    }
}

/// 在文件锁内追加一行，必要时先轮转
pub fn append_trace(file: &TraceFileConfig, entry: &TraceEntry) -> Result<()> {
    let line = serde_json::to_string(entry)
        .map_err(|e| ProxyError::serialization("序列化追踪记录失败", e))?;
    let _lock = FileLock::acquire(&file.path)?;
    rotate_if_needed(file)?;
    let mut handle = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&file.path)
        .map_err(|e| ProxyError::io(format!("打开追踪文件失败: {}", file.path.display()), e))?;
    writeln!(handle, "{line}")
        .map_err(|e| ProxyError::io(format!("写入追踪文件失败: {}", file.path.display()), e))
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    sibling_path(path, &format!(".{index}"))
}

/// 超过阈值时 `.N-1 → .N … .1 → .2`，当前文件 → `.1`；不保留备份时直接删除
fn rotate_if_needed(file: &TraceFileConfig) -> Result<()> {
    if file.max_bytes == 0 {
        return Ok(());
    }
    let size = match fs::metadata(&file.path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(()),
    };
    if size < file.max_bytes {
        return Ok(());
    }
    let io_err = |what: &str, e| ProxyError::io(format!("轮转追踪文件失败({what})"), e);

    if file.max_backups == 0 {
        return fs::remove_file(&file.path).map_err(|e| io_err("remove", e));
    }
    let oldest = backup_path(&file.path, file.max_backups);
    if oldest.exists() {
        fs::remove_file(&oldest).map_err(|e| io_err("remove", e))?;
    }
    for index in (1..file.max_backups).rev() {
        let from = backup_path(&file.path, index);
        if from.exists() {
            fs::rename(&from, backup_path(&file.path, index + 1)).map_err(|e| io_err("rename", e))?;
        }
    }
    fs::rename(&file.path, backup_path(&file.path, 1)).map_err(|e| io_err("rename", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::load_trace_entries;

    fn entry(label: &str) -> TraceEntry {
        TraceEntry {
            key_label: label.to_string(),
            status: 200,
            ..TraceEntry::default()
        }
    }

    fn config(dir: &Path, max_bytes: u64, max_backups: usize) -> TraceFileConfig {
        TraceFileConfig {
            path: dir.join("trace").join("trace.jsonl"),
            max_bytes,
            max_backups,
        }
    }

    #[test]
    fn rotation_renumbers_backups() {
        let dir = tempfile::tempdir().unwrap();
        let file = config(dir.path(), 1, 2);
        for label in ["a", "b", "c", "d"] {
            append_trace(&file, &entry(label)).unwrap();
        }
        let current = load_trace_entries(&file.path, 10).unwrap();
        assert_eq!(current[0].key_label, "d");
        let first = load_trace_entries(&backup_path(&file.path, 1), 10).unwrap();
        assert_eq!(first[0].key_label, "c");
        let second = load_trace_entries(&backup_path(&file.path, 2), 10).unwrap();
        assert_eq!(second[0].key_label, "b");
        assert!(!backup_path(&file.path, 3).exists());
    }

    #[tokio::test]
    async fn background_writer_drains_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TraceWriter::new(config(dir.path(), 0, 0), 16);
        writer.start();
        for label in ["a", "b", "c"] {
            writer.enqueue(entry(label));
        }
        writer.stop().await;
        let entries = load_trace_entries(writer.path(), 10).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(writer.dropped(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TraceWriter::new(config(dir.path(), 0, 0), 1);
        writer.start();
        // 单线程运行时下入队期间后台任务没有机会消费
        for index in 0..10 {
            writer.enqueue(entry(&format!("k{index}")));
        }
        assert_eq!(writer.dropped(), 9);
        writer.stop().await;

        let entries = load_trace_entries(writer.path(), 100).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key_label, "k0");
    }

    #[test]
    fn unstarted_writer_appends_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TraceWriter::new(config(dir.path(), 0, 0), 16);
        writer.enqueue(entry("a"));
        assert_eq!(load_trace_entries(writer.path(), 10).unwrap().len(), 1);
    }
}
