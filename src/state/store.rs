//! # 状态存储
//!
//! 每次变更都是 `load → mutate → save`，同时受进程内互斥锁与跨进程文件锁保护，
//! 写入走临时文件加重命名。JSON 解析失败时把坏文件改名隔离，并从空状态重新开始。

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::lock::{FileLock, atomic_write, sibling_path};
use super::types::RotationState;
use crate::error::{ProxyError, Result};
use crate::key_pool::Registry;
use crate::logging::{LogComponent, LogStage};
use crate::{lerror, lwarn};

/// 状态文件存储
#[derive(Debug, Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl StateStore {
    /// 使用指定的状态文件路径
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path: path.into(),
                io_lock: Mutex::new(()),
            }),
        }
    }

    /// 使用 `<dir>/state.json`
    pub fn in_dir(state_dir: impl AsRef<Path>) -> Self {
        Self::new(state_dir.as_ref().join("state.json"))
    }

    /// 状态文件路径
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// 加载状态并与注册表对齐，有改动时立即写回
    pub fn load(&self, registry: &Registry) -> Result<RotationState> {
        let _guard = self.io_guard();
        let _lock = FileLock::acquire(self.path())?;
        let (mut state, mut changed) = self.read_locked()?;
        changed |= state.reconcile(registry);
        if changed {
            self.write_locked(&state)?;
        }
        Ok(state)
    }

    /// 保存状态
    pub fn save(&self, state: &RotationState) -> Result<()> {
        let _guard = self.io_guard();
        let _lock = FileLock::acquire(self.path())?;
        self.write_locked(state)
    }

    /// 在同一把锁内完成 `load → mutate → save`
    pub fn update<F, R>(&self, registry: &Registry, mutate: F) -> Result<R>
    where
        F: FnOnce(&mut RotationState) -> R,
    {
        let _guard = self.io_guard();
        let _lock = FileLock::acquire(self.path())?;
        let (mut state, _) = self.read_locked()?;
        state.reconcile(registry);
        let result = mutate(&mut state);
        self.write_locked(&state)?;
        Ok(result)
    }

    fn io_guard(&self) -> MutexGuard<'_, ()> {
        self.inner
            .io_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_locked(&self) -> Result<(RotationState, bool)> {
        let path = self.path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProxyError::io(format!("创建状态目录失败: {}", parent.display()), e))?;
        }
        if !path.exists() {
            return Ok((RotationState::default(), true));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ProxyError::io(format!("读取状态文件失败: {}", path.display()), e))?;
        match serde_json::from_str::<RotationState>(&content) {
            Ok(state) => Ok((state, false)),
            Err(parse_error) => {
                let quarantined = self.quarantine(&content);
                let error = ProxyError::state_corrupted(path, parse_error);
                lwarn!(
                    "system",
                    LogStage::Persistence,
                    LogComponent::StateStore,
                    "state_corrupted",
                    "状态文件损坏，已隔离并重置",
                    error = %error,
                    quarantined = ?quarantined
                );
                Ok((RotationState::default(), true))
            }
        }
    }

    fn quarantine(&self, content: &str) -> Option<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let target = sibling_path(self.path(), &format!(".corrupt.{stamp}"));
        quarantine_into(self.path(), &target, content)
    }

    fn write_locked(&self, state: &RotationState) -> Result<()> {
        let mut payload = serde_json::to_string_pretty(state)
            .map_err(|e| ProxyError::serialization("状态序列化失败", e))?;
        payload.push('\n');
        atomic_write(self.path(), &payload)
    }
}

/// 把损坏文件移到隔离路径；改名失败时改为写出原始内容，两者都失败只记录日志
fn quarantine_into(path: &Path, target: &Path, content: &str) -> Option<PathBuf> {
    let rename_error = match fs::rename(path, target) {
        Ok(()) => return Some(target.to_path_buf()),
        Err(e) => e,
    };
    match fs::write(target, content) {
        Ok(()) => Some(target.to_path_buf()),
        Err(write_error) => {
            lerror!(
                "system",
                LogStage::Persistence,
                LogComponent::StateStore,
                "state_quarantine_failed",
                "隔离损坏状态文件失败，原内容无法保留",
                path = %path.display(),
                target = %target.display(),
                rename_error = %rename_error,
                write_error = %write_error
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pool::KeyRecord;
    use tempfile::TempDir;

    #[test]
    fn failed_quarantine_still_yields_fresh_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::in_dir(dir.path());
        fs::write(store.path(), "{broken").unwrap();

        // 预先占用接下来几秒的隔离路径，让改名与写出都失败
        let now = chrono::Utc::now();
        for offset in 0..10 {
            let stamp = (now + chrono::Duration::seconds(offset)).format("%Y%m%d%H%M%S");
            let blocker = sibling_path(store.path(), &format!(".corrupt.{stamp}"));
            fs::create_dir_all(blocker.join("occupied")).unwrap();
        }

        let registry = Registry::from_records([KeyRecord::new("a", "sk-a", 0, false)]);
        let state = store.load(&registry).unwrap();
        assert_eq!(state.active_index, 0);
        assert!(state.keys.contains_key("a"));
    }

    #[test]
    fn quarantine_falls_back_to_copying_content() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("state.json.corrupt");

        // 源文件不存在时改名失败，改为写出内存中的原始内容
        let missing = dir.path().join("gone.json");
        let kept = quarantine_into(&missing, &target, "{broken");
        assert_eq!(kept.as_deref(), Some(target.as_path()));
        assert_eq!(fs::read_to_string(&target).unwrap(), "{broken");

        let occupied = dir.path().join("occupied");
        fs::create_dir_all(occupied.join("child")).unwrap();
        assert_eq!(quarantine_into(&missing, &occupied, "{broken"), None);
    }
}
