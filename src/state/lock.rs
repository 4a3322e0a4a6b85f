//! # 文件锁与原子写入

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{ProxyError, Result};

/// 给路径追加后缀，如 `state.json` → `state.json.lock`
#[must_use]
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// 跨进程排他锁，析构时释放
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// 阻塞获取 `<path>.lock` 上的排他锁
    pub fn acquire(path: &Path) -> Result<Self> {
        let lock_path = sibling_path(path, ".lock");
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProxyError::io(format!("创建目录失败: {}", parent.display()), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&lock_path)
            .map_err(|e| ProxyError::io(format!("打开锁文件失败: {}", lock_path.display()), e))?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| ProxyError::io(format!("获取文件锁失败: {}", lock_path.display()), e))?;
        Ok(Self {
            file,
            path: lock_path,
        })
    }

    /// 锁文件路径
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// 先写 `<path>.tmp` 再重命名覆盖
pub fn atomic_write(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| ProxyError::io(format!("创建目录失败: {}", parent.display()), e))?;
    }
    let tmp_path = sibling_path(path, ".tmp");
    fs::write(&tmp_path, content)
        .map_err(|e| ProxyError::io(format!("写入临时文件失败: {}", tmp_path.display()), e))?;
    fs::rename(&tmp_path, path)
        .map_err(|e| ProxyError::io(format!("替换文件失败: {}", path.display()), e))?;
    Ok(())
}
