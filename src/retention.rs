// Safekeep - 备份删除模块
// 在后台线程删除整个备份根目录，同一时间只允许一个删除任务

use crate::record::RecordBook;
use crate::task::{TaskCell, TaskStatus};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

/// 删除控制器
///
/// 删除成功后把备份/恢复计数清零；失败时只记录日志，计数保持不变。
#[derive(Clone)]
pub struct RetentionController {
    records: Arc<RecordBook>,
    status: TaskCell<PathBuf>,
}

impl RetentionController {
    pub fn new(records: Arc<RecordBook>) -> Self {
        Self {
            records,
            status: TaskCell::new(),
        }
    }

    /// 开始删除 `backup_root`
    ///
    /// # 返回
    /// * `false` - 已有删除任务在进行，本次请求被忽略
    pub fn delete_all(&self, backup_root: &Path) -> bool {
        self.delete_all_then(backup_root, |_| {})
    }

    /// 开始删除，结束后（无论成功与否）在工作线程上调用 `on_finish`
    pub fn delete_all_then<F>(&self, backup_root: &Path, on_finish: F) -> bool
    where
        F: FnOnce(bool) + Send + 'static,
    {
        if !self.status.try_start() {
            info!("Delete already in progress, request ignored");
            return false;
        }

        let root = backup_root.to_path_buf();
        let records = Arc::clone(&self.records);
        let status = self.status.clone();

        thread::spawn(move || {
            info!(root = ?root, "Deleting backup");
            let ok = match remove_tree(&root) {
                Ok(()) => {
                    if let Err(e) = records.reset_counters() {
                        error!(error = %e, "Backup deleted but counters could not be saved");
                    }
                    info!(root = ?root, "Backup deleted");
                    status.set(TaskStatus::Done(root));
                    true
                }
                Err(e) => {
                    error!(root = ?root, error = %e, "Could not delete backup");
                    status.set(TaskStatus::Failed(e.to_string()));
                    false
                }
            };
            on_finish(ok);
        });

        true
    }

    pub fn is_deleting(&self) -> bool {
        self.status.get().is_running()
    }

    pub fn status(&self) -> TaskStatus<PathBuf> {
        self.status.get()
    }

    /// 限时等待当前删除任务结束
    pub fn wait(&self, timeout: Duration) -> TaskStatus<PathBuf> {
        self.status.wait(timeout)
    }
}

fn remove_tree(root: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(root) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
