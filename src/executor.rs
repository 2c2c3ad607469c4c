// Safekeep - 镜像执行器模块
// 负责执行实际的文件操作（复制、删除、创建目录、重建符号链接）

use crate::actions::{FileTask, MirrorStats, Removal, SyncAction};
use crate::error::MirrorError;
use crate::utils::is_within;
use crossbeam_channel::Receiver;
use filetime::FileTime;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, warn};

/// 镜像执行器
///
/// 从通道接收任务，在独立的线程池中并行处理。
pub struct MirrorExecutor {
    /// 是否为试运行模式
    dry_run: bool,

    /// 工作线程数量
    workers: usize,

    /// 是否显示进度
    progress: bool,
}

impl MirrorExecutor {
    pub fn new(dry_run: bool, workers: usize) -> Self {
        Self {
            dry_run,
            workers: workers.max(1),
            progress: false,
        }
    }

    /// 在终端上显示进度
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// 删除目标中的多余条目
    ///
    /// 每个路径都必须位于 `dest_root` 之内，否则拒绝删除。
    ///
    /// # 返回
    /// * `Ok(u64)` - 删除的条目数量
    /// * `Err(MirrorError)` - 第一个删除失败的条目
    pub fn remove(&self, dest_root: &Path, removals: &[Removal]) -> Result<u64, MirrorError> {
        let mut deleted = 0;

        for removal in removals {
            if removal.dest_path == dest_root || !is_within(dest_root, &removal.dest_path) {
                return Err(MirrorError::Escape {
                    path: removal.dest_path.clone(),
                });
            }

            debug!(path = ?removal.rel_path, dir = removal.is_dir, "Removing extraneous entry");
            if !self.dry_run {
                remove_entry(&removal.dest_path, removal.is_dir)?;
            }
            deleted += 1;
        }

        Ok(deleted)
    }

    /// 执行镜像任务
    ///
    /// 第一个失败的任务会中止后续任务（已经接收的任务会被丢弃），并返回该错误。
    ///
    /// # 返回
    /// * `Ok(MirrorStats)` - 全部任务成功
    /// * `Err(MirrorError)` - 第一个失败任务的错误
    pub fn execute(&self, rx: Receiver<(FileTask, SyncAction)>) -> Result<MirrorStats, MirrorError> {
        let stats = Mutex::new(MirrorStats::new());
        let first_error: Mutex<Option<MirrorError>> = Mutex::new(None);
        let aborted = AtomicBool::new(false);

        let pb = if self.progress {
            let style = ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {pos} entries processed {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
            let pb = ProgressBar::new_spinner();
            pb.set_style(style);
            pb.set_message("Mirroring...");
            pb
        } else {
            ProgressBar::hidden()
        };

        let start_time = Instant::now();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| MirrorError::io(Path::new("."), std::io::Error::other(e)))?;

        pool.install(|| {
            rx.into_iter().par_bridge().for_each(|(task, action)| {
                if aborted.load(Ordering::Relaxed) {
                    return;
                }

                let res = self.process_task(&task, &action);

                let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                match res {
                    Ok(bytes) => match action {
                        SyncAction::CopyNew => {
                            s.total_files += 1;
                            s.copied_new += 1;
                            s.bytes_copied += bytes;
                        }
                        SyncAction::CopyModified => {
                            s.total_files += 1;
                            s.copied_modified += 1;
                            s.bytes_copied += bytes;
                        }
                        SyncAction::MakeSymlink(_) => {
                            s.total_files += 1;
                            s.symlinks += 1;
                        }
                        SyncAction::Skip => {
                            if !task.src_path.is_dir() {
                                s.total_files += 1;
                                s.unchanged += 1;
                            }
                        }
                        SyncAction::CreateDir => {}
                    },
                    Err(e) => {
                        s.failed += 1;
                        warn!(path = ?task.rel_path, error = %e, "Mirror task failed");
                        aborted.store(true, Ordering::Relaxed);
                        let mut slot = first_error.lock().unwrap_or_else(|e| e.into_inner());
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                }
                pb.inc(1);
            });
        });

        pb.finish_and_clear();
        debug!(
            elapsed = format!("{:.2}s", start_time.elapsed().as_secs_f64()),
            "Executor finished"
        );

        if let Some(err) = first_error.into_inner().unwrap_or_else(|e| e.into_inner()) {
            return Err(err);
        }

        Ok(stats.into_inner().unwrap_or_else(|e| e.into_inner()))
    }

    /// 处理单个文件任务
    ///
    /// # 返回
    /// * `Ok(u64)` - 复制的字节数（仅复制操作返回非零值）
    fn process_task(&self, task: &FileTask, action: &SyncAction) -> Result<u64, MirrorError> {
        if self.dry_run {
            return Ok(0);
        }

        let dest = &task.dest_path;

        match action {
            SyncAction::CopyNew | SyncAction::CopyModified => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;
                }

                // 只读文件无法被覆盖，先取消只读
                if let Ok(meta) = fs::symlink_metadata(dest) {
                    if meta.is_file() && meta.permissions().readonly() {
                        let mut perms = meta.permissions();
                        perms.set_readonly(false);
                        fs::set_permissions(dest, perms).map_err(|e| MirrorError::io(dest, e))?;
                    } else if !meta.is_file() {
                        remove_entry(dest, meta.is_dir())?;
                    }
                }

                let bytes =
                    fs::copy(&task.src_path, dest).map_err(|e| MirrorError::io(&task.src_path, e))?;

                preserve_times(&task.src_path, dest)?;
                Ok(bytes)
            }
            SyncAction::MakeSymlink(target) => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;
                }
                if let Ok(meta) = fs::symlink_metadata(dest) {
                    remove_entry(dest, meta.is_dir())?;
                }

                #[cfg(unix)]
                std::os::unix::fs::symlink(target, dest).map_err(|e| MirrorError::io(dest, e))?;

                #[cfg(windows)]
                {
                    // Windows 需要区分目录符号链接和文件符号链接
                    let is_dir = fs::metadata(&task.src_path)
                        .map(|m| m.is_dir())
                        .unwrap_or(false);
                    if is_dir {
                        std::os::windows::fs::symlink_dir(target, dest)
                            .map_err(|e| MirrorError::io(dest, e))?;
                    } else {
                        std::os::windows::fs::symlink_file(target, dest)
                            .map_err(|e| MirrorError::io(dest, e))?;
                    }
                }
                Ok(0)
            }
            SyncAction::CreateDir => {
                fs::create_dir_all(dest).map_err(|e| MirrorError::io(dest, e))?;
                Ok(0)
            }
            SyncAction::Skip => Ok(0),
        }
    }
}

/// 把源文件的访问时间和修改时间复制到目标
fn preserve_times(src: &Path, dest: &Path) -> Result<(), MirrorError> {
    let src_meta = fs::metadata(src).map_err(|e| MirrorError::io(src, e))?;
    let mtime = FileTime::from_last_modification_time(&src_meta);
    let atime = FileTime::from_last_access_time(&src_meta);

    let mut perms = fs::metadata(dest)
        .map_err(|e| MirrorError::io(dest, e))?
        .permissions();
    let original_readonly = perms.readonly();

    // 只读文件需要先取消只读才能设置时间戳（Windows）
    if original_readonly {
        perms.set_readonly(false);
        fs::set_permissions(dest, perms.clone()).map_err(|e| MirrorError::io(dest, e))?;
    }

    filetime::set_file_times(dest, atime, mtime).map_err(|e| MirrorError::io(dest, e))?;

    if original_readonly {
        perms.set_readonly(true);
        fs::set_permissions(dest, perms).map_err(|e| MirrorError::io(dest, e))?;
    }

    Ok(())
}

fn remove_entry(path: &Path, is_dir: bool) -> Result<(), MirrorError> {
    let res = if is_dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    res.map_err(|e| MirrorError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn refuses_removal_outside_destination() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("mirror");
        fs::create_dir(&dest).unwrap();
        let victim = dir.path().join("victim.txt");
        fs::write(&victim, "keep me").unwrap();

        let removal = Removal {
            rel_path: PathBuf::from("../victim.txt"),
            dest_path: dest.join("../victim.txt"),
            is_dir: false,
        };
        let err = MirrorExecutor::new(false, 1)
            .remove(&dest, &[removal])
            .unwrap_err();

        assert!(matches!(err, MirrorError::Escape { .. }));
        assert!(victim.exists());
    }

    #[test]
    fn copies_and_preserves_mtime() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        let dest = dir.path().join("out/dest.txt");
        fs::write(&src, "payload").unwrap();
        let stamp = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&src, stamp).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send((
            FileTask::new("dest.txt".into(), src.clone(), dest.clone()),
            SyncAction::CopyNew,
        ))
        .unwrap();
        drop(tx);

        let stats = MirrorExecutor::new(false, 2).execute(rx).unwrap();
        assert_eq!(stats.copied_new, 1);
        assert_eq!(stats.bytes_copied, 7);
        let copied = FileTime::from_last_modification_time(&fs::metadata(&dest).unwrap());
        assert_eq!(copied, stamp);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, "payload").unwrap();
        let dest = dir.path().join("dest.txt");

        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send((
            FileTask::new("dest.txt".into(), src, dest.clone()),
            SyncAction::CopyNew,
        ))
        .unwrap();
        drop(tx);

        MirrorExecutor::new(true, 1).execute(rx).unwrap();
        assert!(!dest.exists());
    }

    #[test]
    fn failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send((
            FileTask::new(
                "ghost".into(),
                dir.path().join("ghost"),
                dir.path().join("out/ghost"),
            ),
            SyncAction::CopyNew,
        ))
        .unwrap();
        drop(tx);

        let err = MirrorExecutor::new(false, 1).execute(rx).unwrap_err();
        assert!(matches!(err, MirrorError::Io { .. }));
    }
}
