// Safekeep - 外部协作者模块
// 引擎在备份/恢复前后调用的外部接口：保存未保存的文档、写忽略规则、重启宿主进程，以及类型化的前后回调

use crate::config::VcsKind;
use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 宿主持有的未保存状态
pub trait DirtyStateSaver: Send + Sync {
    /// 只保存有修改的文档
    fn save_if_dirty(&self) -> Result<()>;

    /// 保存所有打开的文档
    fn save_all(&self) -> Result<()>;
}

/// 把备份目录写入版本控制的忽略文件
///
/// 实现必须是幂等的：已经存在的条目不再追加。
pub trait IgnoreWriter: Send + Sync {
    fn write_ignore(&self, project_root: &Path, backup_dir_name: &str, vcs: VcsKind) -> Result<()>;
}

/// 重启宿主进程
pub trait Relauncher: Send + Sync {
    fn relaunch(&self, request: &RelaunchRequest) -> Result<()>;
}

/// 不做任何事的协作者，用于没有宿主的命令行场景
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl DirtyStateSaver for NoopHost {
    fn save_if_dirty(&self) -> Result<()> {
        Ok(())
    }

    fn save_all(&self) -> Result<()> {
        Ok(())
    }
}

impl IgnoreWriter for NoopHost {
    fn write_ignore(&self, _: &Path, backup_dir_name: &str, vcs: VcsKind) -> Result<()> {
        debug!(dir = backup_dir_name, %vcs, "Ignore file bookkeeping skipped");
        Ok(())
    }
}

/// 重启请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaunchRequest {
    pub executable: PathBuf,
    pub project_root: PathBuf,
    pub batch_mode: bool,
    pub quit: bool,
    pub no_graphics: bool,
    /// 新进程启动后要执行的方法
    pub continuation: Option<String>,
}

impl RelaunchRequest {
    /// 命令行参数
    ///
    /// `-quit` 只在批处理模式下有意义。
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-projectPath".into(), self.project_root.clone().into()];
        if self.batch_mode {
            args.push("-batchmode".into());
            if self.quit {
                args.push("-quit".into());
            }
        }
        if self.no_graphics {
            args.push("-nographics".into());
        }
        if let Some(method) = &self.continuation {
            args.push("-executeMethod".into());
            args.push(method.into());
        }
        args
    }
}

/// 启动新进程的重启实现
///
/// 新进程不会被等待结束；只在 `wait` 时间内检查它是否立即失败退出。
#[derive(Debug, Clone)]
pub struct ProcessRelauncher {
    wait: Duration,
}

impl Default for ProcessRelauncher {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(5),
        }
    }
}

impl ProcessRelauncher {
    pub fn new(wait: Duration) -> Self {
        Self { wait }
    }
}

impl Relauncher for ProcessRelauncher {
    fn relaunch(&self, request: &RelaunchRequest) -> Result<()> {
        info!(exe = ?request.executable, "Relaunching host process");

        let mut child = Command::new(&request.executable)
            .args(request.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to start {:?}", request.executable))?;

        let deadline = Instant::now() + self.wait;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait().context("Failed to poll relaunched process")? {
                if !status.success() {
                    bail!("Relaunched process exited with {}", status);
                }
                return Ok(());
            }
            thread::sleep(Duration::from_millis(50));
        }

        debug!(pid = child.id(), "Relaunched process still running, detaching");
        Ok(())
    }
}

/// 类型化的前后回调
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// 回调注册表
///
/// 前置回调在第一个文件夹镜像之前运行，后置回调在最后一个文件夹之后、完成通知之前运行。
#[derive(Default, Clone)]
pub struct Hooks {
    pub pre_backup: Vec<Callback>,
    pub post_backup: Vec<Callback>,
    pub pre_restore: Vec<Callback>,
    pub post_restore: Vec<Callback>,
}

impl Hooks {
    pub fn run(callbacks: &[Callback]) {
        for cb in callbacks {
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RelaunchRequest {
        RelaunchRequest {
            executable: PathBuf::from("/opt/host/bin/host"),
            project_root: PathBuf::from("/work/game"),
            batch_mode: true,
            quit: true,
            no_graphics: true,
            continuation: Some("after_backup".into()),
        }
    }

    #[test]
    fn args_carry_all_flags() {
        let args = request().args();
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            [
                "-projectPath",
                "/work/game",
                "-batchmode",
                "-quit",
                "-nographics",
                "-executeMethod",
                "after_backup"
            ]
        );
    }

    #[test]
    fn quit_needs_batch_mode() {
        let mut req = request();
        req.batch_mode = false;
        req.no_graphics = false;
        req.continuation = None;
        assert_eq!(req.args().len(), 2);
    }

    #[test]
    fn missing_executable_fails() {
        let mut req = request();
        req.executable = PathBuf::from("/definitely/not/here/host");
        assert!(ProcessRelauncher::new(Duration::from_millis(100))
            .relaunch(&req)
            .is_err());
    }

    #[cfg(unix)]
    #[test]
    fn early_failure_is_reported() {
        let mut req = request();
        req.executable = PathBuf::from("false");
        assert!(ProcessRelauncher::new(Duration::from_secs(2))
            .relaunch(&req)
            .is_err());
    }
}
