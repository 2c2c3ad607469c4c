// Safekeep - 目录镜像模块
// 让目标目录与源目录完全一致（包括删除），可以使用内置实现或委托给 rsync/robocopy

use crate::actions::MirrorStats;
use crate::error::MirrorError;
use crate::executor::MirrorExecutor;
use crate::planner::{plan_removals, scan_source, PlanOptions};
use crate::utils::compile_patterns;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// 单向镜像操作
///
/// 实现必须满足：源不存在时什么也不做并返回成功；只在目标子树内写入和删除。
pub trait Mirror: Send + Sync {
    fn mirror(&self, source: &Path, destination: &Path) -> Result<MirrorStats, MirrorError>;

    /// 用于日志显示的名称
    fn name(&self) -> &str;
}

/// 镜像实现的选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MirrorStrategy {
    /// 内置的遍历 + 线程池实现
    #[default]
    Native,
    /// 委托给平台的批量复制工具
    Tool,
}

impl fmt::Display for MirrorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorStrategy::Native => f.write_str("native"),
            MirrorStrategy::Tool => f.write_str("tool"),
        }
    }
}

impl FromStr for MirrorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(MirrorStrategy::Native),
            "tool" => Ok(MirrorStrategy::Tool),
            other => Err(format!("Unknown mirror strategy '{}'", other)),
        }
    }
}

/// 镜像选项
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    /// 排除模式（Glob 风格，相对于文件夹根目录）
    pub exclude: Vec<String>,

    /// 是否启用内容检查
    pub check_content: bool,

    /// 修改时间允许的误差（仅内置实现），零表示精确比较
    pub modify_window: Duration,

    /// 工作线程数量
    pub workers: usize,

    /// 试运行模式
    pub dry_run: bool,

    /// 是否显示进度
    pub progress: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            check_content: false,
            modify_window: Duration::ZERO,
            workers: 4,
            dry_run: false,
            progress: false,
        }
    }
}

/// 根据策略构建镜像实现
pub fn build_mirror(strategy: MirrorStrategy, options: MirrorOptions) -> Box<dyn Mirror> {
    match strategy {
        MirrorStrategy::Native => Box::new(NativeMirror::new(options)),
        MirrorStrategy::Tool => Box::new(ToolMirror::new(MirrorTool::platform_default(), options)),
    }
}

/// 检查源目录；返回 `Ok(false)` 表示源不存在，无需镜像
fn check_source(source: &Path) -> Result<bool, MirrorError> {
    match fs::metadata(source) {
        Ok(meta) if meta.is_dir() => Ok(true),
        Ok(_) => Err(MirrorError::io(
            source,
            std::io::Error::new(ErrorKind::InvalidInput, "source is not a directory"),
        )),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(MirrorError::io(source, e)),
    }
}

fn ensure_destination(destination: &Path) -> Result<(), MirrorError> {
    if let Ok(meta) = fs::symlink_metadata(destination) {
        if !meta.is_dir() {
            fs::remove_file(destination).map_err(|e| MirrorError::io(destination, e))?;
        }
    }
    fs::create_dir_all(destination).map_err(|e| MirrorError::io(destination, e))
}

/// 内置镜像实现
///
/// 流程：删除目标中的多余条目，然后扫描线程与执行线程池以流水线方式同步剩余条目。
pub struct NativeMirror {
    options: MirrorOptions,
}

impl NativeMirror {
    pub fn new(options: MirrorOptions) -> Self {
        Self { options }
    }
}

impl Mirror for NativeMirror {
    fn mirror(&self, source: &Path, destination: &Path) -> Result<MirrorStats, MirrorError> {
        if !check_source(source)? {
            debug!(source = ?source, "Source folder does not exist, nothing to mirror");
            return Ok(MirrorStats::new());
        }

        if !self.options.dry_run {
            ensure_destination(destination)?;
        }

        let plan = PlanOptions {
            exclude: compile_patterns(&self.options.exclude),
            check_content: self.options.check_content,
            modify_window: self.options.modify_window,
        };

        let executor = MirrorExecutor::new(self.options.dry_run, self.options.workers)
            .with_progress(self.options.progress);

        let removals = plan_removals(source, destination, &plan.exclude)?;
        let deleted = executor.remove(destination, &removals)?;

        // === 流水线处理开始 ===
        let (tx, rx) = crossbeam_channel::bounded(1000);

        let (scanned, stats) = thread::scope(|scope| {
            let scanner = scope.spawn(|| scan_source(source, destination, &plan, tx));
            let stats = executor.execute(rx);
            let scanned = scanner.join().unwrap_or_else(|_| {
                Err(MirrorError::io(
                    source,
                    std::io::Error::other("scanner thread panicked"),
                ))
            });
            (scanned, stats)
        });
        // === 流水线处理结束 ===

        let mut stats = stats?;
        let scanned = scanned?;
        stats.deleted = deleted;

        debug!(
            source = ?source,
            destination = ?destination,
            scanned,
            copied = stats.copied_new + stats.copied_modified,
            deleted,
            "Native mirror finished"
        );
        Ok(stats)
    }

    fn name(&self) -> &str {
        "native"
    }
}

/// 外部批量复制工具
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorTool {
    /// `rsync -a --delete`
    Rsync,
    /// `robocopy /MIR`
    Robocopy,
}

impl MirrorTool {
    #[cfg(windows)]
    pub fn platform_default() -> Self {
        MirrorTool::Robocopy
    }

    #[cfg(not(windows))]
    pub fn platform_default() -> Self {
        MirrorTool::Rsync
    }

    pub fn program(self) -> &'static str {
        match self {
            MirrorTool::Rsync => "rsync",
            MirrorTool::Robocopy => "robocopy",
        }
    }

    /// 构建命令行参数
    pub fn args(self, source: &Path, destination: &Path, exclude: &[String]) -> Vec<String> {
        match self {
            MirrorTool::Rsync => {
                let mut args = vec!["-a".to_string(), "--delete".to_string()];
                for pattern in exclude {
                    args.push("--exclude".to_string());
                    args.push(pattern.clone());
                }
                // 末尾的斜杠表示复制目录内容，而不是目录本身
                args.push(format!("{}/", source.display()));
                args.push(format!("{}/", destination.display()));
                args
            }
            MirrorTool::Robocopy => {
                let mut args = vec![
                    source.display().to_string(),
                    destination.display().to_string(),
                ];
                args.extend(
                    ["/MIR", "/W:2", "/R:3", "/MT", "/NFL", "/NDL", "/NJH", "/NJS", "/nc", "/ns", "/np"]
                        .iter()
                        .map(|s| s.to_string()),
                );
                if !exclude.is_empty() {
                    args.push("/XD".to_string());
                    args.extend(exclude.iter().cloned());
                    args.push("/XF".to_string());
                    args.extend(exclude.iter().cloned());
                }
                args
            }
        }
    }

    /// 判断退出码是否表示成功
    ///
    /// robocopy 的 0-7 都表示成功（1 = 复制了文件，2 = 有多余文件等），8 及以上才是失败。
    pub fn is_success(self, code: Option<i32>) -> bool {
        match (self, code) {
            (MirrorTool::Rsync, Some(0)) => true,
            (MirrorTool::Robocopy, Some(c)) => (0..8).contains(&c),
            _ => false,
        }
    }
}

/// 委托给外部工具的镜像实现
pub struct ToolMirror {
    tool: MirrorTool,
    program: PathBuf,
    options: MirrorOptions,
}

impl ToolMirror {
    pub fn new(tool: MirrorTool, options: MirrorOptions) -> Self {
        Self {
            tool,
            program: PathBuf::from(tool.program()),
            options,
        }
    }

    /// 使用指定的可执行文件（例如非标准安装位置）
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

impl Mirror for ToolMirror {
    fn mirror(&self, source: &Path, destination: &Path) -> Result<MirrorStats, MirrorError> {
        if !check_source(source)? {
            debug!(source = ?source, "Source folder does not exist, nothing to mirror");
            return Ok(MirrorStats::new());
        }

        let args = self.tool.args(source, destination, &self.options.exclude);
        if self.options.dry_run {
            info!(program = ?self.program, ?args, "Dry run: would run mirror tool");
            return Ok(MirrorStats::new());
        }

        ensure_destination(destination)?;

        debug!(program = ?self.program, ?args, "Running mirror tool");
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| MirrorError::ToolSpawn {
                tool: self.program.display().to_string(),
                source,
            })?;

        let code = output.status.code();
        if !self.tool.is_success(code) {
            return Err(MirrorError::ExternalTool {
                tool: self.program.display().to_string(),
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(MirrorStats::new())
    }

    fn name(&self) -> &str {
        self.tool.program()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn native() -> NativeMirror {
        NativeMirror::new(MirrorOptions {
            workers: 2,
            ..Default::default()
        })
    }

    #[test]
    fn mirror_deletes_extraneous_files() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("sprites")).unwrap();
        fs::write(src.join("sprites/ship.png"), "png").unwrap();
        fs::create_dir_all(dst.join("old")).unwrap();
        fs::write(dst.join("X"), "stale").unwrap();
        fs::write(dst.join("old/y"), "stale").unwrap();

        let stats = native().mirror(&src, &dst).unwrap();

        assert!(dst.join("sprites/ship.png").exists());
        assert!(!dst.join("X").exists());
        assert!(!dst.join("old").exists());
        assert_eq!(stats.deleted, 2);
        assert_eq!(stats.copied_new, 1);
    }

    #[test]
    fn missing_source_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("dst");
        fs::create_dir(&dst).unwrap();
        fs::write(dst.join("keep"), "k").unwrap();

        let stats = native().mirror(&dir.path().join("absent"), &dst).unwrap();

        assert_eq!(stats, MirrorStats::new());
        assert!(dst.join("keep").exists());
    }

    #[test]
    fn replaces_entries_whose_type_changed() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("now_dir")).unwrap();
        fs::write(src.join("now_dir/inner.txt"), "i").unwrap();
        fs::write(src.join("now_file"), "f").unwrap();
        fs::create_dir_all(dst.join("now_file")).unwrap();
        fs::write(dst.join("now_dir"), "was a file").unwrap();

        native().mirror(&src, &dst).unwrap();

        assert!(dst.join("now_dir/inner.txt").is_file());
        assert!(dst.join("now_file").is_file());
    }

    #[test]
    fn second_pass_copies_nothing() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::write(src.join("a/b/c.txt"), "c").unwrap();

        native().mirror(&src, &dst).unwrap();
        let again = native().mirror(&src, &dst).unwrap();

        assert_eq!(again.copied_new + again.copied_modified, 0);
        assert_eq!(again.unchanged, 1);
    }

    #[test]
    fn quick_edit_after_a_pass_is_picked_up() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        let file = src.join("level.dat");
        let t0 = filetime::FileTime::from_unix_time(1_700_000_000, 0);
        fs::write(&file, "aaaa").unwrap();
        filetime::set_file_mtime(&file, t0).unwrap();
        native().mirror(&src, &dst).unwrap();

        fs::write(&file, "bbbb").unwrap();
        filetime::set_file_mtime(&file, filetime::FileTime::from_unix_time(1_700_000_000, 500_000_000))
            .unwrap();
        let stats = native().mirror(&src, &dst).unwrap();

        assert_eq!(stats.copied_modified, 1);
        assert_eq!(fs::read_to_string(dst.join("level.dat")).unwrap(), "bbbb");
    }

    #[test]
    fn excluded_entries_are_not_copied_or_deleted() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("editor.log"), "noise").unwrap();
        fs::write(src.join("scene.unity"), "scene").unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("old.log"), "kept").unwrap();

        let mirror = NativeMirror::new(MirrorOptions {
            exclude: vec!["*.log".to_string()],
            ..Default::default()
        });
        mirror.mirror(&src, &dst).unwrap();

        assert!(dst.join("scene.unity").exists());
        assert!(!dst.join("editor.log").exists());
        assert!(dst.join("old.log").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_recreated_not_followed() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        let outside = dir.path().join("outside");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret.txt"), "s").unwrap();
        fs::write(src.join("real.txt"), "r").unwrap();
        std::os::unix::fs::symlink("real.txt", src.join("link.txt")).unwrap();
        std::os::unix::fs::symlink(&outside, src.join("escape")).unwrap();

        native().mirror(&src, &dst).unwrap();

        let link = fs::symlink_metadata(dst.join("link.txt")).unwrap();
        assert!(link.file_type().is_symlink());
        assert_eq!(fs::read_link(dst.join("link.txt")).unwrap(), PathBuf::from("real.txt"));
        let escape = fs::symlink_metadata(dst.join("escape")).unwrap();
        assert!(escape.file_type().is_symlink());
        assert_eq!(fs::read_link(dst.join("escape")).unwrap(), outside);
    }

    #[test]
    fn robocopy_success_codes() {
        assert!(MirrorTool::Robocopy.is_success(Some(0)));
        assert!(MirrorTool::Robocopy.is_success(Some(3)));
        assert!(!MirrorTool::Robocopy.is_success(Some(8)));
        assert!(MirrorTool::Rsync.is_success(Some(0)));
        assert!(!MirrorTool::Rsync.is_success(Some(23)));
        assert!(!MirrorTool::Rsync.is_success(None));
    }

    #[test]
    fn rsync_arguments_mirror_directory_contents() {
        let args = MirrorTool::Rsync.args(
            Path::new("/p/Assets"),
            Path::new("/b/Assets"),
            &["*.tmp".to_string()],
        );
        assert_eq!(
            args,
            ["-a", "--delete", "--exclude", "*.tmp", "/p/Assets/", "/b/Assets/"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_tool_exit_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();

        let mirror = ToolMirror::new(MirrorTool::Rsync, MirrorOptions::default()).with_program("false");
        let err = mirror.mirror(&src, &dir.path().join("dst")).unwrap_err();

        assert!(matches!(err, MirrorError::ExternalTool { code: Some(1), .. }));
    }

    #[test]
    fn missing_tool_is_a_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();

        let mirror = ToolMirror::new(MirrorTool::Rsync, MirrorOptions::default())
            .with_program(dir.path().join("no-such-binary"));
        let err = mirror.mirror(&src, &dir.path().join("dst")).unwrap_err();

        assert!(matches!(err, MirrorError::ToolSpawn { .. }));
    }

    #[test]
    fn rsync_mirrors_when_available() {
        if Command::new("rsync").arg("--version").output().is_err() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("X"), "stale").unwrap();

        ToolMirror::new(MirrorTool::Rsync, MirrorOptions::default())
            .mirror(&src, &dst)
            .unwrap();

        assert!(dst.join("a.txt").exists());
        assert!(!dst.join("X").exists());
    }
}
