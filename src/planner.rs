// Safekeep - 镜像规划模块
// 比较源目录与目标目录，决定每个条目的同步动作以及需要删除的多余条目

use crate::actions::{FileTask, Removal, SyncAction};
use crate::error::MirrorError;
use crate::hasher::same_content;
use crate::utils::{matches_exclude_pattern, to_verbatim_path};
use crossbeam_channel::Sender;
use glob::Pattern;
use std::fs::{self, Metadata};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, trace};
use walkdir::WalkDir;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// 规划选项
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// 已编译的排除模式（相对于文件夹根目录）
    pub exclude: Vec<Pattern>,

    /// 是否启用内容检查
    pub check_content: bool,

    /// 修改时间允许的误差，默认为零即精确比较（低精度文件系统可放宽）
    pub modify_window: Duration,
}

/// 条目类型，用于判断源和目标是否类型冲突
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Dir,
    Symlink,
}

fn entry_kind(meta: &Metadata) -> EntryKind {
    let ft = meta.file_type();
    if ft.is_symlink() {
        EntryKind::Symlink
    } else if ft.is_dir() {
        EntryKind::Dir
    } else {
        EntryKind::File
    }
}

/// 找出目标目录中需要删除的条目
///
/// 目标中存在而源中不存在的条目，以及与源类型不同的条目（目录变文件等）都会被删除。
/// 被删除的目录不会再向下遍历，因此返回的列表中不存在嵌套关系。
/// 匹配排除模式的目标条目保持原样。
///
/// # 参数
/// * `source` - 源目录
/// * `destination` - 目标目录（不存在时返回空列表）
/// * `exclude` - 排除模式
pub fn plan_removals(
    source: &Path,
    destination: &Path,
    exclude: &[Pattern],
) -> Result<Vec<Removal>, MirrorError> {
    let mut removals = Vec::new();

    if fs::symlink_metadata(destination).is_err() {
        return Ok(removals);
    }

    let mut walker = WalkDir::new(destination)
        .follow_links(false)
        .min_depth(1)
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|err| walk_error(destination, err))?;
        let dest_path = entry.path();
        let rel_path = dest_path
            .strip_prefix(destination)
            .map_err(|_| MirrorError::Escape {
                path: dest_path.to_path_buf(),
            })?
            .to_path_buf();
        let dest_is_dir = entry.file_type().is_dir();

        if matches_exclude_pattern(&rel_path, exclude) {
            if dest_is_dir {
                walker.skip_current_dir();
            }
            continue;
        }

        let dest_kind = if entry.file_type().is_symlink() {
            EntryKind::Symlink
        } else if dest_is_dir {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        let keep = match fs::symlink_metadata(source.join(&rel_path)) {
            Ok(meta) => entry_kind(&meta) == dest_kind,
            Err(_) => false,
        };

        if !keep {
            trace!(path = ?rel_path, "Extraneous entry in destination");
            removals.push(Removal {
                rel_path,
                dest_path: dest_path.to_path_buf(),
                is_dir: dest_is_dir,
            });
            if dest_is_dir {
                walker.skip_current_dir();
            }
        }
    }

    Ok(removals)
}

/// 扫描源目录并生成文件任务
///
/// 遍历源目录（不跟随符号链接，所以不会越出源目录），为每个条目决定动作并通过通道发送。
///
/// # 返回
/// * `Ok(u64)` - 发送的任务数量
/// * `Err(MirrorError)` - 遍历失败
pub fn scan_source(
    source: &Path,
    destination: &Path,
    options: &PlanOptions,
    tx: Sender<(FileTask, SyncAction)>,
) -> Result<u64, MirrorError> {
    let walker = WalkDir::new(source)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| match e.path().strip_prefix(source) {
            Ok(rel) => !matches_exclude_pattern(rel, &options.exclude),
            Err(_) => true,
        });

    let mut sent = 0;

    for entry in walker {
        let entry = entry.map_err(|err| walk_error(source, err))?;
        let path = entry.path();

        let rel_path = path
            .strip_prefix(source)
            .map_err(|_| MirrorError::Escape {
                path: path.to_path_buf(),
            })?
            .to_path_buf();

        let src_path = to_verbatim_path(path);
        let dest_path = to_verbatim_path(&destination.join(&rel_path));

        let task = FileTask::new(rel_path, src_path, dest_path);
        let action = decide_action(&task, options);

        if tx.send((task, action)).is_err() {
            debug!("Executor stopped receiving, ending scan");
            break;
        }
        sent += 1;
    }

    Ok(sent)
}

/// 决定对单个条目执行何种同步动作
///
/// # 决策逻辑
/// 1. 源是符号链接：目标是指向相同位置的链接则跳过，否则重建链接
/// 2. 源是目录：目标已是目录则跳过，否则创建
/// 3. 目标不存在：复制新文件
/// 4. 目标类型不同、大小不同或权限不同（Unix）：覆盖
/// 5. 修改时间差异小于 1 秒：未启用内容检查时跳过，启用时比较哈希
pub fn decide_action(task: &FileTask, options: &PlanOptions) -> SyncAction {
    let src_meta = match fs::symlink_metadata(&task.src_path) {
        Ok(m) => m,
        // 扫描期间被删除的条目
        Err(_) => return SyncAction::Skip,
    };
    let dest_meta = fs::symlink_metadata(&task.dest_path).ok();

    match entry_kind(&src_meta) {
        EntryKind::Symlink => {
            let target = match fs::read_link(&task.src_path) {
                Ok(t) => t,
                Err(_) => return SyncAction::Skip,
            };
            let same = dest_meta
                .filter(|m| m.file_type().is_symlink())
                .and_then(|_| fs::read_link(&task.dest_path).ok())
                .is_some_and(|old| old == target);
            if same {
                SyncAction::Skip
            } else {
                SyncAction::MakeSymlink(target)
            }
        }
        EntryKind::Dir => match dest_meta {
            Some(m) if entry_kind(&m) == EntryKind::Dir => SyncAction::Skip,
            _ => SyncAction::CreateDir,
        },
        EntryKind::File => {
            let dest_meta = match dest_meta {
                Some(m) => m,
                None => return SyncAction::CopyNew,
            };

            if entry_kind(&dest_meta) != EntryKind::File || src_meta.len() != dest_meta.len() {
                return SyncAction::CopyModified;
            }

            #[cfg(unix)]
            {
                if src_meta.permissions().mode() != dest_meta.permissions().mode() {
                    return SyncAction::CopyModified;
                }
            }

            if !mtime_matches(&src_meta, &dest_meta, options.modify_window) {
                return SyncAction::CopyModified;
            }

            if options.check_content && !same_content(&task.src_path, &task.dest_path) {
                return SyncAction::CopyModified;
            }

            SyncAction::Skip
        }
    }
}

/// 修改时间差异不超过 `window` 视为相同
fn mtime_matches(a: &Metadata, b: &Metadata, window: Duration) -> bool {
    match (a.modified().ok(), b.modified().ok()) {
        (Some(x), Some(y)) => {
            let diff = if x > y {
                x.duration_since(y).unwrap_or(Duration::ZERO)
            } else {
                y.duration_since(x).unwrap_or(Duration::ZERO)
            };
            diff <= window
        }
        _ => false,
    }
}

fn walk_error(root: &Path, err: walkdir::Error) -> MirrorError {
    let path = err.path().unwrap_or(root).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
    MirrorError::io(path, source)
}
