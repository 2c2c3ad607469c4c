// Safekeep - 同步动作定义
// 定义镜像过程中对每个条目执行的操作和统计数据

use std::path::PathBuf;

/// 同步动作枚举
/// 定义了镜像过程中可以对单个条目执行的操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// 复制新文件（目标中不存在）
    CopyNew,

    /// 覆盖已修改的文件（大小、权限、修改时间或内容不同）
    CopyModified,

    /// 重新创建符号链接（不跟随链接，原样保存目标）
    MakeSymlink(PathBuf),

    /// 创建目录
    CreateDir,

    /// 跳过（目标已经是最新的）
    Skip,
}

/// 文件任务结构体
/// 表示单个条目的镜像任务
#[derive(Debug, Clone)]
pub struct FileTask {
    /// 相对于源目录的路径
    pub rel_path: PathBuf,

    /// 源条目的完整路径
    pub src_path: PathBuf,

    /// 目标条目的完整路径
    pub dest_path: PathBuf,
}

impl FileTask {
    pub fn new(rel_path: PathBuf, src_path: PathBuf, dest_path: PathBuf) -> Self {
        Self {
            rel_path,
            src_path,
            dest_path,
        }
    }
}

/// 目标中多余的条目（源中不存在），需要删除
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    /// 相对于目标目录的路径
    pub rel_path: PathBuf,

    /// 目标条目的完整路径
    pub dest_path: PathBuf,

    /// 是否为目录（目录整体删除）
    pub is_dir: bool,
}

/// 镜像统计信息结构体
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MirrorStats {
    /// 处理的文件总数（不含目录）
    pub total_files: u64,

    /// 复制的新文件数量
    pub copied_new: u64,

    /// 覆盖的已修改文件数量
    pub copied_modified: u64,

    /// 重建的符号链接数量
    pub symlinks: u64,

    /// 未变化而跳过的文件数量
    pub unchanged: u64,

    /// 删除的多余条目数量
    pub deleted: u64,

    /// 失败的条目数量
    pub failed: u64,

    /// 传输的总字节数
    pub bytes_copied: u64,
}

impl MirrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 合并另一个文件夹的统计
    pub fn absorb(&mut self, other: &MirrorStats) {
        self.total_files += other.total_files;
        self.copied_new += other.copied_new;
        self.copied_modified += other.copied_modified;
        self.symlinks += other.symlinks;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
        self.failed += other.failed;
        self.bytes_copied += other.bytes_copied;
    }
}
