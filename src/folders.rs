// Safekeep - 文件夹集合模块
// 定义参与备份的逻辑文件夹及其包含开关

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// 逻辑文件夹种类
///
/// 声明顺序即镜像顺序：primary-data, derived-cache, settings, dependencies。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FolderKind {
    /// 主要数据（默认 `Assets`）
    PrimaryData,
    /// 派生缓存（默认 `Library`，可以重新生成，默认不备份）
    DerivedCache,
    /// 项目设置（默认 `ProjectSettings`）
    Settings,
    /// 依赖清单（默认 `Packages`）
    Dependencies,
}

impl FolderKind {
    /// 按固定顺序列出所有种类
    pub const ALL: [FolderKind; 4] = [
        FolderKind::PrimaryData,
        FolderKind::DerivedCache,
        FolderKind::Settings,
        FolderKind::Dependencies,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FolderKind::PrimaryData => "primary-data",
            FolderKind::DerivedCache => "derived-cache",
            FolderKind::Settings => "settings",
            FolderKind::Dependencies => "dependencies",
        }
    }

    pub fn default_relative_path(self) -> &'static str {
        match self {
            FolderKind::PrimaryData => "Assets",
            FolderKind::DerivedCache => "Library",
            FolderKind::Settings => "ProjectSettings",
            FolderKind::Dependencies => "Packages",
        }
    }

    pub fn default_included(self) -> bool {
        !matches!(self, FolderKind::DerivedCache)
    }

    /// 配置存储中的键名，如 `copy_primary_data`
    pub fn store_key(self) -> String {
        format!("copy_{}", self.name().replace('-', "_"))
    }
}

impl fmt::Display for FolderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FolderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase().replace('_', "-");
        FolderKind::ALL
            .into_iter()
            .find(|k| k.name() == needle || k.default_relative_path().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown folder '{}'", s))
    }
}

/// 单个逻辑文件夹
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderEntry {
    pub kind: FolderKind,
    /// 相对于项目根目录（以及备份根目录）的路径
    pub relative_path: PathBuf,
    /// 是否参与本次备份/恢复
    pub included: bool,
}

impl FolderEntry {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// 固定的文件夹集合
///
/// 种类集合不可变，只有 `included` 是运行时状态。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSet {
    entries: Vec<FolderEntry>,
}

impl Default for FolderSet {
    fn default() -> Self {
        Self {
            entries: FolderKind::ALL
                .into_iter()
                .map(|kind| FolderEntry {
                    kind,
                    relative_path: PathBuf::from(kind.default_relative_path()),
                    included: kind.default_included(),
                })
                .collect(),
        }
    }
}

impl FolderSet {
    /// 使用自定义相对路径创建文件夹集合，所有文件夹初始为不包含
    pub fn with_paths(paths: [&str; 4]) -> Self {
        let entries = FolderKind::ALL
            .into_iter()
            .zip(paths)
            .map(|(kind, rel)| FolderEntry {
                kind,
                relative_path: PathBuf::from(rel),
                included: false,
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[FolderEntry] {
        &self.entries
    }

    pub fn get(&self, kind: FolderKind) -> &FolderEntry {
        // entries 总是按 FolderKind::ALL 的顺序构建
        &self.entries[kind as usize]
    }

    pub fn set_included(&mut self, kind: FolderKind, included: bool) {
        self.entries[kind as usize].included = included;
    }

    /// 只包含给定的种类，其余全部关闭
    pub fn include_only(&mut self, kinds: &[FolderKind]) {
        for entry in &mut self.entries {
            entry.included = kinds.contains(&entry.kind);
        }
    }

    /// 至少有一个文件夹被包含
    pub fn any_included(&self) -> bool {
        self.entries.iter().any(|e| e.included)
    }

    /// 按声明顺序返回被包含的文件夹
    pub fn included(&self) -> impl Iterator<Item = &FolderEntry> {
        self.entries.iter().filter(|e| e.included)
    }

    /// 项目根目录下所有文件夹的绝对路径
    pub fn source_dirs(&self, root: &Path) -> Vec<PathBuf> {
        self.entries
            .iter()
            .map(|e| root.join(&e.relative_path))
            .collect()
    }
}
