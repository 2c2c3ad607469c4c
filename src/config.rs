// Safekeep - 快照配置模块
// 负责从配置存储加载、修改、校验和保存快照配置

use crate::error::{SnapshotError, StoreError};
use crate::folders::{FolderKind, FolderSet};
use crate::mirror::{MirrorOptions, MirrorStrategy};
use crate::store::ConfigStore;
use crate::utils::is_within;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// 默认备份目录名（位于项目根目录下）
pub const BACKUP_DIRNAME: &str = "Backup";

/// 版本控制系统种类，决定忽略规则写到哪里
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VcsKind {
    #[default]
    None,
    Git,
    Svn,
    Mercurial,
    Collab,
    Plastic,
}

impl VcsKind {
    const ALL: [VcsKind; 6] = [
        VcsKind::None,
        VcsKind::Git,
        VcsKind::Svn,
        VcsKind::Mercurial,
        VcsKind::Collab,
        VcsKind::Plastic,
    ];

    /// 存储中的编号（0 = none ... 5 = plastic）
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        usize::try_from(code).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn name(self) -> &'static str {
        match self {
            VcsKind::None => "none",
            VcsKind::Git => "git",
            VcsKind::Svn => "svn",
            VcsKind::Mercurial => "mercurial",
            VcsKind::Collab => "collab",
            VcsKind::Plastic => "plastic",
        }
    }
}

impl fmt::Display for VcsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for VcsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if let Ok(code) = s.parse::<i64>() {
            return Self::from_code(code).ok_or_else(|| format!("Unknown VCS code {}", code));
        }
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("Unknown VCS '{}'", s))
    }
}

/// 操作完成后重启宿主进程的选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartOptions {
    /// 操作完成后是否重启
    pub enabled: bool,
    /// 以批处理模式启动
    pub batch_mode: bool,
    /// 批处理完成后退出
    pub quit: bool,
    /// 禁用图形设备
    pub no_graphics: bool,
}

impl Default for RestartOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_mode: false,
            quit: true,
            no_graphics: false,
        }
    }
}

/// 快照配置
///
/// 进程启动时从存储加载一次，以值的形式交给引擎。
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotConfig {
    /// 项目根目录（运行时参数，不保存）
    pub project_root: PathBuf,

    /// 是否使用自定义备份位置
    pub custom_backup_path: bool,

    /// 自定义备份位置
    pub backup_path: Option<PathBuf>,

    pub vcs: VcsKind,

    pub restart: RestartOptions,

    /// 备份前自动保存所有未保存的文档（否则只保存有修改的）
    pub auto_save: bool,

    pub confirm_backup: bool,
    pub confirm_restore: bool,
    /// 恢复前的额外警告
    pub confirm_warning: bool,

    /// 调试日志
    pub debug: bool,

    pub strategy: MirrorStrategy,

    /// 是否启用内容检查
    pub check_content: bool,

    /// 修改时间比较的容差（毫秒），0 表示精确比较
    pub modify_window_ms: u64,

    /// 工作线程数量
    pub workers: usize,

    /// 排除模式列表（Glob 风格）
    pub exclude: Vec<String>,

    /// 自动备份间隔（分钟，0 表示关闭）
    pub auto_backup_interval: u32,

    pub folders: FolderSet,
}

mod keys {
    pub const CUSTOM_PATH_BACKUP: &str = "custom_path_backup";
    pub const PATH_BACKUP: &str = "path_backup";
    pub const VCS: &str = "vcs";
    pub const RESTART: &str = "restart";
    pub const BATCHMODE: &str = "batchmode";
    pub const QUIT: &str = "quit";
    pub const NO_GRAPHICS: &str = "no_graphics";
    pub const AUTO_SAVE: &str = "auto_save";
    pub const CONFIRM_BACKUP: &str = "confirm_backup";
    pub const CONFIRM_RESTORE: &str = "confirm_restore";
    pub const CONFIRM_WARNING: &str = "confirm_warning";
    pub const DEBUG: &str = "debug";
    pub const MIRROR_STRATEGY: &str = "mirror_strategy";
    pub const CHECK_CONTENT: &str = "check_content";
    pub const MODIFY_WINDOW_MS: &str = "modify_window_ms";
    pub const WORKERS: &str = "workers";
    pub const EXCLUDE: &str = "exclude";
    pub const AUTO_BACKUP_INTERVAL: &str = "auto_backup_interval";
}

impl SnapshotConfig {
    /// 使用默认值创建配置
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            custom_backup_path: false,
            backup_path: None,
            vcs: VcsKind::None,
            restart: RestartOptions::default(),
            auto_save: false,
            confirm_backup: true,
            confirm_restore: true,
            confirm_warning: true,
            debug: false,
            strategy: MirrorStrategy::Native,
            check_content: false,
            modify_window_ms: 0,
            workers: 4,
            exclude: Vec::new(),
            auto_backup_interval: 0,
            folders: FolderSet::default(),
        }
    }

    /// 从存储加载配置
    ///
    /// 只读取存储中存在的键，其余保持默认值。无法解析的值会被忽略。
    pub fn load(store: &dyn ConfigStore, project_root: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(project_root);

        if let Some(v) = store.get_bool(keys::CUSTOM_PATH_BACKUP) {
            config.custom_backup_path = v;
        }
        if let Some(v) = store.get_string(keys::PATH_BACKUP) {
            config.backup_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = store.get_int(keys::VCS).and_then(VcsKind::from_code) {
            config.vcs = v;
        }
        if let Some(v) = store.get_bool(keys::RESTART) {
            config.restart.enabled = v;
        }
        if let Some(v) = store.get_bool(keys::BATCHMODE) {
            config.restart.batch_mode = v;
        }
        if let Some(v) = store.get_bool(keys::QUIT) {
            config.restart.quit = v;
        }
        if let Some(v) = store.get_bool(keys::NO_GRAPHICS) {
            config.restart.no_graphics = v;
        }
        if let Some(v) = store.get_bool(keys::AUTO_SAVE) {
            config.auto_save = v;
        }
        if let Some(v) = store.get_bool(keys::CONFIRM_BACKUP) {
            config.confirm_backup = v;
        }
        if let Some(v) = store.get_bool(keys::CONFIRM_RESTORE) {
            config.confirm_restore = v;
        }
        if let Some(v) = store.get_bool(keys::CONFIRM_WARNING) {
            config.confirm_warning = v;
        }
        if let Some(v) = store.get_bool(keys::DEBUG) {
            config.debug = v;
        }
        if let Some(v) = store
            .get_string(keys::MIRROR_STRATEGY)
            .and_then(|s| s.parse().ok())
        {
            config.strategy = v;
        }
        if let Some(v) = store.get_bool(keys::CHECK_CONTENT) {
            config.check_content = v;
        }
        if let Some(v) = store.get_int(keys::MODIFY_WINDOW_MS) {
            config.modify_window_ms = v.max(0) as u64;
        }
        if let Some(v) = store.get_int(keys::WORKERS) {
            config.workers = v.clamp(1, 256) as usize;
        }
        if let Some(v) = store.get_string(keys::EXCLUDE) {
            config.exclude = split_patterns(&v);
        }
        if let Some(v) = store.get_int(keys::AUTO_BACKUP_INTERVAL) {
            config.auto_backup_interval = u32::try_from(v.unsigned_abs()).unwrap_or(u32::MAX);
        }
        for kind in FolderKind::ALL {
            if let Some(v) = store.get_bool(&kind.store_key()) {
                config.folders.set_included(kind, v);
            }
        }

        config
    }

    /// 把所有键写入存储并落盘
    pub fn save(&self, store: &mut dyn ConfigStore) -> Result<(), StoreError> {
        store.set_bool(keys::CUSTOM_PATH_BACKUP, self.custom_backup_path);
        store.set_string(
            keys::PATH_BACKUP,
            &self
                .backup_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        store.set_int(keys::VCS, self.vcs.code());
        store.set_bool(keys::RESTART, self.restart.enabled);
        store.set_bool(keys::BATCHMODE, self.restart.batch_mode);
        store.set_bool(keys::QUIT, self.restart.quit);
        store.set_bool(keys::NO_GRAPHICS, self.restart.no_graphics);
        store.set_bool(keys::AUTO_SAVE, self.auto_save);
        store.set_bool(keys::CONFIRM_BACKUP, self.confirm_backup);
        store.set_bool(keys::CONFIRM_RESTORE, self.confirm_restore);
        store.set_bool(keys::CONFIRM_WARNING, self.confirm_warning);
        store.set_bool(keys::DEBUG, self.debug);
        store.set_string(keys::MIRROR_STRATEGY, &self.strategy.to_string());
        store.set_bool(keys::CHECK_CONTENT, self.check_content);
        store.set_int(keys::MODIFY_WINDOW_MS, self.modify_window_ms.min(i64::MAX as u64) as i64);
        store.set_int(keys::WORKERS, self.workers as i64);
        store.set_string(keys::EXCLUDE, &self.exclude.join(","));
        store.set_int(keys::AUTO_BACKUP_INTERVAL, i64::from(self.auto_backup_interval));
        for entry in self.folders.entries() {
            store.set_bool(&entry.kind.store_key(), entry.included);
        }

        store.save()
    }

    /// 修改单个设置（键名与存储中的键名一致）并立即保存
    ///
    /// 校验失败时内存中的配置和存储都保持不变。
    ///
    /// # 返回
    /// * `Err(InvalidConfig)` - 未知的键、无法解析的值或修改后校验不通过
    pub fn set_and_save(
        &mut self,
        store: &mut dyn ConfigStore,
        key: &str,
        value: &str,
    ) -> Result<(), SnapshotError> {
        let mut updated = self.clone();
        updated.apply_setting(key, value)?;
        updated.validate()?;
        updated.save(store)?;
        *self = updated;
        Ok(())
    }

    fn apply_setting(&mut self, key: &str, value: &str) -> Result<(), SnapshotError> {
        let bad = |what: &str| SnapshotError::InvalidConfig(format!("{} for '{}': {}", what, key, value));
        let flag = || parse_flag(value).ok_or_else(|| bad("expected true/false"));

        match key {
            keys::CUSTOM_PATH_BACKUP => self.custom_backup_path = flag()?,
            keys::PATH_BACKUP => {
                self.backup_path = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            keys::VCS => self.vcs = value.parse().map_err(|_| bad("unknown VCS"))?,
            keys::RESTART => self.restart.enabled = flag()?,
            keys::BATCHMODE => self.restart.batch_mode = flag()?,
            keys::QUIT => self.restart.quit = flag()?,
            keys::NO_GRAPHICS => self.restart.no_graphics = flag()?,
            keys::AUTO_SAVE => self.auto_save = flag()?,
            keys::CONFIRM_BACKUP => self.confirm_backup = flag()?,
            keys::CONFIRM_RESTORE => self.confirm_restore = flag()?,
            keys::CONFIRM_WARNING => self.confirm_warning = flag()?,
            keys::DEBUG => self.debug = flag()?,
            keys::MIRROR_STRATEGY => {
                self.strategy = value.parse().map_err(|_| bad("unknown strategy"))?
            }
            keys::CHECK_CONTENT => self.check_content = flag()?,
            keys::MODIFY_WINDOW_MS => {
                self.modify_window_ms = value.trim().parse().map_err(|_| bad("expected milliseconds"))?
            }
            keys::WORKERS => {
                self.workers = value
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|w| (1..=256).contains(w))
                    .ok_or_else(|| bad("expected 1-256"))?
            }
            keys::EXCLUDE => self.exclude = split_patterns(value),
            keys::AUTO_BACKUP_INTERVAL => {
                self.auto_backup_interval =
                    value.trim().parse().map_err(|_| bad("expected minutes"))?
            }
            other => {
                let kind = FolderKind::ALL
                    .into_iter()
                    .find(|k| k.store_key() == other)
                    .ok_or_else(|| SnapshotError::InvalidConfig(format!("Unknown setting '{}'", other)))?;
                self.folders.set_included(kind, flag()?);
            }
        }
        Ok(())
    }

    /// 解析后的备份根目录
    pub fn backup_root(&self) -> PathBuf {
        match &self.backup_path {
            Some(path) if self.custom_backup_path && !path.as_os_str().is_empty() => {
                if path.is_absolute() {
                    path.clone()
                } else {
                    self.project_root.join(path)
                }
            }
            _ => self.project_root.join(BACKUP_DIRNAME),
        }
    }

    /// 备份根目录是否存在
    pub fn has_backup(&self) -> bool {
        self.backup_root().is_dir()
    }

    /// 是否使用默认（项目内）备份位置，只有这种情况才需要写忽略规则
    pub fn uses_default_location(&self) -> bool {
        self.backup_root() == self.project_root.join(BACKUP_DIRNAME)
    }

    /// 校验配置
    ///
    /// 备份根目录不能位于任何被镜像的文件夹之内，也不能包含项目根目录，否则镜像会递归到自己身上。
    pub fn validate(&self) -> Result<(), SnapshotError> {
        let root = self.backup_root();

        for (entry, dir) in self
            .folders
            .entries()
            .iter()
            .zip(self.folders.source_dirs(&self.project_root))
        {
            if is_within(&dir, &root) {
                return Err(SnapshotError::InvalidConfig(format!(
                    "Backup path {:?} can't be inside the '{}' folder",
                    root,
                    entry.relative_path.display()
                )));
            }
        }

        if is_within(&root, &self.project_root) {
            return Err(SnapshotError::InvalidConfig(format!(
                "Backup path {:?} can't contain the project itself",
                root
            )));
        }

        Ok(())
    }

    /// 构建镜像选项
    pub fn mirror_options(&self, dry_run: bool, progress: bool) -> MirrorOptions {
        MirrorOptions {
            exclude: self.exclude.clone(),
            check_content: self.check_content,
            modify_window: Duration::from_millis(self.modify_window_ms),
            workers: self.workers,
            dry_run,
            progress,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_patterns(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, TomlStore};
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = SnapshotConfig::new("/work/game");
        assert!(config.folders.get(FolderKind::PrimaryData).included);
        assert!(!config.folders.get(FolderKind::DerivedCache).included);
        assert!(config.restart.quit);
        assert!(!config.restart.batch_mode);
        assert_eq!(config.backup_root(), PathBuf::from("/work/game/Backup"));
        assert!(config.uses_default_location());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");

        let mut config = SnapshotConfig::new(dir.path());
        config.custom_backup_path = true;
        config.backup_path = Some(dir.path().join("elsewhere"));
        config.vcs = VcsKind::Plastic;
        config.restart.no_graphics = true;
        config.strategy = MirrorStrategy::Tool;
        config.exclude = vec!["*.tmp".into(), "Temp".into()];
        config.auto_backup_interval = 30;
        config.folders.include_only(&[FolderKind::DerivedCache]);

        let mut store = TomlStore::open(&path).unwrap();
        config.save(&mut store).unwrap();

        let reopened = TomlStore::open(&path).unwrap();
        let loaded = SnapshotConfig::load(&reopened, dir.path());
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_keeps_defaults_for_missing_keys() {
        let mut store = MemoryStore::new();
        store.set_bool("copy_derived_cache", true);
        let config = SnapshotConfig::load(&store, "/p");
        assert!(config.folders.get(FolderKind::DerivedCache).included);
        assert!(config.folders.get(FolderKind::Settings).included);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn rejects_backup_root_inside_a_folder() {
        let mut config = SnapshotConfig::new("/work/game");
        config.custom_backup_path = true;
        config.backup_path = Some(PathBuf::from("/work/game/Assets/Backup"));
        assert!(matches!(config.validate(), Err(SnapshotError::InvalidConfig(_))));

        config.backup_path = Some(PathBuf::from("/work"));
        assert!(config.validate().is_err());

        config.backup_path = Some(PathBuf::from("/backups/game"));
        assert!(config.validate().is_ok());
        assert!(!config.uses_default_location());
    }

    #[test]
    fn custom_path_is_ignored_unless_enabled() {
        let mut config = SnapshotConfig::new("/work/game");
        config.backup_path = Some(PathBuf::from("/backups/game"));
        assert_eq!(config.backup_root(), PathBuf::from("/work/game/Backup"));
    }

    #[test]
    fn set_and_save_persists_immediately() {
        let mut store = MemoryStore::new();
        let mut config = SnapshotConfig::new("/work/game");

        config
            .set_and_save(&mut store, "copy_primary_data", "false")
            .unwrap();
        config.set_and_save(&mut store, "vcs", "git").unwrap();

        assert_eq!(store.save_count(), 2);
        assert_eq!(store.get_bool("copy_primary_data"), Some(false));
        assert_eq!(store.get_int("vcs"), Some(1));
        assert!(config.set_and_save(&mut store, "workers", "0").is_err());
        assert!(config.set_and_save(&mut store, "colour", "red").is_err());
    }

    #[test]
    fn rejected_setting_leaves_config_and_store_untouched() {
        let mut store = MemoryStore::new();
        let mut config = SnapshotConfig::new("/work/game");
        config.set_and_save(&mut store, "custom_path_backup", "true").unwrap();
        let before = config.clone();

        let err = config.set_and_save(&mut store, "path_backup", "/work/game/Assets/Backup");

        assert!(matches!(err, Err(SnapshotError::InvalidConfig(_))));
        assert_eq!(config, before);
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.get_string("path_backup"), Some(String::new()));
    }

    #[test]
    fn modify_window_defaults_to_exact() {
        let mut store = MemoryStore::new();
        let mut config = SnapshotConfig::new("/work/game");
        assert_eq!(config.mirror_options(false, false).modify_window, Duration::ZERO);

        config.set_and_save(&mut store, "modify_window_ms", "2000").unwrap();
        let loaded = SnapshotConfig::load(&store, "/work/game");
        assert_eq!(
            loaded.mirror_options(false, false).modify_window,
            Duration::from_secs(2)
        );
    }
}
