// Safekeep - 配置存储模块
// 键值形式的持久化存储，保存每个项目的设置和备份记录

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use xxhash_rust::xxh3::xxh3_64;

/// 存储中的单个值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

/// 键值配置存储
///
/// `set_*` 只修改内存中的值，`save` 才会落盘。
/// 时间戳以 RFC 3339 字符串保存。
pub trait ConfigStore: Send {
    fn get(&self, key: &str) -> Option<StoreValue>;

    fn set(&mut self, key: &str, value: StoreValue);

    fn remove(&mut self, key: &str);

    /// 把所有修改写入持久化介质
    fn save(&mut self) -> Result<(), StoreError>;

    fn has_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            StoreValue::Bool(b) => Some(b),
            StoreValue::Int(i) => Some(i != 0),
            StoreValue::Str(s) => s.parse().ok(),
        }
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            StoreValue::Int(i) => Some(i),
            StoreValue::Bool(b) => Some(b as i64),
            StoreValue::Str(s) => s.trim().parse().ok(),
        }
    }

    fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            StoreValue::Str(s) => Some(s),
            StoreValue::Bool(b) => Some(b.to_string()),
            StoreValue::Int(i) => Some(i.to_string()),
        }
    }

    fn get_timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        let raw = self.get_string(key)?;
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    fn set_bool(&mut self, key: &str, value: bool) {
        self.set(key, StoreValue::Bool(value));
    }

    fn set_int(&mut self, key: &str, value: i64) {
        self.set(key, StoreValue::Int(value));
    }

    fn set_string(&mut self, key: &str, value: &str) {
        self.set(key, StoreValue::Str(value.to_string()));
    }

    fn set_timestamp(&mut self, key: &str, value: DateTime<Utc>) {
        self.set(
            key,
            StoreValue::Str(value.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)),
        );
    }
}

/// 基于 TOML 文件的存储
///
/// 保存时先写入同目录下的临时文件再重命名，避免中途崩溃留下半个文件。
#[derive(Debug)]
pub struct TomlStore {
    path: PathBuf,
    values: BTreeMap<String, StoreValue>,
}

impl TomlStore {
    /// 打开存储文件，文件不存在时返回空存储
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                values: BTreeMap::new(),
            });
        }

        let content = fs::read_to_string(&path).map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
        })?;
        let values = toml::from_str(&content).map_err(|e| StoreError::Parse {
            path: path.clone(),
            message: e.to_string(),
        })?;

        Ok(Self { path, values })
    }

    /// 打开项目对应的默认存储文件
    pub fn for_project(project_root: &Path) -> Result<Self, StoreError> {
        Self::open(default_store_path(project_root)?)
    }
}

impl ConfigStore for TomlStore {
    fn get(&self, key: &str) -> Option<StoreValue> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: StoreValue) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    fn save(&mut self) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(write_err)?;

        let content = toml::to_string_pretty(&self.values).map_err(|e| StoreError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        let mut tmp = NamedTempFile::new_in(&parent).map_err(write_err)?;
        tmp.write_all(content.as_bytes()).map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

/// 内存存储，用于测试和嵌入场景
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: BTreeMap<String, StoreValue>,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `save` 被调用的次数
    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Option<StoreValue> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: StoreValue) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    fn save(&mut self) -> Result<(), StoreError> {
        self.saves += 1;
        Ok(())
    }
}

/// 获取项目设置文件的默认路径
///
/// 使用 `directories` crate 获取平台标准的配置目录：
/// - Windows: `C:\Users\<用户>\AppData\Roaming\safekeep\projects\`
/// - macOS: `~/Library/Application Support/safekeep/projects/`
/// - Linux: `~/.config/safekeep/projects/`
///
/// 文件名由项目目录名和完整路径的 XXH3 值组成，不同位置的同名项目互不干扰。
pub fn default_store_path(project_root: &Path) -> Result<PathBuf, StoreError> {
    let proj_dirs = ProjectDirs::from("", "", "safekeep").ok_or(StoreError::NoConfigDir)?;
    Ok(proj_dirs
        .config_dir()
        .join("projects")
        .join(store_file_name(project_root)))
}

fn store_file_name(project_root: &Path) -> String {
    let name = project_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    let hash = xxh3_64(project_root.to_string_lossy().as_bytes());
    format!("{}-{:016x}.toml", name, hash)
}
