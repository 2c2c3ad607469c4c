// Safekeep - 错误类型定义
// 区分镜像错误、快照操作错误和配置存储错误

use std::path::PathBuf;
use thiserror::Error;

/// 单个文件夹镜像过程中的错误
///
/// 镜像错误只影响当前文件夹，引擎会记录日志后继续处理后续文件夹。
#[derive(Error, Debug)]
pub enum MirrorError {
    /// 遍历或写入时的 I/O 错误
    #[error("I/O failure at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 外部复制工具无法启动
    #[error("Could not start {tool}: {source}")]
    ToolSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// 外部复制工具返回失败的退出码
    #[error("{tool} exited with {code:?}: {stderr}")]
    ExternalTool {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    /// 试图在目标子树之外写入或删除
    #[error("Refusing to touch {path:?} outside of the mirror destination")]
    Escape { path: PathBuf },
}

impl MirrorError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// 备份/恢复/删除操作的错误
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// 没有选择任何文件夹
    #[error("No folders selected - operation not possible!")]
    NoFoldersSelected,

    /// 已有操作正在进行
    #[error("Another snapshot operation is already running")]
    Busy,

    /// 备份根目录不存在
    #[error("No backup found at {0:?}")]
    NoBackup(PathBuf),

    /// 配置不合法
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// 文件夹循环中出现无法恢复的错误（例如回调 panic）
    #[error("Operation aborted: {0}")]
    Aborted(String),

    /// 配置存储读写失败
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 配置存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read settings file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write settings file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Could not determine config directory")]
    NoConfigDir,
}

pub type Result<T> = std::result::Result<T, SnapshotError>;
