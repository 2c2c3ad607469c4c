// Safekeep - 项目文件夹快照备份/恢复工具
// 模块声明文件

/// 文件同步动作和统计
pub mod actions;

/// 命令行交互界面模块
pub mod cli;

/// 快照配置模块
pub mod config;

/// 快照引擎模块
pub mod engine;

/// 错误类型
pub mod error;

/// 镜像执行器模块
pub mod executor;

/// 逻辑文件夹集合
pub mod folders;

/// 文件哈希计算模块
pub mod hasher;

/// 外部协作者接口
pub mod hooks;

/// 日志初始化
pub mod logger;

/// 目录镜像模块
pub mod mirror;

/// 镜像计划模块（扫描源和目标）
pub mod planner;

/// 备份/恢复记录
pub mod record;

/// 备份删除模块
pub mod retention;

/// 自动备份调度
pub mod schedule;

/// 配置存储模块
pub mod store;

/// 后台任务状态
pub mod task;

/// 备份容量扫描
pub mod usage;

/// 工具函数模块
pub mod utils;

pub use config::SnapshotConfig;
pub use engine::{Operation, SnapshotEngine, SnapshotEvent};
pub use error::{MirrorError, SnapshotError};
pub use folders::{FolderKind, FolderSet};
pub use mirror::{Mirror, MirrorStrategy};
