// Safekeep - 快照引擎模块
// 协调一次完整的备份或恢复：检查前置条件、发送通知、按固定顺序镜像每个文件夹、更新记录

use crate::actions::MirrorStats;
use crate::config::{SnapshotConfig, VcsKind, BACKUP_DIRNAME};
use crate::error::{MirrorError, Result, SnapshotError};
use crate::folders::FolderKind;
use crate::hooks::{DirtyStateSaver, Hooks, IgnoreWriter, NoopHost, RelaunchRequest, Relauncher};
use crate::mirror::{build_mirror, Mirror};
use crate::record::{write_marker, RecordBook, SnapshotRecord};
use crate::retention::RetentionController;
use crate::store::ConfigStore;
use crate::task::TaskStatus;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::any::Any;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// 快照操作种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Backup,
    Restore,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Backup => f.write_str("backup"),
            Operation::Restore => f.write_str("restore"),
        }
    }
}

/// 引擎状态
///
/// `Idle → Preparing → Running → Completed`，`Preparing..Running` 期间引擎处于忙碌状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Preparing(Operation),
    Running(Operation),
    Completed { operation: Operation, success: bool },
}

/// 引擎发布的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotEvent {
    /// 通过前置条件检查，即将开始镜像
    Started(Operation),
    /// 操作结束（前置条件失败时也会发送）
    Completed { operation: Operation, success: bool },
    /// 备份删除结束
    Deleted { success: bool },
}

/// 单个文件夹的镜像结果
#[derive(Debug)]
pub struct FolderOutcome {
    pub kind: FolderKind,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub result: std::result::Result<MirrorStats, MirrorError>,
}

impl FolderOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// 一次备份/恢复的报告
#[derive(Debug)]
pub struct OperationReport {
    pub operation: Operation,
    pub folders: Vec<FolderOutcome>,
    /// 写入记录的时间（试运行时为 `None`）
    pub timestamp: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub elapsed: Duration,
}

impl OperationReport {
    /// 镜像失败的文件夹
    pub fn failures(&self) -> impl Iterator<Item = &FolderOutcome> {
        self.folders.iter().filter(|f| !f.is_ok())
    }

    /// 所有成功文件夹的统计之和
    pub fn totals(&self) -> MirrorStats {
        let mut total = MirrorStats::new();
        for stats in self.folders.iter().filter_map(|f| f.result.as_ref().ok()) {
            total.absorb(stats);
        }
        total
    }
}

type Observer = Arc<dyn Fn(&SnapshotEvent) + Send + Sync>;

#[derive(Default)]
struct Observers {
    callbacks: Mutex<Vec<Observer>>,
    channels: Mutex<Vec<Sender<SnapshotEvent>>>,
}

impl Observers {
    fn notify(&self, event: SnapshotEvent) {
        // 先复制列表再调用，回调里可以再次注册或调用引擎
        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for cb in callbacks {
            cb(&event);
        }

        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 引擎构建器
pub struct EngineBuilder {
    config: SnapshotConfig,
    store: Box<dyn ConfigStore>,
    mirror: Option<Box<dyn Mirror>>,
    saver: Box<dyn DirtyStateSaver>,
    ignore: Box<dyn IgnoreWriter>,
    relauncher: Option<(Box<dyn Relauncher>, PathBuf)>,
    continuation: Option<String>,
    dry_run: bool,
    progress: bool,
}

impl EngineBuilder {
    /// 替换镜像实现（默认按配置中的策略构建）
    pub fn mirror(mut self, mirror: Box<dyn Mirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn saver(mut self, saver: Box<dyn DirtyStateSaver>) -> Self {
        self.saver = saver;
        self
    }

    pub fn ignore_writer(mut self, ignore: Box<dyn IgnoreWriter>) -> Self {
        self.ignore = ignore;
        self
    }

    /// 操作成功后用 `executable` 重启宿主（还需要配置中启用 restart）
    pub fn relauncher(mut self, relauncher: Box<dyn Relauncher>, executable: impl Into<PathBuf>) -> Self {
        self.relauncher = Some((relauncher, executable.into()));
        self
    }

    /// 重启后要执行的方法
    pub fn continuation(mut self, method: impl Into<String>) -> Self {
        self.continuation = Some(method.into());
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn build(self) -> SnapshotEngine {
        let mirror = self.mirror.unwrap_or_else(|| {
            build_mirror(
                self.config.strategy,
                self.config.mirror_options(self.dry_run, self.progress),
            )
        });
        let records = Arc::new(RecordBook::open(self.store, &self.config.backup_root()));

        SnapshotEngine {
            retention: RetentionController::new(Arc::clone(&records)),
            records,
            config: self.config,
            mirror,
            saver: self.saver,
            ignore: self.ignore,
            relauncher: self.relauncher,
            continuation: self.continuation,
            hooks: Mutex::new(Hooks::default()),
            observers: Arc::new(Observers::default()),
            busy: AtomicBool::new(false),
            state: Mutex::new(EngineState::Idle),
            dry_run: self.dry_run,
        }
    }
}

/// 快照引擎
///
/// 所有方法只需要 `&self`，引擎可以放进 `Arc` 在多个线程间共享。
/// 同一时间只能运行一个备份/恢复/删除操作，忙碌时的请求直接返回 [`SnapshotError::Busy`]。
pub struct SnapshotEngine {
    config: SnapshotConfig,
    mirror: Box<dyn Mirror>,
    records: Arc<RecordBook>,
    retention: RetentionController,
    saver: Box<dyn DirtyStateSaver>,
    ignore: Box<dyn IgnoreWriter>,
    relauncher: Option<(Box<dyn Relauncher>, PathBuf)>,
    continuation: Option<String>,
    hooks: Mutex<Hooks>,
    observers: Arc<Observers>,
    busy: AtomicBool,
    state: Mutex<EngineState>,
    dry_run: bool,
}

impl SnapshotEngine {
    pub fn builder(config: SnapshotConfig, store: Box<dyn ConfigStore>) -> EngineBuilder {
        EngineBuilder {
            config,
            store,
            mirror: None,
            saver: Box::new(NoopHost),
            ignore: Box::new(NoopHost),
            relauncher: None,
            continuation: None,
            dry_run: false,
            progress: false,
        }
    }

    /// 使用默认协作者创建引擎
    pub fn new(config: SnapshotConfig, store: Box<dyn ConfigStore>) -> Self {
        Self::builder(config, store).build()
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn records(&self) -> &Arc<RecordBook> {
        &self.records
    }

    pub fn record(&self) -> SnapshotRecord {
        self.records.snapshot()
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 备份或恢复正在进行
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn is_deleting(&self) -> bool {
        self.retention.is_deleting()
    }

    pub fn has_backup(&self) -> bool {
        self.config.has_backup()
    }

    /// 注册通知回调，回调在执行操作的线程上同步调用
    pub fn on_event(&self, f: impl Fn(&SnapshotEvent) + Send + Sync + 'static) {
        self.observers
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(f));
    }

    /// 订阅通知通道，接收端被丢弃后自动取消订阅
    pub fn subscribe(&self) -> Receiver<SnapshotEvent> {
        let (tx, rx) = unbounded();
        self.observers
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn on_pre_backup(&self, f: impl Fn() + Send + Sync + 'static) {
        self.lock_hooks().pre_backup.push(Arc::new(f));
    }

    pub fn on_post_backup(&self, f: impl Fn() + Send + Sync + 'static) {
        self.lock_hooks().post_backup.push(Arc::new(f));
    }

    pub fn on_pre_restore(&self, f: impl Fn() + Send + Sync + 'static) {
        self.lock_hooks().pre_restore.push(Arc::new(f));
    }

    pub fn on_post_restore(&self, f: impl Fn() + Send + Sync + 'static) {
        self.lock_hooks().post_restore.push(Arc::new(f));
    }

    /// 把所有包含的文件夹镜像到备份根目录
    pub fn backup(&self) -> Result<OperationReport> {
        self.run(Operation::Backup)
    }

    /// 把备份根目录中的文件夹镜像回项目
    pub fn restore(&self) -> Result<OperationReport> {
        self.run(Operation::Restore)
    }

    /// 在后台删除整个备份根目录
    ///
    /// # 返回
    /// * `Ok(true)` - 删除已在后台开始
    /// * `Ok(false)` - 试运行，没有删除任何东西
    pub fn delete_backup(&self) -> Result<bool> {
        let _guard = self.acquire()?;

        let root = self.config.backup_root();
        if !root.is_dir() {
            return Err(SnapshotError::NoBackup(root));
        }
        if self.dry_run {
            info!(root = ?root, "Dry run: would delete backup");
            return Ok(false);
        }

        let observers = Arc::clone(&self.observers);
        Ok(self.retention.delete_all_then(&root, move |success| {
            observers.notify(SnapshotEvent::Deleted { success });
        }))
    }

    /// 限时等待后台删除结束
    pub fn wait_for_delete(&self, timeout: Duration) -> TaskStatus<PathBuf> {
        self.retention.wait(timeout)
    }

    fn run(&self, operation: Operation) -> Result<OperationReport> {
        let _guard = self.acquire()?;
        self.set_state(EngineState::Preparing(operation));

        if let Err(e) = self.check_preconditions(operation) {
            warn!(%operation, error = %e, "Operation rejected");
            self.finish(operation, false);
            return Err(e);
        }

        let started = Instant::now();
        let root = self.config.backup_root();
        info!(%operation, root = ?root, mirror = self.mirror.name(), dry_run = self.dry_run, "Operation started");
        self.observers.notify(SnapshotEvent::Started(operation));

        if operation == Operation::Backup && !self.dry_run {
            if let Err(source) = fs::create_dir_all(&root) {
                error!(root = ?root, error = %source, "Could not create backup root");
                self.finish(operation, false);
                return Err(SnapshotError::Io { path: root, source });
            }
        }

        let (pre, post) = {
            let hooks = self.lock_hooks();
            match operation {
                Operation::Backup => (hooks.pre_backup.clone(), hooks.post_backup.clone()),
                Operation::Restore => (hooks.pre_restore.clone(), hooks.post_restore.clone()),
            }
        };

        let mut folders = Vec::new();
        let pass = panic::catch_unwind(AssertUnwindSafe(|| {
            self.prepare_host(operation);
            Hooks::run(&pre);
            self.set_state(EngineState::Running(operation));
            self.mirror_folders(operation, &mut folders);
            Hooks::run(&post);
        }));

        // 部分文件夹失败时也推进记录
        let timestamp = if self.dry_run {
            None
        } else {
            let stamp = match operation {
                Operation::Backup => self.records.mark_backup(),
                Operation::Restore => self.records.mark_restore(),
            };
            stamp.ok()
        };

        if let (Operation::Backup, Some(stamp)) = (operation, timestamp) {
            if let Err(e) = write_marker(&root, stamp) {
                warn!(root = ?root, error = %e, "Could not write backup marker");
            }
        }

        let success = pass.is_ok();
        let report = OperationReport {
            operation,
            folders,
            timestamp,
            dry_run: self.dry_run,
            elapsed: started.elapsed(),
        };
        info!(
            %operation,
            success,
            failed_folders = report.failures().count(),
            elapsed = format!("{:.2}s", report.elapsed.as_secs_f64()),
            "Operation finished"
        );
        self.finish(operation, success);

        if let Err(payload) = pass {
            return Err(SnapshotError::Aborted(panic_message(payload.as_ref())));
        }

        self.maybe_relaunch();
        Ok(report)
    }

    fn acquire(&self) -> Result<BusyGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Snapshot operation already running, request ignored");
            return Err(SnapshotError::Busy);
        }
        let guard = BusyGuard(&self.busy);

        if self.retention.is_deleting() {
            info!("Backup deletion in progress, request ignored");
            return Err(SnapshotError::Busy);
        }
        Ok(guard)
    }

    fn check_preconditions(&self, operation: Operation) -> Result<()> {
        if !self.config.folders.any_included() {
            return Err(SnapshotError::NoFoldersSelected);
        }
        self.config.validate()?;

        let root = self.config.backup_root();
        if operation == Operation::Restore && !root.is_dir() {
            return Err(SnapshotError::NoBackup(root));
        }
        Ok(())
    }

    /// 保存宿主的未保存状态，并在需要时写入忽略规则
    ///
    /// 失败只记录日志，不影响后续镜像。
    fn prepare_host(&self, operation: Operation) {
        let saved = if self.config.auto_save {
            self.saver.save_all()
        } else {
            self.saver.save_if_dirty()
        };
        if let Err(e) = saved {
            warn!(error = %e, "Could not save pending changes");
        }

        if operation == Operation::Backup
            && self.config.vcs != VcsKind::None
            && self.config.uses_default_location()
        {
            if let Err(e) =
                self.ignore
                    .write_ignore(&self.config.project_root, BACKUP_DIRNAME, self.config.vcs)
            {
                warn!(vcs = %self.config.vcs, error = %e, "Could not update ignore file");
            }
        }
    }

    /// 按声明顺序依次镜像每个包含的文件夹，单个文件夹失败不影响后续文件夹
    fn mirror_folders(&self, operation: Operation, out: &mut Vec<FolderOutcome>) {
        let project = &self.config.project_root;
        let root = self.config.backup_root();

        for entry in self.config.folders.included() {
            let (source, destination) = match operation {
                Operation::Backup => (project.join(&entry.relative_path), root.join(&entry.relative_path)),
                Operation::Restore => (root.join(&entry.relative_path), project.join(&entry.relative_path)),
            };

            info!(folder = %entry.kind, source = ?source, destination = ?destination, "Mirroring folder");
            let result = self.mirror.mirror(&source, &destination);
            match &result {
                Ok(stats) => info!(
                    folder = %entry.kind,
                    copied = stats.copied_new + stats.copied_modified,
                    deleted = stats.deleted,
                    "Folder mirrored"
                ),
                Err(e) => error!(folder = %entry.kind, error = %e, "Folder mirror failed"),
            }

            out.push(FolderOutcome {
                kind: entry.kind,
                source,
                destination,
                result,
            });
        }
    }

    fn finish(&self, operation: Operation, success: bool) {
        self.set_state(EngineState::Completed { operation, success });
        self.observers
            .notify(SnapshotEvent::Completed { operation, success });
    }

    fn maybe_relaunch(&self) {
        let restart = &self.config.restart;
        let Some((relauncher, executable)) = &self.relauncher else {
            return;
        };
        if !restart.enabled || self.dry_run {
            return;
        }

        let request = RelaunchRequest {
            executable: executable.clone(),
            project_root: self.config.project_root.clone(),
            batch_mode: restart.batch_mode,
            quit: restart.quit,
            no_graphics: restart.no_graphics,
            continuation: self.continuation.clone(),
        };
        if let Err(e) = relauncher.relaunch(&request) {
            warn!(error = %e, "Relaunch failed");
        }
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn lock_hooks(&self) -> std::sync::MutexGuard<'_, Hooks> {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic during folder mirroring".to_string()
    }
}
