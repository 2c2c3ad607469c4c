// Safekeep - 项目文件夹快照备份/恢复工具
//
// 主程序入口，负责命令行参数解析和操作流程协调
//
// 功能特性：
// - 镜像备份：备份目录与项目文件夹保持完全一致
// - 流水线处理：扫描和执行并行进行
// - 可选委托给 rsync / robocopy
// - 自动备份：按固定间隔运行

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use console::{style, Term};
use indicatif::ProgressBar;
use safekeep::cli::{self, MenuChoice};
use safekeep::config::SnapshotConfig;
use safekeep::engine::{Operation, SnapshotEngine};
use safekeep::error::SnapshotError;
use safekeep::folders::FolderKind;
use safekeep::hooks::ProcessRelauncher;
use safekeep::logger;
use safekeep::mirror::MirrorStrategy;
use safekeep::schedule::{self, AutoBackup};
use safekeep::store::{ConfigStore, TomlStore};
use safekeep::task::TaskStatus;
use safekeep::usage::UsageScanner;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 子命令枚举
#[derive(Subcommand, Debug)]
enum Commands {
    /// 把选中的文件夹镜像到备份目录
    Backup,

    /// 从备份目录恢复选中的文件夹
    Restore,

    /// 删除整个备份
    Delete,

    /// 显示备份信息
    Info,

    /// 查看或修改保存的设置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// 按配置的间隔自动备份
    Watch {
        /// 检查间隔（秒）
        #[arg(long, default_value_t = 30)]
        poll: u64,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// 显示所有设置
    Show,

    /// 修改一个设置并保存
    Set { key: String, value: String },
}

/// 命令行参数结构体
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 子命令（省略时进入交互模式）
    #[command(subcommand)]
    command: Option<Commands>,

    /// 项目根目录（默认为当前目录）
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    /// 设置文件路径
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// 本次使用的备份目录
    #[arg(long, global = true)]
    backup_path: Option<PathBuf>,

    /// 本次参与的文件夹（逗号分隔，如 primary-data,settings）
    #[arg(long, global = true, value_delimiter = ',')]
    folders: Option<Vec<FolderKind>>,

    /// 镜像实现（native 或 tool）
    #[arg(long, global = true)]
    strategy: Option<MirrorStrategy>,

    /// 启用内容检查（使用哈希值比较文件，更准确但更慢）
    #[arg(long, global = true)]
    check_content: bool,

    /// 排除模式（Glob 风格）
    #[arg(long, global = true)]
    exclude: Vec<String>,

    /// 工作线程数量
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// 试运行模式（不实际写入）
    #[arg(long, global = true)]
    dry_run: bool,

    /// 批处理模式：不提示，没有选择文件夹时以非零状态退出
    #[arg(long, global = true)]
    batch: bool,

    /// 跳过确认提示
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    /// 输出调试日志
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// 操作完成后用该程序重启宿主
    #[arg(long, global = true)]
    relaunch: Option<PathBuf>,

    /// 重启后执行的方法
    #[arg(long, global = true)]
    continue_with: Option<String>,
}

/// 程序入口
fn main() -> Result<()> {
    let args = Args::parse();

    let project = match &args.project {
        Some(p) => p.clone(),
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let project = std::fs::canonicalize(&project)
        .with_context(|| format!("Project path {:?} does not exist", project))?;

    let store = open_store(&args, &project)?;
    let config = SnapshotConfig::load(store.as_ref(), &project);

    if let Err(e) = logger::init(logger::level_for(args.verbose || config.debug)) {
        eprintln!("{} {}", style("Warning:").yellow(), e);
    }

    match &args.command {
        Some(Commands::Config { action }) => run_config(action, config, store),
        Some(Commands::Backup) => run_operation(&args, config, store, Operation::Backup),
        Some(Commands::Restore) => run_operation(&args, config, store, Operation::Restore),
        Some(Commands::Delete) => run_delete(&args, config, store),
        Some(Commands::Info) => run_info(config, store),
        Some(Commands::Watch { poll }) => run_watch(&args, config, store, *poll),
        None => run_menu(&args, &project),
    }
}

fn open_store(args: &Args, project: &Path) -> Result<Box<dyn ConfigStore>> {
    let store = match &args.store {
        Some(path) => TomlStore::open(path)?,
        None => TomlStore::for_project(project)?,
    };
    Ok(Box::new(store))
}

/// 把命令行参数覆盖到配置上（只对本次运行有效，不保存）
fn apply_overrides(args: &Args, config: &mut SnapshotConfig) -> Result<()> {
    if let Some(path) = &args.backup_path {
        config.custom_backup_path = true;
        config.backup_path = Some(path.clone());
    }
    if let Some(folders) = &args.folders {
        config.folders.include_only(folders);
    }
    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    if args.check_content {
        config.check_content = true;
    }
    if !args.exclude.is_empty() {
        config.exclude.extend(args.exclude.iter().cloned());
    }
    if let Some(workers) = args.workers {
        config.workers = workers.max(1);
    }
    config.validate()?;
    Ok(())
}

fn build_engine(args: &Args, config: SnapshotConfig, store: Box<dyn ConfigStore>) -> SnapshotEngine {
    let progress = !args.batch && Term::stderr().is_term();
    let mut builder = SnapshotEngine::builder(config, store)
        .dry_run(args.dry_run)
        .progress(progress);

    if let Some(exe) = &args.relaunch {
        builder = builder.relauncher(Box::new(ProcessRelauncher::default()), exe);
    }
    if let Some(method) = &args.continue_with {
        builder = builder.continuation(method);
    }
    builder.build()
}

fn run_operation(
    args: &Args,
    mut config: SnapshotConfig,
    store: Box<dyn ConfigStore>,
    operation: Operation,
) -> Result<()> {
    apply_overrides(args, &mut config)?;
    let engine = build_engine(args, config, store);
    let config = engine.config();

    if !args.batch && !args.yes {
        let confirmed = match operation {
            Operation::Backup if config.confirm_backup => cli::confirm_backup(config)?,
            Operation::Restore if config.confirm_restore => {
                cli::confirm_restore(config, &engine.record())?
            }
            _ => true,
        };
        if !confirmed {
            println!("Operation cancelled.");
            return Ok(());
        }
    }

    cli::print_banner();
    let result = match operation {
        Operation::Backup => engine.backup(),
        Operation::Restore => engine.restore(),
    };

    match result {
        Ok(report) => {
            cli::print_report(&report);
            Ok(())
        }
        Err(e) => match cli::exit_code_for(&e, args.batch) {
            Some(code) => {
                if matches!(e, SnapshotError::Busy) {
                    println!("{}", style("Another operation is running, request ignored.").yellow());
                } else {
                    eprintln!("{} {}", style("Error:").red(), e);
                }
                if code != 0 {
                    std::process::exit(code);
                }
                Ok(())
            }
            None => Err(e.into()),
        },
    }
}

fn run_delete(args: &Args, mut config: SnapshotConfig, store: Box<dyn ConfigStore>) -> Result<()> {
    apply_overrides(args, &mut config)?;
    let engine = build_engine(args, config, store);
    let root = engine.config().backup_root();

    if !root.is_dir() {
        println!("{}", style(format!("No backup found at {:?}", root)).yellow());
        return Ok(());
    }
    if !args.batch && !args.yes && !cli::confirm_delete(&root)? {
        println!("Operation cancelled.");
        return Ok(());
    }

    if !engine.delete_backup()? {
        println!("{} Would delete {:?}", style("Dry run:").yellow(), root);
        return Ok(());
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_message("Deleting backup...");
    spinner.enable_steady_tick(Duration::from_millis(100));
    let status = loop {
        let status = engine.wait_for_delete(Duration::from_millis(500));
        if !status.is_running() {
            break status;
        }
    };
    spinner.finish_and_clear();

    match status {
        TaskStatus::Failed(msg) => bail!("Could not delete backup: {}", msg),
        _ => {
            println!("{}", style("Backup deleted.").green().bold());
            Ok(())
        }
    }
}

fn run_info(config: SnapshotConfig, store: Box<dyn ConfigStore>) -> Result<()> {
    let root = config.backup_root();
    let record = safekeep::record::SnapshotRecord::load(store.as_ref(), &root);

    let scanner = UsageScanner::default();
    let usage = if root.is_dir() {
        let spinner = ProgressBar::new_spinner();
        spinner.set_message("Scanning...");
        spinner.enable_steady_tick(Duration::from_millis(100));
        scanner.request(&root);
        scanner.wait(&root, Duration::from_secs(300));
        spinner.finish_and_clear();
        scanner.display(&root)
    } else {
        scanner.display(&root)
    };

    cli::print_banner();
    cli::print_info(&config, &record, &usage);
    Ok(())
}

fn run_config(action: &ConfigAction, mut config: SnapshotConfig, mut store: Box<dyn ConfigStore>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{:<22} {}", "project", config.project_root.display());
            println!("{:<22} {}", "backup root", config.backup_root().display());
            println!("{:<22} {}", "custom_path_backup", config.custom_backup_path);
            println!("{:<22} {}", "vcs", config.vcs);
            println!("{:<22} {}", "restart", config.restart.enabled);
            println!("{:<22} {}", "batchmode", config.restart.batch_mode);
            println!("{:<22} {}", "quit", config.restart.quit);
            println!("{:<22} {}", "no_graphics", config.restart.no_graphics);
            println!("{:<22} {}", "auto_save", config.auto_save);
            println!("{:<22} {}", "confirm_backup", config.confirm_backup);
            println!("{:<22} {}", "confirm_restore", config.confirm_restore);
            println!("{:<22} {}", "confirm_warning", config.confirm_warning);
            println!("{:<22} {}", "debug", config.debug);
            println!("{:<22} {}", "mirror_strategy", config.strategy);
            println!("{:<22} {}", "check_content", config.check_content);
            println!("{:<22} {}", "modify_window_ms", config.modify_window_ms);
            println!("{:<22} {}", "workers", config.workers);
            println!("{:<22} {}", "exclude", config.exclude.join(","));
            println!("{:<22} {}", "auto_backup_interval", config.auto_backup_interval);
            for entry in config.folders.entries() {
                println!("{:<22} {}", entry.kind.store_key(), entry.included);
            }
        }
        ConfigAction::Set { key, value } => {
            config.set_and_save(store.as_mut(), key, value)?;
            println!("{} {} = {}", style("Saved:").green(), key, value);
        }
    }
    Ok(())
}

fn run_watch(args: &Args, mut config: SnapshotConfig, store: Box<dyn ConfigStore>, poll: u64) -> Result<()> {
    apply_overrides(args, &mut config)?;
    if config.auto_backup_interval == 0 {
        bail!("Auto backup is disabled; set auto_backup_interval first");
    }

    let interval = config.auto_backup_interval;
    let engine = build_engine(args, config, store);
    let mut plan = engine
        .records()
        .with_store(|s| AutoBackup::load(interval, s, Utc::now()));

    println!(
        "Auto backup every {} minute(s), next at {:?}",
        interval,
        plan.next_due()
    );
    // 发送端一直存活，循环只会随进程结束
    let (_stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    schedule::watch(&engine, &mut plan, Duration::from_secs(poll.max(1)), &stop_rx);
    Ok(())
}

/// 交互模式主循环
fn run_menu(args: &Args, project: &Path) -> Result<()> {
    if args.batch {
        bail!("A command is required in batch mode");
    }
    cli::print_banner();

    loop {
        let store = open_store(args, project)?;
        let mut config = SnapshotConfig::load(store.as_ref(), project);

        match cli::run_interactive_mode(&config)? {
            MenuChoice::Backup => run_operation(args, config, store, Operation::Backup)?,
            MenuChoice::Restore => run_operation(args, config, store, Operation::Restore)?,
            MenuChoice::Delete => run_delete(args, config, store)?,
            MenuChoice::Info => run_info(config, store)?,
            MenuChoice::SelectFolders => {
                let mut store = store;
                cli::select_folders(&mut config)?;
                config.save(store.as_mut())?;
                println!("{}", style("Folder selection saved.").green());
            }
            MenuChoice::Exit => return Ok(()),
        }
    }
}
