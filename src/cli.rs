// Safekeep - 命令行交互界面模块
// 提供交互式菜单、确认提示和结果输出

use anyhow::Result;
use console::style;
use dialoguer::{theme::ColorfulTheme, Confirm, MultiSelect, Select};
use std::path::Path;

use crate::config::SnapshotConfig;
use crate::engine::{Operation, OperationReport};
use crate::error::SnapshotError;
use crate::record::SnapshotRecord;
use crate::utils::{format_bytes, format_duration};

/// 批处理模式下没有选择任何文件夹时的退出码
pub const EXIT_NO_FOLDERS: i32 = 2;

/// 可以在命令行层面处理掉的错误对应的退出码
///
/// 返回 `None` 时错误应继续向上传播。
pub fn exit_code_for(err: &SnapshotError, batch: bool) -> Option<i32> {
    match err {
        SnapshotError::NoFoldersSelected if batch => Some(EXIT_NO_FOLDERS),
        SnapshotError::NoFoldersSelected | SnapshotError::Busy => Some(0),
        _ => None,
    }
}

/// 交互式菜单的选项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    Backup,
    Restore,
    Delete,
    SelectFolders,
    Info,
    Exit,
}

const MENU: [(MenuChoice, &str); 6] = [
    (MenuChoice::Backup, "Backup"),
    (MenuChoice::Restore, "Restore"),
    (MenuChoice::Delete, "Delete backup"),
    (MenuChoice::SelectFolders, "Select folders"),
    (MenuChoice::Info, "Show info"),
    (MenuChoice::Exit, ">> Exit"),
];

pub fn print_banner() {
    println!(
        "{}",
        style(format!("Safekeep Snapshot Tool v{}", env!("CARGO_PKG_VERSION")))
            .cyan()
            .bold()
    );
    println!("{}", style("----------------------------------------").dim());
}

/// 显示主菜单并返回用户的选择
///
/// 没有备份时不显示恢复和删除选项。
pub fn run_interactive_mode(config: &SnapshotConfig) -> Result<MenuChoice> {
    let has_backup = config.has_backup();
    let choices: Vec<(MenuChoice, &str)> = MENU
        .into_iter()
        .filter(|(c, _)| has_backup || !matches!(c, MenuChoice::Restore | MenuChoice::Delete))
        .collect();
    let labels: Vec<&str> = choices.iter().map(|(_, l)| *l).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Project {:?}", config.project_root))
        .default(0)
        .items(&labels)
        .interact()?;

    Ok(choices[selection].0)
}

/// 勾选参与备份的文件夹
pub fn select_folders(config: &mut SnapshotConfig) -> Result<()> {
    let entries = config.folders.entries().to_vec();
    let labels: Vec<String> = entries
        .iter()
        .map(|e| format!("{} ({})", e.name(), e.relative_path.display()))
        .collect();
    let defaults: Vec<bool> = entries.iter().map(|e| e.included).collect();

    let picked = MultiSelect::with_theme(&ColorfulTheme::default())
        .with_prompt("Folders to back up (space to toggle)")
        .items(&labels)
        .defaults(&defaults)
        .interact()?;

    for (i, entry) in entries.iter().enumerate() {
        config.folders.set_included(entry.kind, picked.contains(&i));
    }
    Ok(())
}

/// 备份前确认
pub fn confirm_backup(config: &SnapshotConfig) -> Result<bool> {
    print_plan(config, Operation::Backup);
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Start backup?")
        .default(true)
        .interact()?)
}

/// 恢复前确认；启用警告时还要再确认一次
pub fn confirm_restore(config: &SnapshotConfig, record: &SnapshotRecord) -> Result<bool> {
    print_plan(config, Operation::Restore);
    if let Some(t) = record.last_backup {
        println!("Backup from:  {}", style(t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")).yellow());
    }

    let theme = ColorfulTheme::default();
    if !Confirm::with_theme(&theme)
        .with_prompt("Start restore?")
        .default(false)
        .interact()?
    {
        return Ok(false);
    }

    if config.confirm_warning {
        println!(
            "{}",
            style("Restoring overwrites the selected folders. Changes made since the backup are lost!")
                .red()
                .bold()
        );
        return Ok(Confirm::with_theme(&theme)
            .with_prompt("Are you sure?")
            .default(false)
            .interact()?);
    }
    Ok(true)
}

/// 删除前确认
pub fn confirm_delete(root: &Path) -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Delete the whole backup at {}?",
            style(root.display()).red().bold()
        ))
        .default(false)
        .interact()?)
}

fn print_plan(config: &SnapshotConfig, operation: Operation) {
    let names: Vec<&str> = config.folders.included().map(|e| e.name()).collect();
    println!("Operation:    {}", style(operation).bold());
    println!("Project:      {:?}", style(&config.project_root).blue());
    println!("Backup root:  {:?}", style(config.backup_root()).blue());
    println!("Folders:      {}", style(names.join(", ")).green());
}

/// 打印操作报告
pub fn print_report(report: &OperationReport) {
    println!("{}", style("----------------------------------------").dim());
    for folder in &report.folders {
        match &folder.result {
            Ok(stats) => println!(
                "{:<14} {} new, {} modified, {} deleted",
                style(folder.kind).green(),
                stats.copied_new,
                stats.copied_modified,
                stats.deleted
            ),
            Err(e) => println!("{:<14} {}", style(folder.kind).red(), style(e).red()),
        }
    }

    let totals = report.totals();
    let failed = report.failures().count();
    let title = format!("{} completed", capitalize(&report.operation.to_string()));
    if failed == 0 {
        println!("{}", style(title).green().bold());
    } else {
        println!(
            "{}",
            style(format!("{} with {} failed folder(s)", title, failed))
                .yellow()
                .bold()
        );
    }
    if report.dry_run {
        println!("{}", style("Dry run: nothing was written").yellow());
    }
    println!("Total Files:      {}", totals.total_files);
    println!("Unchanged:        {}", style(totals.unchanged).dim());
    println!("Symlinks:         {}", totals.symlinks);
    println!("Data Transferred: {}", style(format_bytes(totals.bytes_copied)).cyan());
    println!(
        "Total Duration:   {}",
        style(format_duration(report.elapsed.as_secs())).bold()
    );
}

/// 打印项目和备份信息
pub fn print_info(config: &SnapshotConfig, record: &SnapshotRecord, usage: &str) {
    let fmt_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string())
    };

    println!("Project:      {:?}", style(&config.project_root).blue());
    println!("Backup root:  {:?}", style(config.backup_root()).blue());
    println!("Backup size:  {}", style(usage).cyan());
    println!(
        "Last backup:  {} ({} total)",
        fmt_time(record.last_backup),
        record.backup_count
    );
    println!(
        "Last restore: {} ({} total)",
        fmt_time(record.last_restore),
        record.restore_count
    );
    for entry in config.folders.entries() {
        let mark = if entry.included { "✓" } else { "✗" };
        println!("  [{}] {} ({})", mark, entry.name(), entry.relative_path.display());
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_folders_fails_only_in_batch_mode() {
        assert_eq!(exit_code_for(&SnapshotError::NoFoldersSelected, true), Some(2));
        assert_eq!(exit_code_for(&SnapshotError::NoFoldersSelected, false), Some(0));
    }

    #[test]
    fn busy_is_reported_but_not_fatal() {
        assert_eq!(exit_code_for(&SnapshotError::Busy, true), Some(0));
        assert_eq!(exit_code_for(&SnapshotError::Busy, false), Some(0));
    }

    #[test]
    fn other_errors_propagate() {
        assert_eq!(exit_code_for(&SnapshotError::NoBackup("/p/Backup".into()), true), None);
        assert_eq!(
            exit_code_for(&SnapshotError::InvalidConfig("bad".into()), false),
            None
        );
    }
}
