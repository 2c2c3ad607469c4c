use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

/// 所有文件夹都未选中的设置文件
fn write_empty_selection(store: &Path) {
    fs::write(
        store,
        "copy_primary_data = false\n\
         copy_derived_cache = false\n\
         copy_settings = false\n\
         copy_dependencies = false\n",
    )
    .unwrap();
}

fn safekeep(project: &Path, store: &Path, extra: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_safekeep"))
        .arg("--project")
        .arg(project)
        .arg("--store")
        .arg(store)
        .args(extra)
        .output()
        .unwrap()
}

#[test]
fn batch_backup_without_folders_exits_with_status_2() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("settings.toml");
    write_empty_selection(&store);

    let out = safekeep(dir.path(), &store, &["--batch", "backup"]);

    assert_eq!(out.status.code(), Some(2));
    assert!(!dir.path().join("Backup").exists());
}

#[test]
fn interactive_backup_without_folders_exits_cleanly() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("settings.toml");
    write_empty_selection(&store);

    let out = safekeep(dir.path(), &store, &["--yes", "backup"]);

    assert_eq!(out.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Error:"));
}
