// Safekeep - 工具函数模块
// 提供路径处理、模式匹配、格式化等辅助功能

use glob::Pattern;
use path_clean::PathClean;
use std::path::{Path, PathBuf};
use tracing::warn;

/// 将路径转换为 Windows 逐字路径格式
///
/// Windows 逐字路径（Verbatim Path）使用 `\\?\` 前缀，可以绕过 MAX_PATH（260 字符）限制。
/// 缓存类文件夹的嵌套很深，镜像时经常超过这个长度。
#[cfg(windows)]
pub fn to_verbatim_path(path: &Path) -> PathBuf {
    let p = path.to_string_lossy();

    // 如果已经是逐字路径格式，直接返回
    if p.starts_with(r"\\?\") {
        return path.to_path_buf();
    }

    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    // 逐字路径不做解析，必须统一使用反斜杠
    let normalized = abs_path.clean().to_string_lossy().replace('/', r"\");

    PathBuf::from(format!(r"\\?\{}", normalized))
}

/// Linux/macOS 没有路径长度限制问题，直接返回原始路径
#[cfg(not(windows))]
pub fn to_verbatim_path(path: &Path) -> PathBuf {
    path.to_path_buf()
}

/// 检查 `path` 是否位于 `root` 之内（包含 `root` 本身）
///
/// 两个路径都会先做词法规范化（处理 `.` 和 `..`），不访问文件系统。
pub fn is_within(root: &Path, path: &Path) -> bool {
    let root = root.clean();
    let path = path.clean();
    path.starts_with(&root)
}

/// 编译 Glob 排除模式，忽略无效的模式
pub fn compile_patterns(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|s| match Pattern::new(s) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(pattern = %s, error = %e, "Invalid glob pattern");
                None
            }
        })
        .collect()
}

/// 检查路径是否匹配任一排除模式
///
/// 模式既与完整的相对路径比较，也与最后一级名称比较：
/// `*.log` 可以匹配 `dir/file.log`，`Temp` 可以匹配任意层级名为 Temp 的目录。
pub fn matches_exclude_pattern(rel_path: &Path, patterns: &[Pattern]) -> bool {
    if patterns.is_empty() {
        return false;
    }

    let path_str = rel_path.to_string_lossy().replace('\\', "/");
    let name = rel_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    patterns
        .iter()
        .any(|pattern| pattern.matches(&path_str) || pattern.matches(&name))
}

/// 格式化字节数为人类可读的单位
///
/// # 示例
/// ```
/// use safekeep::utils::format_bytes;
/// assert_eq!(format_bytes(1024), "1.00 KB");
/// assert_eq!(format_bytes(500), "500 B");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// 格式化秒数为 "Xh Ym Zs" / "Xm Ys" / "Xs"
pub fn format_duration(secs: u64) -> String {
    if secs >= 3600 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;
        format!("{}h {}m {}s", hours, mins, secs)
    } else if secs >= 60 {
        let mins = secs / 60;
        let secs = secs % 60;
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_is_lexical() {
        let root = Path::new("/backup/Assets");
        assert!(is_within(root, Path::new("/backup/Assets/a/b.txt")));
        assert!(is_within(root, Path::new("/backup/Assets")));
        assert!(!is_within(root, Path::new("/backup/Assets/../Library/x")));
        assert!(!is_within(root, Path::new("/backup/AssetsOther")));
    }

    #[test]
    fn exclude_matches_full_path_or_name() {
        let patterns = compile_patterns(&["*.log".to_string(), "Temp".to_string(), "[".to_string()]);
        assert_eq!(patterns.len(), 2);
        assert!(matches_exclude_pattern(Path::new("dir/file.log"), &patterns));
        assert!(matches_exclude_pattern(Path::new("a/Temp"), &patterns));
        assert!(!matches_exclude_pattern(Path::new("a/Temp2/x.txt"), &patterns));
    }

    #[test]
    fn formats_human_units() {
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_duration(3661), "1h 1m 1s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(45), "45s");
    }
}
