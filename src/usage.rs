// Safekeep - 备份容量扫描模块
// 在后台线程计算备份目录的总大小，同一路径同一时间只有一个扫描

use crate::task::TaskStatus;
use crate::utils::format_bytes;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 扫描失败时缓存的默认诊断信息
pub const SCAN_PROBLEM: &str = "Scan problem";

/// 目录大小探针
pub trait SizeProbe: Send + Sync {
    /// 计算目录的总字节数，失败时返回诊断信息
    fn measure(&self, path: &Path) -> Result<u64, String>;
}

/// 内置探针：遍历目录累加文件大小，不跟随符号链接
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeProbe;

impl SizeProbe for NativeProbe {
    fn measure(&self, path: &Path) -> Result<u64, String> {
        let mut total = 0;
        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry.map_err(|e| format!("{}: {}", SCAN_PROBLEM, e))?;
            if entry.file_type().is_file() {
                let meta = entry
                    .metadata()
                    .map_err(|e| format!("{}: {}", SCAN_PROBLEM, e))?;
                total += meta.len();
            }
        }
        Ok(total)
    }
}

/// 使用 `du -sk` 的探针
#[derive(Debug, Clone)]
pub struct DuProbe {
    program: PathBuf,
}

impl Default for DuProbe {
    fn default() -> Self {
        Self {
            program: PathBuf::from("du"),
        }
    }
}

impl DuProbe {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl SizeProbe for DuProbe {
    fn measure(&self, path: &Path) -> Result<u64, String> {
        let output = Command::new(&self.program)
            .arg("-sk")
            .arg(path)
            .output()
            .map_err(|e| format!("{}: {}", SCAN_PROBLEM, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(match stderr.trim() {
                "" => SCAN_PROBLEM.to_string(),
                msg => msg.to_string(),
            });
        }

        parse_du_output(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| SCAN_PROBLEM.to_string())
    }
}

/// 解析 `du -sk` 的输出（最后一个非空行的第一列，单位 KiB）
fn parse_du_output(stdout: &str) -> Option<u64> {
    let line = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    let kib: u64 = line.split_whitespace().next()?.parse().ok()?;
    Some(kib * 1024)
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u64,
    status: TaskStatus<u64>,
}

#[derive(Default)]
struct Cache {
    slots: HashMap<PathBuf, Slot>,
    next_generation: u64,
}

/// 容量扫描器
///
/// 每个路径的结果（或诊断信息）会被缓存，直到调用 [`UsageScanner::invalidate`]。
/// 扫描进行中的重复请求直接返回 `Running`，不会启动第二个扫描。
#[derive(Clone)]
pub struct UsageScanner {
    probe: Arc<dyn SizeProbe>,
    cache: Arc<(Mutex<Cache>, Condvar)>,
}

impl Default for UsageScanner {
    fn default() -> Self {
        Self::new(Arc::new(NativeProbe))
    }
}

impl UsageScanner {
    pub fn new(probe: Arc<dyn SizeProbe>) -> Self {
        Self {
            probe,
            cache: Arc::new((Mutex::new(Cache::default()), Condvar::new())),
        }
    }

    /// 请求扫描；已有结果或正在扫描时直接返回当前状态
    pub fn request(&self, path: &Path) -> TaskStatus<u64> {
        let mut cache = self.lock();
        if let Some(slot) = cache.slots.get(path) {
            return slot.status.clone();
        }

        cache.next_generation += 1;
        let generation = cache.next_generation;
        cache.slots.insert(
            path.to_path_buf(),
            Slot {
                generation,
                status: TaskStatus::Running,
            },
        );
        drop(cache);

        let probe = Arc::clone(&self.probe);
        let shared = Arc::clone(&self.cache);
        let target = path.to_path_buf();
        thread::spawn(move || {
            debug!(path = ?target, "Scanning backup size");
            let status = match panic::catch_unwind(AssertUnwindSafe(|| probe.measure(&target))) {
                Ok(Ok(bytes)) => TaskStatus::Done(bytes),
                Ok(Err(msg)) => {
                    warn!(path = ?target, error = %msg, "Backup size scan failed");
                    TaskStatus::Failed(msg)
                }
                Err(_) => {
                    warn!(path = ?target, "Backup size scan panicked");
                    TaskStatus::Failed(SCAN_PROBLEM.to_string())
                }
            };

            let (lock, cvar) = &*shared;
            let mut cache = lock.lock().unwrap_or_else(|e| e.into_inner());
            // 扫描期间被清除的结果直接丢弃
            if let Some(slot) = cache.slots.get_mut(&target) {
                if slot.generation == generation {
                    slot.status = status;
                }
            }
            cvar.notify_all();
        });

        TaskStatus::Running
    }

    /// 当前状态，不会启动扫描
    pub fn status(&self, path: &Path) -> TaskStatus<u64> {
        self.lock()
            .slots
            .get(path)
            .map(|s| s.status.clone())
            .unwrap_or_default()
    }

    /// 清除缓存的结果，下一次请求会重新扫描
    pub fn invalidate(&self, path: &Path) {
        self.lock().slots.remove(path);
    }

    /// 等待扫描结束，最多等待 `timeout`
    pub fn wait(&self, path: &Path, timeout: Duration) -> TaskStatus<u64> {
        let (lock, cvar) = &*self.cache;
        let deadline = Instant::now() + timeout;
        let mut cache = lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let status = cache
                .slots
                .get(path)
                .map(|s| s.status.clone())
                .unwrap_or_default();
            let now = Instant::now();
            if !status.is_running() || now >= deadline {
                return status;
            }
            cache = match cvar.wait_timeout(cache, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }

    /// 供界面显示的文本
    pub fn display(&self, path: &Path) -> String {
        if !path.exists() {
            return "No backup".to_string();
        }
        match self.request(path) {
            TaskStatus::NotStarted | TaskStatus::Running => "Scanning...".to_string(),
            TaskStatus::Done(bytes) => format_bytes(bytes),
            TaskStatus::Failed(msg) => msg,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Cache> {
        self.cache.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, Receiver};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// 在收到放行信号之前一直阻塞的探针
    struct GatedProbe {
        calls: AtomicUsize,
        gate: Receiver<()>,
    }

    impl SizeProbe for GatedProbe {
        fn measure(&self, _: &Path) -> Result<u64, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate
                .recv_timeout(Duration::from_secs(10))
                .map_err(|_| "gate closed".to_string())?;
            Ok(7)
        }
    }

    struct FailingProbe;

    impl SizeProbe for FailingProbe {
        fn measure(&self, _: &Path) -> Result<u64, String> {
            Err(SCAN_PROBLEM.to_string())
        }
    }

    #[test]
    fn native_probe_sums_file_sizes() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/one"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("a/b/two"), vec![0u8; 28]).unwrap();

        assert_eq!(NativeProbe.measure(dir.path()), Ok(128));
    }

    #[test]
    fn duplicate_requests_share_one_scan() {
        let dir = TempDir::new().unwrap();
        let (open, gate) = bounded(1);
        let probe = Arc::new(GatedProbe {
            calls: AtomicUsize::new(0),
            gate,
        });
        let scanner = UsageScanner::new(probe.clone());

        assert_eq!(scanner.request(dir.path()), TaskStatus::Running);
        assert_eq!(scanner.request(dir.path()), TaskStatus::Running);
        assert_eq!(scanner.display(dir.path()), "Scanning...");

        open.send(()).unwrap();
        assert_eq!(
            scanner.wait(dir.path(), Duration::from_secs(10)),
            TaskStatus::Done(7)
        );
        assert_eq!(scanner.display(dir.path()), "7 B");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        scanner.invalidate(dir.path());
        assert_eq!(scanner.status(dir.path()), TaskStatus::NotStarted);
        scanner.request(dir.path());
        open.send(()).unwrap();
        scanner.wait(dir.path(), Duration::from_secs(10));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failure_is_cached_as_diagnostic() {
        let dir = TempDir::new().unwrap();
        let scanner = UsageScanner::new(Arc::new(FailingProbe));

        scanner.request(dir.path());
        let status = scanner.wait(dir.path(), Duration::from_secs(10));
        assert_eq!(status, TaskStatus::Failed(SCAN_PROBLEM.to_string()));
        assert_eq!(scanner.display(dir.path()), SCAN_PROBLEM);
    }

    struct PanickingProbe;

    impl SizeProbe for PanickingProbe {
        fn measure(&self, _: &Path) -> Result<u64, String> {
            panic!("walker blew up")
        }
    }

    #[test]
    fn panicking_probe_is_cached_as_diagnostic() {
        let dir = TempDir::new().unwrap();
        let scanner = UsageScanner::new(Arc::new(PanickingProbe));

        scanner.request(dir.path());
        let status = scanner.wait(dir.path(), Duration::from_secs(10));
        assert_eq!(status, TaskStatus::Failed(SCAN_PROBLEM.to_string()));
        assert_eq!(scanner.display(dir.path()), SCAN_PROBLEM);
    }

    #[test]
    fn missing_backup_is_reported() {
        let dir = TempDir::new().unwrap();
        let scanner = UsageScanner::default();
        assert_eq!(scanner.display(&dir.path().join("nope")), "No backup");
    }

    #[test]
    fn du_output_parsing() {
        assert_eq!(parse_du_output("12\t/tmp/x\n"), Some(12 * 1024));
        assert_eq!(parse_du_output(""), None);
        assert_eq!(parse_du_output("du: cannot read\n"), None);
    }

    #[test]
    fn du_probe_when_available() {
        if Command::new("du").arg("--version").output().is_err() {
            return;
        }
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f"), vec![1u8; 4096]).unwrap();
        let bytes = DuProbe::default().measure(dir.path()).unwrap();
        assert!(bytes >= 4096);
    }
}
