// Safekeep - 后台任务状态模块
// 后台线程（容量扫描、备份删除）把结果写入共享的状态单元，调用方轮询或限时等待

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// 可轮询的后台任务状态
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TaskStatus<T> {
    #[default]
    NotStarted,
    Running,
    Done(T),
    Failed(String),
}

impl<T> TaskStatus<T> {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }

    /// 已经得到结果（成功或失败）
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Done(_) | TaskStatus::Failed(_))
    }
}

/// 单写者、多读者的任务状态单元
pub struct TaskCell<T> {
    inner: Arc<(Mutex<TaskStatus<T>>, Condvar)>,
}

impl<T> Clone for TaskCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for TaskCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> TaskCell<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(TaskStatus::NotStarted), Condvar::new())),
        }
    }

    pub fn get(&self) -> TaskStatus<T> {
        self.inner.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, status: TaskStatus<T>) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner()) = status;
        cvar.notify_all();
    }

    /// 仅在当前没有运行中的任务时切换到 `Running`
    ///
    /// # 返回
    /// * `true` - 调用方获得了执行权
    pub fn try_start(&self) -> bool {
        let mut status = self.inner.0.lock().unwrap_or_else(|e| e.into_inner());
        if status.is_running() {
            return false;
        }
        *status = TaskStatus::Running;
        true
    }

    /// 等待任务结束，最多等待 `timeout`，返回当时的状态
    pub fn wait(&self, timeout: Duration) -> TaskStatus<T> {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut status = lock.lock().unwrap_or_else(|e| e.into_inner());
        while status.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            status = match cvar.wait_timeout(status, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn only_one_runner_at_a_time() {
        let cell: TaskCell<u64> = TaskCell::new();
        assert!(cell.try_start());
        assert!(!cell.try_start());
        cell.set(TaskStatus::Done(1));
        assert!(cell.try_start());
    }

    #[test]
    fn wait_sees_result_from_another_thread() {
        let cell: TaskCell<u64> = TaskCell::new();
        assert!(cell.try_start());
        let writer = cell.clone();
        let handle = thread::spawn(move || writer.set(TaskStatus::Done(42)));

        assert_eq!(cell.wait(Duration::from_secs(5)), TaskStatus::Done(42));
        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out_while_running() {
        let cell: TaskCell<u64> = TaskCell::new();
        cell.set(TaskStatus::Running);
        assert_eq!(cell.wait(Duration::from_millis(20)), TaskStatus::Running);
    }
}
