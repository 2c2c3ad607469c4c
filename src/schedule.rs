// Safekeep - 自动备份调度模块
// 按固定间隔触发备份，下一次触发时间保存在配置存储中

use crate::engine::{SnapshotEngine, SnapshotEvent};
use crate::error::SnapshotError;
use crate::store::ConfigStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crossbeam_channel::Receiver;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 下一次自动备份时间的键名
pub const AUTO_BACKUP_DATE_KEY: &str = "auto_backup_date";

/// 自动备份计划
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoBackup {
    interval: ChronoDuration,
    next_due: Option<DateTime<Utc>>,
}

impl AutoBackup {
    /// 以分钟为单位创建计划，0 表示关闭
    pub fn new(interval_minutes: u32) -> Self {
        Self::with_interval(ChronoDuration::minutes(i64::from(interval_minutes)))
    }

    pub fn with_interval(interval: ChronoDuration) -> Self {
        Self {
            interval,
            next_due: None,
        }
    }

    /// 从存储恢复下一次触发时间；没有保存的时间时从现在开始计时
    pub fn load(interval_minutes: u32, store: &dyn ConfigStore, now: DateTime<Utc>) -> Self {
        let mut plan = Self::new(interval_minutes);
        plan.next_due = store.get_timestamp(AUTO_BACKUP_DATE_KEY);
        if plan.next_due.is_none() {
            plan.reschedule(now);
        }
        plan
    }

    pub fn is_enabled(&self) -> bool {
        self.interval > ChronoDuration::zero()
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.next_due.filter(|_| self.is_enabled())
    }

    /// 从 `now` 起重新计时
    pub fn reschedule(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_due = self.is_enabled().then(|| now + self.interval);
        self.next_due
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_due().is_some_and(|due| now >= due)
    }

    /// 写入存储并落盘
    pub fn persist(&self, store: &mut dyn ConfigStore) {
        match self.next_due() {
            Some(due) => store.set_timestamp(AUTO_BACKUP_DATE_KEY, due),
            None => store.remove(AUTO_BACKUP_DATE_KEY),
        }
        if let Err(e) = store.save() {
            warn!(error = %e, "Could not save auto backup schedule");
        }
    }
}

/// 运行自动备份循环，直到 `stop` 收到消息或被关闭
///
/// 每个完成通知都会让计划从完成时刻重新计时，手动备份也会推迟下一次自动备份。
///
/// # 返回
/// 自动触发的备份次数
pub fn watch(
    engine: &SnapshotEngine,
    plan: &mut AutoBackup,
    poll: Duration,
    stop: &Receiver<()>,
) -> u64 {
    let events = engine.subscribe();
    let mut runs = 0;

    if !plan.is_enabled() {
        info!("Auto backup is disabled");
        return runs;
    }
    info!(next = ?plan.next_due(), "Auto backup scheduler started");

    loop {
        absorb_events(engine, plan, &events);

        if plan.is_due(Utc::now()) && !engine.is_busy() && !engine.is_deleting() {
            info!("Auto backup due");
            match engine.backup() {
                Ok(report) => {
                    runs += 1;
                    debug!(folders = report.folders.len(), "Auto backup finished");
                }
                Err(SnapshotError::Busy) => debug!("Engine busy, auto backup postponed"),
                Err(e) => {
                    warn!(error = %e, "Auto backup failed");
                    // 失败的尝试也会收到完成通知；没有通知时手动推迟，避免反复重试
                    plan.reschedule(Utc::now());
                    engine.records().with_store(|s| plan.persist(s));
                }
            }
        }

        match stop.recv_timeout(poll) {
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }

    absorb_events(engine, plan, &events);
    info!(runs, "Auto backup scheduler stopped");
    runs
}

/// 每个完成通知都从当前时间重新计时
fn absorb_events(engine: &SnapshotEngine, plan: &mut AutoBackup, events: &Receiver<SnapshotEvent>) {
    let mut changed = false;
    for event in events.try_iter() {
        if let SnapshotEvent::Completed { .. } = event {
            plan.reschedule(Utc::now());
            changed = true;
        }
    }
    if changed {
        engine.records().with_store(|s| plan.persist(s));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn zero_interval_disables() {
        let mut plan = AutoBackup::new(0);
        assert!(!plan.is_enabled());
        assert_eq!(plan.reschedule(Utc::now()), None);
        assert!(!plan.is_due(Utc::now()));
    }

    #[test]
    fn due_after_interval() {
        let now = Utc::now();
        let mut plan = AutoBackup::new(15);
        plan.reschedule(now);
        assert!(!plan.is_due(now + ChronoDuration::minutes(14)));
        assert!(plan.is_due(now + ChronoDuration::minutes(15)));
    }

    #[test]
    fn schedule_survives_reload() {
        let now = Utc::now();
        let mut store = MemoryStore::new();
        let mut plan = AutoBackup::new(30);
        plan.reschedule(now);
        plan.persist(&mut store);

        let later = now + ChronoDuration::minutes(5);
        let reloaded = AutoBackup::load(30, &store, later);
        assert_eq!(reloaded.next_due(), Some(now + ChronoDuration::minutes(30)));
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn fresh_load_starts_counting_now() {
        let now = Utc::now();
        let plan = AutoBackup::load(10, &MemoryStore::new(), now);
        assert_eq!(plan.next_due(), Some(now + ChronoDuration::minutes(10)));
    }
}
