// Safekeep - 快照记录模块
// 记录最近一次备份/恢复的时间和累计次数，并在备份根目录写入标记文件

use crate::error::StoreError;
use crate::store::ConfigStore;
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// 备份根目录下的标记文件名
pub const MARKER_FILE: &str = "Backup.dat";

/// 标记文件中的时间格式（本地时间）
pub const MARKER_FORMAT: &str = "%Y%m%d%H%M%S";

const BACKUP_DATE: &str = "backup_date";
const BACKUP_COUNT: &str = "backup_count";
const RESTORE_DATE: &str = "restore_date";
const RESTORE_COUNT: &str = "restore_count";

/// 备份/恢复记录
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub last_backup: Option<DateTime<Utc>>,
    pub backup_count: u64,
    pub last_restore: Option<DateTime<Utc>>,
    pub restore_count: u64,
}

impl SnapshotRecord {
    /// 从存储加载；存储中没有备份时间时回退到备份根目录中的标记文件
    pub fn load(store: &dyn ConfigStore, backup_root: &Path) -> Self {
        Self {
            last_backup: store
                .get_timestamp(BACKUP_DATE)
                .or_else(|| read_marker(backup_root)),
            backup_count: count(store, BACKUP_COUNT),
            last_restore: store.get_timestamp(RESTORE_DATE),
            restore_count: count(store, RESTORE_COUNT),
        }
    }

    /// 写入存储（不落盘）
    pub fn write_to(&self, store: &mut dyn ConfigStore) {
        match self.last_backup {
            Some(t) => store.set_timestamp(BACKUP_DATE, t),
            None => store.remove(BACKUP_DATE),
        }
        match self.last_restore {
            Some(t) => store.set_timestamp(RESTORE_DATE, t),
            None => store.remove(RESTORE_DATE),
        }
        store.set_int(BACKUP_COUNT, self.backup_count as i64);
        store.set_int(RESTORE_COUNT, self.restore_count as i64);
    }
}

fn count(store: &dyn ConfigStore, key: &str) -> u64 {
    store
        .get_int(key)
        .map(|v| u64::try_from(v).unwrap_or(0))
        .unwrap_or(0)
}

/// 生成严格大于上一次时间的时间戳
///
/// 时钟回拨或同一时刻连续调用时，在上一次的基础上加 1 毫秒。
pub fn next_timestamp(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(prev) if now <= prev => prev + Duration::milliseconds(1),
        _ => now,
    }
}

/// 在备份根目录写入标记文件
pub fn write_marker(backup_root: &Path, stamp: DateTime<Utc>) -> io::Result<()> {
    let text = stamp.with_timezone(&Local).format(MARKER_FORMAT).to_string();
    fs::write(backup_root.join(MARKER_FILE), text)
}

/// 读取标记文件中的时间，文件缺失或格式错误时返回 `None`
pub fn read_marker(backup_root: &Path) -> Option<DateTime<Utc>> {
    let text = fs::read_to_string(backup_root.join(MARKER_FILE)).ok()?;
    let naive = NaiveDateTime::parse_from_str(text.trim(), MARKER_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

/// 记录簿
///
/// 记录和存储放在一起，由引擎和删除控制器共享。每次修改记录后都会立即落盘。
pub struct RecordBook {
    record: Mutex<SnapshotRecord>,
    store: Mutex<Box<dyn ConfigStore>>,
}

impl RecordBook {
    pub fn new(store: Box<dyn ConfigStore>, record: SnapshotRecord) -> Self {
        Self {
            record: Mutex::new(record),
            store: Mutex::new(store),
        }
    }

    /// 从存储加载记录
    pub fn open(store: Box<dyn ConfigStore>, backup_root: &Path) -> Self {
        let record = SnapshotRecord::load(store.as_ref(), backup_root);
        Self::new(store, record)
    }

    /// 当前记录的副本
    pub fn snapshot(&self) -> SnapshotRecord {
        self.lock_record().clone()
    }

    /// 记录一次备份，返回本次使用的时间戳
    pub fn mark_backup(&self) -> Result<DateTime<Utc>, StoreError> {
        self.update(|r| {
            let stamp = next_timestamp(r.last_backup, Utc::now());
            r.last_backup = Some(stamp);
            r.backup_count += 1;
            stamp
        })
    }

    /// 记录一次恢复，返回本次使用的时间戳
    pub fn mark_restore(&self) -> Result<DateTime<Utc>, StoreError> {
        self.update(|r| {
            let stamp = next_timestamp(r.last_restore, Utc::now());
            r.last_restore = Some(stamp);
            r.restore_count += 1;
            stamp
        })
    }

    /// 备份删除后把计数器清零，时间保持不变
    pub fn reset_counters(&self) -> Result<(), StoreError> {
        self.update(|r| {
            r.backup_count = 0;
            r.restore_count = 0;
        })
    }

    /// 在持有存储锁的情况下访问存储
    pub fn with_store<R>(&self, f: impl FnOnce(&mut dyn ConfigStore) -> R) -> R {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        f(store.as_mut())
    }

    fn update<R>(&self, f: impl FnOnce(&mut SnapshotRecord) -> R) -> Result<R, StoreError> {
        let mut record = self.lock_record();
        let out = f(&mut *record);
        debug!(
            backups = record.backup_count,
            restores = record.restore_count,
            "Record updated"
        );

        let res = self.with_store(|store| {
            record.write_to(store);
            store.save()
        });
        if let Err(e) = &res {
            warn!(error = %e, "Failed to persist snapshot record");
        }
        res.map(|_| out)
    }

    fn lock_record(&self) -> MutexGuard<'_, SnapshotRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    #[test]
    fn timestamps_never_go_backwards() {
        let now = Utc::now();
        assert_eq!(next_timestamp(None, now), now);
        assert_eq!(
            next_timestamp(Some(now), now),
            now + Duration::milliseconds(1)
        );
        let earlier = now - Duration::seconds(5);
        assert!(next_timestamp(Some(now), earlier) > now);
    }

    #[test]
    fn marks_persist_through_the_store() {
        let dir = TempDir::new().unwrap();
        let book = RecordBook::open(Box::new(MemoryStore::new()), dir.path());

        let first = book.mark_backup().unwrap();
        let second = book.mark_backup().unwrap();
        book.mark_restore().unwrap();

        assert!(second > first);
        let record = book.snapshot();
        assert_eq!(record.backup_count, 2);
        assert_eq!(record.restore_count, 1);

        let reloaded = book.with_store(|s| SnapshotRecord::load(s, dir.path()));
        assert_eq!(reloaded, record);
    }

    #[test]
    fn reset_keeps_dates() {
        let dir = TempDir::new().unwrap();
        let book = RecordBook::open(Box::new(MemoryStore::new()), dir.path());
        book.mark_backup().unwrap();
        book.reset_counters().unwrap();

        let record = book.snapshot();
        assert_eq!(record.backup_count, 0);
        assert!(record.last_backup.is_some());
    }

    #[test]
    fn marker_fills_missing_backup_date() {
        let dir = TempDir::new().unwrap();
        let stamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 15).unwrap();
        write_marker(dir.path(), stamp).unwrap();

        let record = SnapshotRecord::load(&MemoryStore::new(), dir.path());
        assert_eq!(record.last_backup, Some(stamp));
        assert_eq!(record.backup_count, 0);
    }

    #[test]
    fn garbage_marker_is_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MARKER_FILE), "yesterday").unwrap();
        assert_eq!(read_marker(dir.path()), None);
    }
}
