//! In-memory mirror of a ledger, with retention and size-bounded eviction.

use crate::config::MemoryConfig;
use crate::driver::PersistenceDriver;
use crate::error::Result;
use crate::record::Record;
use crate::subscription::Filter;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Records copied out per lock acquisition while iterating.
const READ_CHUNK: usize = 256;

/// Minimum spacing between two size alarms for one ledger.
pub(crate) const ALARM_INTERVAL: Duration = Duration::from_secs(5);

/// What one housekeeping pass did to a ledger's memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    /// Records removed because they failed the retention filter.
    pub expired: usize,
    /// Records evicted oldest-first to get down to the preferred size.
    pub evicted: usize,
    /// Records left in memory afterwards.
    pub remaining: usize,
    /// Whether this pass raised a size alarm.
    pub alarm_raised: bool,
}

/// Retention filter keeping records whose timestamp is within `max_age` of now.
///
/// The cutoff moves with the clock: it is evaluated against `Utc::now()` every
/// time the filter runs.
///
/// # Examples
///
/// ```
/// use chrono::{Duration, Utc};
/// use eventledger::{Record, retain_newer_than};
/// use serde_json::{Value, json};
///
/// let keep = retain_newer_than::<Value>(Duration::hours(25));
/// assert!(keep(&Record::new("price_update", Utc::now(), json!({}))));
/// assert!(!keep(&Record::new("price_update", Utc::now() - Duration::hours(26), json!({}))));
/// ```
pub fn retain_newer_than<P: 'static>(max_age: chrono::Duration) -> Filter<P> {
    Arc::new(move |record: &Record<P>| record.timestamp() >= Utc::now() - max_age)
}

/// Allows an action at most once per interval.
pub(crate) struct Throttle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub(crate) fn new(interval: Duration) -> Self {
        Throttle {
            interval,
            last: Mutex::new(None),
        }
    }

    pub(crate) fn ready(&self) -> bool {
        let mut last = self.last.lock();
        match *last {
            Some(at) if at.elapsed() < self.interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

pub(crate) struct MemoryCache<P> {
    records: RwLock<VecDeque<Arc<Record<P>>>>,
    retention: Option<Filter<P>>,
    preferred_max_size: usize,
    alarm_size: usize,
    alarm: Throttle,
    alarms: AtomicU64,
    housekeeping: Mutex<()>,
}

fn id_of<P>(record: &Record<P>) -> u64 {
    record.sequence_id().unwrap_or(0)
}

impl<P> MemoryCache<P> {
    pub(crate) fn new(retention: Option<Filter<P>>, config: &MemoryConfig) -> Self {
        MemoryCache {
            records: RwLock::new(VecDeque::new()),
            retention,
            preferred_max_size: config.preferred_max_size,
            alarm_size: config.alarm_size,
            alarm: Throttle::new(ALARM_INTERVAL),
            alarms: AtomicU64::new(0),
            housekeeping: Mutex::new(()),
        }
    }

    /// Load the driver's history, keeping what passes the retention filter.
    ///
    /// Returns the highest sequence id seen on disk, retained or not.
    pub(crate) fn hydrate(&self, driver: &dyn PersistenceDriver<P>) -> Result<u64> {
        let mut loaded = VecDeque::new();
        let mut max_id = 0;
        driver.read(None, &mut |record| {
            max_id = max_id.max(id_of(&record));
            if self.retention.as_ref().is_none_or(|keep| keep(&record)) {
                loaded.push_back(Arc::new(record));
            }
            true
        })?;
        loaded.make_contiguous().sort_by_key(|r| id_of(r));

        *self.records.write() = loaded;
        Ok(max_id)
    }

    /// Append the record produced by `commit` while holding the write lock.
    ///
    /// Running id assignment inside the lock keeps memory ordered by id.
    pub(crate) fn push_with(&self, commit: impl FnOnce() -> Arc<Record<P>>) -> Arc<Record<P>> {
        let mut records = self.records.write();
        let record = commit();
        records.push_back(Arc::clone(&record));
        record
    }

    pub(crate) fn len(&self) -> usize {
        self.records.read().len()
    }

    pub(crate) fn preferred_max_size(&self) -> usize {
        self.preferred_max_size
    }

    pub(crate) fn alarm_size(&self) -> usize {
        self.alarm_size
    }

    pub(crate) fn alarms(&self) -> u64 {
        self.alarms.load(Ordering::Relaxed)
    }

    /// Iterate oldest to newest over ids greater than `from`.
    ///
    /// The read lock is held only while copying the next chunk of handles, so
    /// writers keep appending while the callback runs.
    pub(crate) fn read(
        &self,
        from: Option<u64>,
        filter: Option<&dyn Fn(&Record<P>) -> bool>,
        callback: &mut dyn FnMut(&Record<P>) -> bool,
    ) {
        let mut cursor = from;
        loop {
            let chunk: Vec<Arc<Record<P>>> = {
                let records = self.records.read();
                let start = match cursor {
                    None => 0,
                    Some(id) => records.partition_point(|r| id_of(r) <= id),
                };
                records.range(start..).take(READ_CHUNK).cloned().collect()
            };
            let Some(last) = chunk.last() else {
                return;
            };
            cursor = last.sequence_id();
            for record in chunk.iter().map(|r| &**r) {
                if filter.is_none_or(|accept| accept(record)) && !callback(record) {
                    return;
                }
            }
        }
    }

    /// Iterate newest to oldest over ids smaller than `from`.
    pub(crate) fn read_reverse(
        &self,
        from: Option<u64>,
        filter: Option<&dyn Fn(&Record<P>) -> bool>,
        callback: &mut dyn FnMut(&Record<P>) -> bool,
    ) {
        let mut cursor = from;
        loop {
            let chunk: Vec<Arc<Record<P>>> = {
                let records = self.records.read();
                let end = match cursor {
                    None => records.len(),
                    Some(id) => records.partition_point(|r| id_of(r) < id),
                };
                let start = end.saturating_sub(READ_CHUNK);
                records.range(start..end).rev().cloned().collect()
            };
            let Some(last) = chunk.last() else {
                return;
            };
            cursor = last.sequence_id();
            for record in chunk.iter().map(|r| &**r) {
                if filter.is_none_or(|accept| accept(record)) && !callback(record) {
                    return;
                }
            }
        }
    }

    /// Snapshot of the newest `n` records, newest first.
    pub(crate) fn latest_n(&self, n: usize) -> Vec<Arc<Record<P>>> {
        self.records.read().iter().rev().take(n).cloned().collect()
    }

    /// Apply retention, then evict oldest-first down to the preferred size.
    ///
    /// Never touches durable storage.
    pub(crate) fn housekeeping(&self, kind: &str) -> HousekeepingReport {
        let _pass = self.housekeeping.lock();
        let (expired, evicted) = {
            let mut records = self.records.write();
            let before = records.len();
            if let Some(keep) = &self.retention {
                records.retain(|record| keep(&**record));
            }
            let expired = before - records.len();
            let excess = records.len().saturating_sub(self.preferred_max_size);
            records.drain(..excess);
            (expired, excess)
        };

        // Writers may have appended since the lock was released.
        let remaining = self.len();
        let alarm_raised = remaining > self.alarm_size && self.alarm.ready();
        if alarm_raised {
            self.alarms.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "eventledger: ALARM: memory for '{kind}' holds {remaining} records, above alarm size {}",
                self.alarm_size
            );
        }

        HousekeepingReport {
            expired,
            evicted,
            remaining,
            alarm_raised,
        }
    }
}
