use crate::config::LedgerConfig;
use crate::dispatch::{DispatchMode, Dispatcher};
use crate::driver::{DiskDriver, PersistenceDriver};
use crate::error::{LedgerError, Result};
use crate::memory::{HousekeepingReport, MemoryCache};
use crate::record::{Record, RecordKind};
use crate::subscription::{Filter, Subscribers, SubscriptionId};
use crate::write_behind::WriteBehind;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Lifecycle of a [`Ledger`].
///
/// `Constructing -> Ready -> Closing -> Closed`. Writes and reads require
/// `Ready`; flushing is allowed in every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    Constructing,
    Ready,
    Closing,
    Closed,
}

impl LedgerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LedgerState::Constructing,
            1 => LedgerState::Ready,
            2 => LedgerState::Closing,
            _ => LedgerState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerState::Constructing => "constructing",
            LedgerState::Ready => "ready",
            LedgerState::Closing => "closing",
            LedgerState::Closed => "closed",
        }
    }
}

/// Where a ledger keeps its records and when they reach disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Every write goes straight to the driver; reads stream from disk.
    Disk,
    /// Records live in memory and are written to disk before `write` returns.
    Memory,
    /// Records live in memory and a background worker writes them to disk.
    #[default]
    WriteBehind,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Disk => "disk",
            Strategy::Memory => "memory",
            Strategy::WriteBehind => "write_behind",
        }
    }

    fn keeps_memory(&self) -> bool {
        !matches!(self, Strategy::Disk)
    }
}

/// Per-ledger options: strategy, retention filter and file name.
///
/// # Examples
///
/// ```
/// use chrono::Duration;
/// use eventledger::{LedgerOptions, Strategy, retain_newer_than};
/// use serde_json::Value;
///
/// let options: LedgerOptions<Value> = LedgerOptions::new(Strategy::Memory)
///     .retention(retain_newer_than(Duration::hours(25)))
///     .file_name("prices.log");
/// assert_eq!(options.strategy(), Strategy::Memory);
/// ```
pub struct LedgerOptions<P = Value> {
    strategy: Strategy,
    retention: Option<Filter<P>>,
    file_name: Option<String>,
}

impl<P> LedgerOptions<P> {
    pub fn new(strategy: Strategy) -> Self {
        LedgerOptions {
            strategy,
            retention: None,
            file_name: None,
        }
    }

    /// Records failing `keep` are skipped at hydration and removed by housekeeping.
    ///
    /// Ignored by [`Strategy::Disk`].
    pub fn retention(mut self, keep: Filter<P>) -> Self {
        self.retention = Some(keep);
        self
    }

    /// Override the default `"<kind>.log"` file name used by the registry.
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub(crate) fn file_name_for(&self, kind: &RecordKind) -> String {
        self.file_name
            .clone()
            .unwrap_or_else(|| format!("{}.log", kind.as_str()))
    }
}

impl<P> Default for LedgerOptions<P> {
    fn default() -> Self {
        LedgerOptions::new(Strategy::default())
    }
}

impl<P> std::fmt::Debug for LedgerOptions<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerOptions")
            .field("strategy", &self.strategy)
            .field("retention", &self.retention.is_some())
            .field("file_name", &self.file_name)
            .finish()
    }
}

/// An append-only ledger for one record kind.
///
/// Assigns each written record the next sequence id, stores it according to
/// its [`Strategy`] and hands it to every matching subscriber.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use eventledger::{Ledger, LedgerConfig, LedgerOptions, Strategy};
/// use serde_json::{Value, json};
///
/// let dir = tempfile::tempdir().unwrap();
/// let ledger: Ledger<Value> = Ledger::open_file(
///     "price_update",
///     dir.path().join("price_update.log"),
///     LedgerOptions::new(Strategy::Memory),
///     &LedgerConfig::default(),
/// )
/// .unwrap();
///
/// let first = ledger.write(json!({"symbol": "ABC", "price": 10.5}), Utc::now()).unwrap();
/// let second = ledger.write_now(json!({"symbol": "ABC", "price": 10.75})).unwrap();
/// assert_eq!((first, second), (1, 2));
///
/// let mut prices = Vec::new();
/// ledger
///     .read(None, None, |record| {
///         prices.push(record.payload()["price"].as_f64().unwrap());
///         true
///     })
///     .unwrap();
/// assert_eq!(prices, vec![10.5, 10.75]);
/// ```
pub struct Ledger<P = Value> {
    kind: RecordKind,
    strategy: Strategy,
    driver: Arc<dyn PersistenceDriver<P>>,
    counter: AtomicU64,
    state: AtomicU8,
    // Writers hold it shared; close takes it exclusively to wait them out.
    inflight: RwLock<()>,
    write_order: Mutex<()>,
    subscribers: Subscribers<P>,
    dispatcher: Arc<Dispatcher>,
    owns_dispatcher: bool,
    memory: Option<MemoryCache<P>>,
    write_behind: Option<WriteBehind<P>>,
    disk_size: Mutex<Option<u64>>,
    started: DateTime<Utc>,
}

impl<P> std::fmt::Debug for Ledger<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("kind", &self.kind)
            .field("strategy", &self.strategy)
            .field("state", &self.state())
            .field("sequence", &self.sequence())
            .finish()
    }
}

impl<P> Ledger<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open a standalone ledger over the JSON-lines file at `path`.
    ///
    /// The ledger gets its own ordered notification worker, shut down on close.
    pub fn open_file(
        kind: impl Into<RecordKind>,
        path: impl AsRef<Path>,
        options: LedgerOptions<P>,
        config: &LedgerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let kind = kind.into();
        let driver: Arc<dyn PersistenceDriver<P>> =
            Arc::new(DiskDriver::open(kind.clone(), path, config)?);
        let dispatcher = Arc::new(Dispatcher::new(DispatchMode::Ordered)?);
        Self::build(kind, driver, options, config, dispatcher, true)
    }
}

impl<P> Ledger<P>
where
    P: Send + Sync + 'static,
{
    /// Open a ledger over any persistence driver, notifying through `dispatcher`.
    ///
    /// Recovers the sequence counter from the driver and, for memory-first
    /// strategies, loads the retained history into memory.
    pub fn open(
        kind: impl Into<RecordKind>,
        driver: Arc<dyn PersistenceDriver<P>>,
        options: LedgerOptions<P>,
        config: &LedgerConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        config.validate()?;
        Self::build(kind.into(), driver, options, config, dispatcher, false)
    }

    fn build(
        kind: RecordKind,
        driver: Arc<dyn PersistenceDriver<P>>,
        options: LedgerOptions<P>,
        config: &LedgerConfig,
        dispatcher: Arc<Dispatcher>,
        owns_dispatcher: bool,
    ) -> Result<Self> {
        let strategy = options.strategy;
        let memory = strategy
            .keeps_memory()
            .then(|| MemoryCache::new(options.retention, &config.memory));

        let mut ledger = Ledger {
            kind,
            strategy,
            driver,
            counter: AtomicU64::new(0),
            state: AtomicU8::new(LedgerState::Constructing as u8),
            inflight: RwLock::new(()),
            write_order: Mutex::new(()),
            subscribers: Subscribers::new(),
            dispatcher,
            owns_dispatcher,
            memory,
            write_behind: None,
            disk_size: Mutex::new(None),
            started: Utc::now(),
        };

        let mut last = ledger.driver.last_sequence_id()?;
        if let Some(memory) = &ledger.memory {
            last = last.max(memory.hydrate(ledger.driver.as_ref())?);
        }
        ledger.counter.store(last, Ordering::SeqCst);

        if strategy == Strategy::WriteBehind {
            ledger.write_behind = Some(WriteBehind::start(
                ledger.kind.as_str(),
                Arc::clone(&ledger.driver),
                config.write_behind_queue_capacity,
            )?);
        }

        ledger.set_state(LedgerState::Ready);
        log::info!(
            "eventledger: opened '{}' ({}) at sequence {last}, {} records in memory",
            ledger.kind,
            strategy.as_str(),
            ledger.memory.as_ref().map_or(0, |m| m.len())
        );
        Ok(ledger)
    }

    /// Write `payload` stamped with `timestamp`, returning its sequence id.
    pub fn write(&self, payload: P, timestamp: DateTime<Utc>) -> Result<u64> {
        self.append(Record::new(self.kind.clone(), timestamp, payload))
    }

    /// Write `payload` stamped with the current time.
    pub fn write_now(&self, payload: P) -> Result<u64> {
        self.write(payload, Utc::now())
    }

    /// Commit a caller-built record.
    ///
    /// The record must be of this ledger's kind and not yet carry a sequence id.
    pub fn append(&self, record: Record<P>) -> Result<u64> {
        if record.kind() != &self.kind {
            return Err(LedgerError::KindMismatch {
                expected: self.kind.clone(),
                found: record.kind().clone(),
            });
        }
        if let Some(sequence_id) = record.sequence_id() {
            return Err(LedgerError::AlreadyCommitted { sequence_id });
        }

        // Recursive so a callback running inline after shutdown cannot
        // deadlock against a pending close.
        let _inflight = self.inflight.read_recursive();
        self.ensure_ready()?;

        // Held from id assignment through notification, so the file, the
        // cache and every subscriber see records in id order.
        let order = self.write_order.lock();
        let (id, persisted, deferred) = match (&self.memory, &self.write_behind) {
            (Some(memory), Some(queue)) => {
                let record = memory.push_with(|| self.commit(record));
                let id = committed_id(&record);
                if !queue.enqueue(&record) {
                    log::debug!("eventledger: '{}' record {id} is held in memory only", self.kind);
                }
                (id, Ok(()), self.subscribers.notify(record, &self.dispatcher))
            }
            (Some(memory), None) => {
                let record = memory.push_with(|| self.commit(record));
                let id = committed_id(&record);
                let persisted = self.driver.write(&record);
                (id, persisted, self.subscribers.notify(record, &self.dispatcher))
            }
            _ => {
                let mut size = self.disk_size.lock();
                let record = self.commit(record);
                let id = committed_id(&record);
                self.driver.write(&record).map_err(|e| self.durability(id, e))?;
                if let Some(size) = size.as_mut() {
                    *size += 1;
                }
                drop(size);
                (id, Ok(()), self.subscribers.notify(record, &self.dispatcher))
            }
        };
        drop(order);

        if let Some(deliver) = deferred {
            deliver();
        }
        persisted.map_err(|e| self.durability(id, e))?;
        Ok(id)
    }

    fn commit(&self, mut record: Record<P>) -> Arc<Record<P>> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        record.commit(id);
        Arc::new(record)
    }

    fn durability(&self, sequence_id: u64, source: LedgerError) -> LedgerError {
        log::error!(
            "eventledger: '{}' record {sequence_id} was not persisted: {source}",
            self.kind
        );
        LedgerError::Durability {
            kind: self.kind.clone(),
            sequence_id,
            source: Box::new(source),
        }
    }

    /// Visit records with ids greater than `from`, oldest first.
    ///
    /// `None` starts at the beginning. Records rejected by `filter` are
    /// skipped; `callback` returning `false` stops the read.
    pub fn read(
        &self,
        from: Option<u64>,
        filter: Option<&dyn Fn(&Record<P>) -> bool>,
        mut callback: impl FnMut(&Record<P>) -> bool,
    ) -> Result<()> {
        self.ensure_ready()?;
        if let Some(memory) = &self.memory {
            memory.read(from, filter, &mut callback);
            return Ok(());
        }
        self.driver.read(from, &mut |record| {
            if filter.is_none_or(|accept| accept(&record)) {
                callback(&record)
            } else {
                true
            }
        })
    }

    /// Visit records with ids smaller than `from`, newest first.
    ///
    /// `None` starts at the newest record.
    pub fn read_reverse(
        &self,
        from: Option<u64>,
        filter: Option<&dyn Fn(&Record<P>) -> bool>,
        mut callback: impl FnMut(&Record<P>) -> bool,
    ) -> Result<()> {
        self.ensure_ready()?;
        if let Some(memory) = &self.memory {
            memory.read_reverse(from, filter, &mut callback);
            return Ok(());
        }
        self.driver.read_reverse(from, &mut |record| {
            if filter.is_none_or(|accept| accept(&record)) {
                callback(&record)
            } else {
                true
            }
        })
    }

    /// The newest record, if any.
    pub fn latest(&self) -> Result<Option<Arc<Record<P>>>> {
        Ok(self.latest_n(1)?.into_iter().next())
    }

    /// Up to `n` of the newest records, newest first.
    pub fn latest_n(&self, n: usize) -> Result<Vec<Arc<Record<P>>>> {
        self.ensure_ready()?;
        if let Some(memory) = &self.memory {
            return Ok(memory.latest_n(n));
        }
        let mut latest = Vec::with_capacity(n.min(1024));
        if n == 0 {
            return Ok(latest);
        }
        self.driver.read_reverse(None, &mut |record| {
            latest.push(Arc::new(record));
            latest.len() < n
        })?;
        Ok(latest)
    }

    /// Number of records held: in memory for memory-first strategies,
    /// on disk otherwise.
    pub fn size(&self) -> Result<u64> {
        if let Some(memory) = &self.memory {
            return Ok(memory.len() as u64);
        }
        let mut cached = self.disk_size.lock();
        if let Some(size) = *cached {
            return Ok(size);
        }
        let size = self.driver.count()?;
        *cached = Some(size);
        Ok(size)
    }

    /// Register `callback` for every committed record accepted by `filter`.
    ///
    /// Callbacks run on the notification dispatcher, never on the writer's
    /// thread while it is running.
    pub fn subscribe(
        &self,
        filter: Option<Filter<P>>,
        callback: impl Fn(&Record<P>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribers.add(filter, Arc::new(callback))
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }

    /// Run `f` with policy-driven flushes suspended, flushing once at the end.
    pub fn bulk_write<T>(&self, f: impl FnOnce(&Self) -> T) -> Result<T> {
        self.driver.set_bulk(true)?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(self)));
        let flushed = self.driver.set_bulk(false);
        match outcome {
            Ok(value) => flushed.map(|()| value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Apply retention and size eviction to the in-memory records.
    ///
    /// A no-op for [`Strategy::Disk`]. Never removes anything from disk.
    pub fn housekeeping(&self) -> HousekeepingReport {
        match &self.memory {
            Some(memory) => memory.housekeeping(self.kind.as_str()),
            None => HousekeepingReport::default(),
        }
    }

    /// A string-keyed snapshot of the ledger's counters and state.
    pub fn health_check(&self) -> BTreeMap<String, Value> {
        let mut health = BTreeMap::new();
        health.insert("kind".to_string(), json!(self.kind.as_str()));
        health.insert("strategy".to_string(), json!(self.strategy.as_str()));
        health.insert("state".to_string(), json!(self.state().as_str()));
        health.insert("started".to_string(), json!(self.started.to_rfc3339()));
        health.insert("sequence_counter".to_string(), json!(self.sequence()));
        health.insert("subscriber_count".to_string(), json!(self.subscribers.len()));
        if let Some(memory) = &self.memory {
            health.insert("memory_size".to_string(), json!(memory.len()));
            health.insert("preferred_max_size".to_string(), json!(memory.preferred_max_size()));
            health.insert("alarm_size".to_string(), json!(memory.alarm_size()));
            health.insert("alarms".to_string(), json!(memory.alarms()));
        }
        if let Some(queue) = &self.write_behind {
            health.insert("queue_depth".to_string(), json!(queue.queue_depth()));
            health.insert("dropped_writes".to_string(), json!(queue.dropped()));
            health.insert("write_failures".to_string(), json!(queue.failures()));
        }
        health
    }
}

impl<P> Ledger<P> {
    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn state(&self) -> LedgerState {
        LedgerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The last sequence id handed out.
    pub fn sequence(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: LedgerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            LedgerState::Ready => Ok(()),
            state => Err(LedgerError::NotReady {
                kind: self.kind.clone(),
                state,
            }),
        }
    }

    /// Make every accepted record durable.
    ///
    /// For write-behind ledgers this first waits for the queue to drain.
    pub fn flush(&self) -> Result<()> {
        if let Some(queue) = &self.write_behind {
            queue.wait_drained();
        }
        self.driver.flush()
    }

    /// Stop accepting writes, drain pending persistence and close the driver.
    ///
    /// Idempotent. Writes racing with close either complete before the drain
    /// or fail with [`LedgerError::NotReady`].
    pub fn close(&self) -> Result<()> {
        let closing = self.state.compare_exchange(
            LedgerState::Ready as u8,
            LedgerState::Closing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if closing.is_err() {
            return Ok(());
        }

        drop(self.inflight.write());

        if let Some(queue) = &self.write_behind {
            queue.shutdown();
        }
        let result = self.driver.flush().and_then(|()| self.driver.close());
        self.set_state(LedgerState::Closed);

        if self.owns_dispatcher {
            self.dispatcher.shutdown();
        }
        match &result {
            Ok(()) => log::info!(
                "eventledger: closed '{}' at sequence {}",
                self.kind,
                self.sequence()
            ),
            Err(e) => log::error!("eventledger: closing '{}' failed: {e}", self.kind),
        }
        result
    }
}

impl<P> Drop for Ledger<P> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("eventledger: close on drop failed for '{}': {e}", self.kind);
        }
    }
}

fn committed_id<P>(record: &Record<P>) -> u64 {
    record.sequence_id().unwrap_or_default()
}

mod sealed {
    pub trait Sealed {}
}

impl<P> sealed::Sealed for Ledger<P> {}

/// Type-erased ledger operations, used where ledgers of different payload
/// types are handled together.
///
/// This trait is sealed and cannot be implemented outside of this crate.
pub trait LedgerOps: sealed::Sealed + Send + Sync {
    fn kind(&self) -> &RecordKind;
    fn strategy(&self) -> Strategy;
    fn state(&self) -> LedgerState;
    fn sequence(&self) -> u64;
    fn size(&self) -> Result<u64>;
    fn flush(&self) -> Result<()>;
    fn housekeeping(&self) -> HousekeepingReport;
    fn health_check(&self) -> BTreeMap<String, Value>;
    fn close(&self) -> Result<()>;
    /// Downcast to `&dyn Any` for type recovery.
    fn as_any(&self) -> &dyn Any;
}

impl<P> LedgerOps for Ledger<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn kind(&self) -> &RecordKind {
        Ledger::kind(self)
    }

    fn strategy(&self) -> Strategy {
        Ledger::strategy(self)
    }

    fn state(&self) -> LedgerState {
        Ledger::state(self)
    }

    fn sequence(&self) -> u64 {
        Ledger::sequence(self)
    }

    fn size(&self) -> Result<u64> {
        Ledger::size(self)
    }

    fn flush(&self) -> Result<()> {
        Ledger::flush(self)
    }

    fn housekeeping(&self) -> HousekeepingReport {
        Ledger::housekeeping(self)
    }

    fn health_check(&self) -> BTreeMap<String, Value> {
        Ledger::health_check(self)
    }

    fn close(&self) -> Result<()> {
        Ledger::close(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    /// A driver whose writes always fail, for durability error paths.
    struct BrokenDriver;

    impl PersistenceDriver<Value> for BrokenDriver {
        fn write(&self, _record: &Record<Value>) -> Result<()> {
            Err(std::io::Error::other("disk full").into())
        }
        fn read(&self, _from: Option<u64>, _cb: &mut dyn FnMut(Record<Value>) -> bool) -> Result<()> {
            Ok(())
        }
        fn read_reverse(
            &self,
            _from: Option<u64>,
            _cb: &mut dyn FnMut(Record<Value>) -> bool,
        ) -> Result<()> {
            Ok(())
        }
        fn flush(&self) -> Result<()> {
            Ok(())
        }
        fn close(&self) -> Result<()> {
            Ok(())
        }
        fn count(&self) -> Result<u64> {
            Ok(0)
        }
        fn last_sequence_id(&self) -> Result<u64> {
            Ok(0)
        }
        fn set_bulk(&self, _bulk: bool) -> Result<()> {
            Ok(())
        }
    }

    fn broken(strategy: Strategy) -> (Ledger<Value>, Arc<Dispatcher>) {
        let dispatcher = Arc::new(Dispatcher::new(DispatchMode::Ordered).unwrap());
        let ledger = Ledger::open(
            "tick",
            Arc::new(BrokenDriver),
            LedgerOptions::new(strategy),
            &LedgerConfig::default(),
            Arc::clone(&dispatcher),
        )
        .unwrap();
        (ledger, dispatcher)
    }

    #[test]
    fn memory_write_failure_keeps_record_and_notifies() {
        let (ledger, dispatcher) = broken(Strategy::Memory);
        let notified = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&notified);
        ledger.subscribe(None, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        let err = ledger.write_now(json!({"px": 1})).unwrap_err();
        assert!(matches!(err, LedgerError::Durability { sequence_id: 1, .. }));
        assert_eq!(err.sequence_id(), Some(1));
        assert_eq!(ledger.size().unwrap(), 1);

        dispatcher.shutdown();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disk_write_failure_does_not_notify() {
        let (ledger, dispatcher) = broken(Strategy::Disk);
        let notified = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&notified);
        ledger.subscribe(None, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        let err = ledger.write_now(json!({"px": 1})).unwrap_err();
        assert_eq!(err.sequence_id(), Some(1));

        dispatcher.shutdown();
        assert_eq!(notified.load(Ordering::SeqCst), 0);
        // The id stays consumed.
        assert_eq!(ledger.sequence(), 1);
    }

    #[test]
    fn write_behind_failures_are_counted() {
        let (ledger, _dispatcher) = broken(Strategy::WriteBehind);
        ledger.write_now(json!(1)).unwrap();
        ledger.write_now(json!(2)).unwrap();
        ledger.flush().unwrap();
        assert_eq!(ledger.health_check()["write_failures"], json!(2));
    }

    #[test]
    fn writes_after_close_are_rejected() {
        let dir = tempdir().unwrap();
        let ledger: Ledger<Value> = Ledger::open_file(
            "tick",
            dir.path().join("tick.log"),
            LedgerOptions::new(Strategy::Disk),
            &LedgerConfig::default(),
        )
        .unwrap();
        assert_eq!(ledger.state(), LedgerState::Ready);
        ledger.close().unwrap();
        ledger.close().unwrap();
        assert_eq!(ledger.state(), LedgerState::Closed);

        let err = ledger.write_now(json!({})).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::NotReady {
                state: LedgerState::Closed,
                ..
            }
        ));
        assert!(ledger.read(None, None, |_| true).is_err());
        ledger.flush().unwrap();
    }

    #[test]
    fn append_checks_kind_and_commit_state() {
        let dir = tempdir().unwrap();
        let ledger: Ledger<Value> = Ledger::open_file(
            "tick",
            dir.path().join("tick.log"),
            LedgerOptions::new(Strategy::Memory),
            &LedgerConfig::default(),
        )
        .unwrap();

        let err = ledger
            .append(Record::new("trade", Utc::now(), json!({})))
            .unwrap_err();
        assert!(matches!(err, LedgerError::KindMismatch { .. }));

        let err = ledger
            .append(Record::committed("tick", Utc::now(), json!({}), 9))
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyCommitted { sequence_id: 9 }));

        assert_eq!(ledger.append(Record::new("tick", Utc::now(), json!({}))).unwrap(), 1);
    }

    #[test]
    fn health_check_reports_strategy_fields() {
        let dir = tempdir().unwrap();
        let ledger: Ledger<Value> = Ledger::open_file(
            "tick",
            dir.path().join("tick.log"),
            LedgerOptions::new(Strategy::WriteBehind),
            &LedgerConfig::default(),
        )
        .unwrap();
        ledger.write_now(json!(1)).unwrap();
        ledger.flush().unwrap();

        let health = ledger.health_check();
        assert_eq!(health["kind"], json!("tick"));
        assert_eq!(health["strategy"], json!("write_behind"));
        assert_eq!(health["state"], json!("ready"));
        assert_eq!(health["sequence_counter"], json!(1));
        assert_eq!(health["memory_size"], json!(1));
        assert_eq!(health["queue_depth"], json!(0));
        assert_eq!(health["dropped_writes"], json!(0));
    }

    #[test]
    fn disk_latest_n_reads_backward() {
        let dir = tempdir().unwrap();
        let ledger: Ledger<Value> = Ledger::open_file(
            "tick",
            dir.path().join("tick.log"),
            LedgerOptions::new(Strategy::Disk),
            &LedgerConfig::default(),
        )
        .unwrap();
        for i in 0..5 {
            ledger.write_now(json!(i)).unwrap();
        }
        let ids: Vec<u64> = ledger
            .latest_n(3)
            .unwrap()
            .iter()
            .filter_map(|r| r.sequence_id())
            .collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(ledger.latest().unwrap().and_then(|r| r.sequence_id()), Some(5));
        assert_eq!(ledger.size().unwrap(), 5);
    }
}
