//! Asynchronous persistence for memory-first ledgers.

use crate::driver::PersistenceDriver;
use crate::memory::{ALARM_INTERVAL, Throttle};
use crate::record::Record;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Counts records accepted by the queue but not yet handed to the driver.
struct Pending {
    count: Mutex<u64>,
    drained: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn get(&self) -> u64 {
        *self.count.lock()
    }

    fn wait_drained(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.drained.wait_for(&mut count, Duration::from_millis(50));
        }
    }
}

/// A bounded queue plus the single worker that drains it into the driver.
pub(crate) struct WriteBehind<P> {
    kind: String,
    driver: Arc<dyn PersistenceDriver<P>>,
    sender: Sender<Arc<Record<P>>>,
    receiver: Receiver<Arc<Record<P>>>,
    stop: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<Pending>,
    dropped: AtomicU64,
    failures: Arc<AtomicU64>,
    drop_warning: Throttle,
}

impl<P> WriteBehind<P>
where
    P: Send + Sync + 'static,
{
    pub(crate) fn start(
        kind: &str,
        driver: Arc<dyn PersistenceDriver<P>>,
        capacity: usize,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = bounded::<Arc<Record<P>>>(capacity);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            drained: Condvar::new(),
        });
        let failures = Arc::new(AtomicU64::new(0));

        let worker = {
            let receiver = receiver.clone();
            let driver = Arc::clone(&driver);
            let pending = Arc::clone(&pending);
            let failures = Arc::clone(&failures);
            let kind = kind.to_string();
            thread::Builder::new()
                .name(format!("eventledger-writer-{kind}"))
                .spawn(move || {
                    loop {
                        select! {
                            recv(receiver) -> msg => match msg {
                                Ok(record) => {
                                    persist(&kind, driver.as_ref(), &*record, &failures);
                                    pending.done();
                                }
                                Err(_) => break,
                            },
                            recv(stop_rx) -> _ => break,
                        }
                    }
                })?
        };

        Ok(WriteBehind {
            kind: kind.to_string(),
            driver,
            sender,
            receiver,
            stop: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(worker)),
            pending,
            dropped: AtomicU64::new(0),
            failures,
            drop_warning: Throttle::new(ALARM_INTERVAL),
        })
    }
}

impl<P> WriteBehind<P> {
    /// Queue `record` for persistence without blocking.
    ///
    /// Returns false when the queue is full; the record then never reaches disk.
    pub(crate) fn enqueue(&self, record: &Arc<Record<P>>) -> bool {
        self.pending.add();
        match self.sender.try_send(Arc::clone(record)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.pending.done();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if self.drop_warning.ready() {
                    log::warn!(
                        "eventledger: write queue for '{}' is full, record {:?} kept in memory only ({dropped} dropped so far)",
                        self.kind,
                        record.sequence_id()
                    );
                }
                false
            }
        }
    }

    /// Block until every queued record has been handed to the driver.
    pub(crate) fn wait_drained(&self) {
        if self.worker.lock().is_some() {
            self.pending.wait_drained();
        }
    }

    /// Stop the worker and write whatever is still queued on this thread.
    pub(crate) fn shutdown(&self) {
        drop(self.stop.lock().take());
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                log::error!("eventledger: writer thread for '{}' panicked", self.kind);
            }
        }
        let mut drained = 0u64;
        while let Ok(record) = self.receiver.try_recv() {
            persist(&self.kind, self.driver.as_ref(), &*record, &self.failures);
            self.pending.done();
            drained += 1;
        }
        if drained > 0 {
            log::debug!("eventledger: drained {drained} queued records for '{}' at shutdown", self.kind);
        }
    }

    pub(crate) fn queue_depth(&self) -> u64 {
        self.pending.get()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

fn persist<P>(
    kind: &str,
    driver: &dyn PersistenceDriver<P>,
    record: &Record<P>,
    failures: &AtomicU64,
) {
    if let Err(e) = driver.write(record) {
        failures.fetch_add(1, Ordering::Relaxed);
        log::error!(
            "eventledger: background write of '{kind}' record {:?} failed: {e}",
            record.sequence_id()
        );
    }
}
