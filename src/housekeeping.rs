//! Periodic flushing and memory housekeeping across a registry.

use crate::memory::HousekeepingReport;
use crate::record::RecordKind;
use crate::registry::LedgerRegistry;
use crossbeam_channel::{Sender, bounded, select, tick};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Flush every ledger in `registry`, returning how many flushed cleanly.
///
/// Failures are logged and do not stop the remaining ledgers.
pub fn flush_all(registry: &LedgerRegistry) -> usize {
    let mut flushed = 0;
    for ledger in registry.all_ledgers() {
        match ledger.flush() {
            Ok(()) => flushed += 1,
            Err(e) => log::error!("eventledger: housekeeping flush of '{}' failed: {e}", ledger.kind()),
        }
    }
    flushed
}

/// Run one housekeeping pass over every ledger.
pub fn run_once(registry: &LedgerRegistry) -> Vec<(RecordKind, HousekeepingReport)> {
    registry
        .all_ledgers()
        .map(|ledger| {
            let report = ledger.housekeeping();
            if report.expired + report.evicted > 0 {
                log::debug!(
                    "eventledger: housekeeping '{}' expired {} evicted {} kept {}",
                    ledger.kind(),
                    report.expired,
                    report.evicted,
                    report.remaining
                );
            }
            (ledger.kind().clone(), report)
        })
        .collect()
}

/// Intervals for a [`Housekeeper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HousekeepingConfig {
    pub flush_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        HousekeepingConfig {
            flush_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30 * 60),
        }
    }
}

/// Background thread that flushes and housekeeps a registry on a schedule.
///
/// Stops on [`stop`](Housekeeper::stop) or drop.
pub struct Housekeeper {
    stop: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Housekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Housekeeper")
            .field("running", &self.worker.lock().is_some())
            .finish()
    }
}

impl Housekeeper {
    pub fn start(registry: Arc<LedgerRegistry>, config: HousekeepingConfig) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let worker = thread::Builder::new()
            .name("eventledger-housekeeping".to_string())
            .spawn(move || {
                let flush = tick(config.flush_interval);
                let cleanup = tick(config.cleanup_interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(flush) -> _ => {
                            flush_all(&registry);
                        }
                        recv(cleanup) -> _ => {
                            run_once(&registry);
                        }
                    }
                }
                log::debug!("eventledger: housekeeping stopped");
            })?;
        Ok(Housekeeper {
            stop: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Signal the thread and wait for its current pass to finish.
    pub fn stop(&self) {
        drop(self.stop.lock().take());
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                log::error!("eventledger: housekeeping thread panicked");
            }
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.stop();
    }
}
