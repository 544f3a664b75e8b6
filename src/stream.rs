//! Replaying and following a ledger as one stream.

use crate::error::{LedgerError, Result};
use crate::ledger::{Ledger, LedgerState, Strategy};
use crate::record::Record;
use crate::registry::LedgerRegistry;
use crate::subscription::SubscriptionId;
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How often a following tail wakes up to check for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cooperative cancellation for [`StreamReader::tail`].
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reads ledgers of a registry by kind, optionally following new records.
#[derive(Debug, Clone)]
pub struct StreamReader {
    registry: Arc<LedgerRegistry>,
}

impl StreamReader {
    pub fn new(registry: Arc<LedgerRegistry>) -> Self {
        StreamReader { registry }
    }

    /// Deliver every record of `kind` to `callback`, oldest first.
    ///
    /// With `follow`, keeps delivering newly written records after the
    /// history until `callback` returns `false`, `cancel` fires or the
    /// ledger closes. Records written while the history is replayed are
    /// delivered exactly once.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventledger::{CancelToken, LedgerOptions, LedgerRegistry, StreamReader, Strategy};
    /// use serde_json::{Value, json};
    /// use std::sync::Arc;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let registry = Arc::new(
    ///     LedgerRegistry::builder(dir.path())
    ///         .ledger::<Value>("system", LedgerOptions::new(Strategy::Disk))
    ///         .open()
    ///         .unwrap(),
    /// );
    /// let system = registry.ledger::<Value>("system").unwrap();
    /// system.write_now(json!("started")).unwrap();
    ///
    /// let reader = StreamReader::new(Arc::clone(&registry));
    /// let mut seen = Vec::new();
    /// reader
    ///     .tail::<Value>("system", false, &CancelToken::new(), |record| {
    ///         seen.push(record.payload().clone());
    ///         true
    ///     })
    ///     .unwrap();
    /// assert_eq!(seen, vec![json!("started")]);
    /// ```
    pub fn tail<P>(
        &self,
        kind: &str,
        follow: bool,
        cancel: &CancelToken,
        mut callback: impl FnMut(&Record<P>) -> bool,
    ) -> Result<()>
    where
        P: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let ledger = self.typed::<P>(kind)?;
        if !follow {
            return ledger.read(None, None, |record| !cancel.is_cancelled() && callback(record));
        }

        // Subscribe before replaying so nothing written in between is missed.
        let (live_tx, live_rx) = unbounded::<Record<P>>();
        let subscription = ledger.subscribe(None, move |record| {
            let _ = live_tx.send(record.clone());
        });
        let outcome = follow_live(&ledger, &live_rx, cancel, &mut callback);
        ledger.unsubscribe(subscription);
        outcome
    }

    /// Register a live-only callback on the ledger for `kind`.
    pub fn subscribe<P>(
        &self,
        kind: &str,
        callback: impl Fn(&Record<P>) + Send + Sync + 'static,
    ) -> Result<SubscriptionId>
    where
        P: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Ok(self.typed::<P>(kind)?.subscribe(None, callback))
    }

    pub fn unsubscribe<P>(&self, kind: &str, id: SubscriptionId) -> Result<bool>
    where
        P: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Ok(self.typed::<P>(kind)?.unsubscribe(id))
    }

    fn typed<P>(&self, kind: &str) -> Result<Arc<Ledger<P>>>
    where
        P: Send + Sync + 'static,
    {
        self.registry
            .ledger::<P>(kind)
            .ok_or_else(|| LedgerError::UnknownKind(kind.into()))
    }
}

fn follow_live<P>(
    ledger: &Ledger<P>,
    live: &Receiver<Record<P>>,
    cancel: &CancelToken,
    callback: &mut dyn FnMut(&Record<P>) -> bool,
) -> Result<()>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    // Records notified before the subscription must be readable from the log.
    if ledger.strategy() == Strategy::Disk {
        ledger.flush()?;
    }

    let mut last_replayed = 0;
    let mut keep_going = true;
    ledger.read(None, None, |record| {
        last_replayed = last_replayed.max(record.sequence_id().unwrap_or(0));
        keep_going = !cancel.is_cancelled() && callback(record);
        keep_going
    })?;

    while keep_going && !cancel.is_cancelled() {
        match live.recv_timeout(POLL_INTERVAL) {
            Ok(record) => {
                if record.sequence_id().is_some_and(|id| id <= last_replayed) {
                    continue;
                }
                keep_going = callback(&record);
            }
            Err(RecvTimeoutError::Timeout) => {
                if ledger.state() != LedgerState::Ready {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}
