use crate::dispatch::{Dispatcher, Task};
use crate::record::Record;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A predicate over committed records, shared between threads.
pub type Filter<P> = Arc<dyn Fn(&Record<P>) -> bool + Send + Sync>;

type Callback<P> = Arc<dyn Fn(&Record<P>) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription<P> {
    id: SubscriptionId,
    filter: Option<Filter<P>>,
    callback: Callback<P>,
}

pub(crate) struct Subscribers<P> {
    next_id: AtomicU64,
    entries: Mutex<Vec<Arc<Subscription<P>>>>,
}

impl<P> Subscribers<P>
where
    P: Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Subscribers {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, filter: Option<Filter<P>>, callback: Callback<P>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push(Arc::new(Subscription {
            id,
            filter,
            callback,
        }));
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|sub| sub.id != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Hand `record` to every current subscriber in a single dispatcher task.
    ///
    /// Never runs callbacks itself: once the dispatcher has shut down the
    /// delivery is returned for the caller to run after releasing its locks.
    #[must_use]
    pub(crate) fn notify(&self, record: Arc<Record<P>>, dispatcher: &Dispatcher) -> Option<Task> {
        let snapshot: Vec<Arc<Subscription<P>>> = self.entries.lock().clone();
        if snapshot.is_empty() {
            return None;
        }
        dispatcher.try_submit(Box::new(move || deliver(&snapshot, &record)))
    }
}

fn deliver<P>(subscribers: &[Arc<Subscription<P>>], record: &Record<P>) {
    for sub in subscribers {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if sub.filter.as_ref().is_none_or(|accept| accept(record)) {
                (sub.callback)(record);
            }
        }));
        if outcome.is_err() {
            log::error!(
                "eventledger: subscriber {:?} panicked on '{}' record {:?}",
                sub.id,
                record.kind(),
                record.sequence_id()
            );
        }
    }
}
