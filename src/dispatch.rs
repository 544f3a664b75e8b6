//! The notification executor shared by every ledger in a registry.

use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// How subscriber notifications are scheduled.
///
/// `Ordered` runs every task on one worker in submission order, so each
/// subscriber sees records in write order. `Pooled` spreads tasks over
/// several workers: every record is still delivered, but records written
/// close together may reach a subscriber out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    Ordered,
    Pooled { workers: usize },
}

/// A small FIFO task executor.
///
/// After [`shutdown`](Dispatcher::shutdown), submitted tasks run inline on
/// the caller's thread.
pub struct Dispatcher {
    mode: DispatchMode,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mode", &self.mode)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(mode: DispatchMode) -> std::io::Result<Self> {
        let count = match mode {
            DispatchMode::Ordered => 1,
            DispatchMode::Pooled { workers } => workers.max(1),
        };
        let (tx, rx) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(count);
        for n in 0..count {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("eventledger-notify-{n}"))
                .spawn(move || {
                    for task in rx.iter() {
                        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                            log::error!("eventledger: notification task panicked");
                        }
                    }
                })?;
            workers.push(handle);
        }
        Ok(Dispatcher {
            mode,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(task) = self.try_submit(Box::new(task)) {
            task();
        }
    }

    /// Queue `task`, handing it back if the dispatcher has shut down.
    pub(crate) fn try_submit(&self, task: Task) -> Option<Task> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => tx.send(task).err().map(|e| e.into_inner()),
            None => Some(task),
        }
    }

    /// Stop accepting tasks, let queued tasks finish, and join the workers.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            // A subscriber that shuts the registry down from a callback must not join itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("eventledger: notification worker panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
