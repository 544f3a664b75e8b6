//! Append-only, per-kind event ledgers.
//!
//! Each [`Ledger`] owns one record kind. It assigns every record the next
//! sequence id, persists it as one JSON line through a
//! [`PersistenceDriver`], optionally mirrors it in memory, and notifies
//! subscribers. A [`LedgerRegistry`] groups ledgers in one directory, and a
//! [`StreamReader`] replays a ledger and follows it live.

mod config;
mod dispatch;
mod driver;
mod error;
pub mod housekeeping;
mod ledger;
mod memory;
mod record;
mod registry;
mod reverse;
mod stream;
mod subscription;
mod write_behind;

pub use config::{FlushPolicy, LedgerConfig, LockMode, MemoryConfig};
pub use dispatch::{DispatchMode, Dispatcher};
pub use driver::{DiskDriver, PersistenceDriver};
pub use error::{LedgerError, Result};
pub use housekeeping::{Housekeeper, HousekeepingConfig};
pub use ledger::{Ledger, LedgerOps, LedgerOptions, LedgerState, Strategy};
pub use memory::{HousekeepingReport, retain_newer_than};
pub use record::{Record, RecordKind};
pub use registry::{LedgerRegistry, LedgerRegistryBuilder};
pub use stream::{CancelToken, StreamReader};
pub use subscription::{Filter, SubscriptionId};
