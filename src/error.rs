use crate::ledger::LedgerState;
use crate::record::RecordKind;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the ledger and its persistence driver.
///
/// Corrupt lines and a full write-behind queue are deliberately absent: the
/// first are skipped during reads, the second is counted and logged.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("another writer holds the lock on {}", path.display())]
    Locked { path: PathBuf },

    #[error("persistence driver for {} is closed", path.display())]
    Closed { path: PathBuf },

    #[error("ledger '{kind}' is not ready (state: {state:?})")]
    NotReady { kind: RecordKind, state: LedgerState },

    /// The record was assigned `sequence_id` but did not reach durable storage.
    ///
    /// For memory-first ledgers the record is still committed in memory and
    /// was delivered to subscribers.
    #[error("ledger '{kind}': record {sequence_id} was not persisted: {source}")]
    Durability {
        kind: RecordKind,
        sequence_id: u64,
        #[source]
        source: Box<LedgerError>,
    },

    #[error("record of kind '{found}' cannot be written to ledger '{expected}'")]
    KindMismatch { expected: RecordKind, found: RecordKind },

    #[error("record already carries sequence id {sequence_id}")]
    AlreadyCommitted { sequence_id: u64 },

    #[error("no ledger registered for kind '{0}' with the requested payload type")]
    UnknownKind(RecordKind),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LedgerError {
    /// Returns the sequence id consumed by a write that failed to persist.
    pub fn sequence_id(&self) -> Option<u64> {
        match self {
            LedgerError::Durability { sequence_id, .. } => Some(*sequence_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
