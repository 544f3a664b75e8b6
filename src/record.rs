use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::fmt;

/// Names a record type. Selects the log file and the ledger a record belongs to.
///
/// Kinds are open-ended: any string is a valid kind, compared by value.
///
/// # Examples
///
/// ```
/// use eventledger::RecordKind;
///
/// let kind = RecordKind::new("price_update");
/// assert_eq!(kind, RecordKind::from("price_update"));
/// assert_eq!(kind.as_str(), "price_update");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKind(String);

impl RecordKind {
    pub fn new(value: impl Into<String>) -> Self {
        RecordKind(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKind {
    fn from(value: &str) -> Self {
        RecordKind::new(value)
    }
}

impl From<String> for RecordKind {
    fn from(value: String) -> Self {
        RecordKind(value)
    }
}

impl Borrow<str> for RecordKind {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A single entry in a ledger.
///
/// Records are serialized as single JSON lines:
///
/// ```text
/// {"kind":"price_update","timestamp":"2024-05-01T12:00:00Z","payload":{"px":101.5},"sequence_id":7}
/// ```
///
/// `kind` and `timestamp` are fixed at construction. `sequence_id` is `None`
/// until the ledger commits the record, after which it is a positive id unique
/// within that ledger. The payload is opaque to the ledger; the default payload
/// type is [`serde_json::Value`], which keeps integers and floats distinct
/// across a round trip.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use eventledger::Record;
/// use serde_json::json;
///
/// let record = Record::new("trade_placement", Utc::now(), json!({"qty": 3}));
/// assert_eq!(record.kind().as_str(), "trade_placement");
/// assert_eq!(record.sequence_id(), None);
/// assert_eq!(record.payload()["qty"], 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<P = Value> {
    kind: RecordKind,
    timestamp: DateTime<Utc>,
    payload: P,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence_id: Option<u64>,
}

impl<P> Record<P> {
    /// Create an uncommitted record.
    pub fn new(kind: impl Into<RecordKind>, timestamp: DateTime<Utc>, payload: P) -> Self {
        Record {
            kind: kind.into(),
            timestamp,
            payload,
            sequence_id: None,
        }
    }

    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    /// The id assigned at commit time, or `None` for an uncommitted record.
    pub fn sequence_id(&self) -> Option<u64> {
        self.sequence_id
    }

    pub fn is_committed(&self) -> bool {
        self.sequence_id.is_some()
    }

    /// Stamp the record with its ledger-assigned id. Called once, by the ledger.
    pub(crate) fn commit(&mut self, sequence_id: u64) {
        debug_assert!(self.sequence_id.is_none(), "record committed twice");
        debug_assert!(sequence_id > 0);
        self.sequence_id = Some(sequence_id);
    }

    /// Build an already-committed record, as read back from storage.
    #[cfg(test)]
    pub(crate) fn committed(
        kind: impl Into<RecordKind>,
        timestamp: DateTime<Utc>,
        payload: P,
        sequence_id: u64,
    ) -> Self {
        let mut record = Record::new(kind, timestamp, payload);
        record.commit(sequence_id);
        record
    }
}

/// Returns true when `id` lies strictly after the forward bound `from`.
pub(crate) fn after(from: Option<u64>, id: Option<u64>) -> bool {
    match (from, id) {
        (Some(from), Some(id)) => id > from,
        _ => true,
    }
}

/// Returns true when `id` lies strictly before the reverse bound `from`.
pub(crate) fn before(from: Option<u64>, id: Option<u64>) -> bool {
    match (from, id) {
        (Some(from), Some(id)) => id < from,
        _ => true,
    }
}
