//! Change-log collaborator seam.
//!
//! The on-disk change log is owned by the storage layer; the relay core only
//! consumes it through the [`BinlogManager`] / [`BinlogReader`] traits. The
//! engine is handed an implementation at construction, which also makes the
//! sending loops testable against in-memory fakes.
//!
//! # Resume Semantics
//!
//! A reader is opened at a `(file_number, byte_offset)` resume point and then
//! streams records in log order. The byte offset persisted after a send is not
//! guaranteed to sit on a record boundary, so a reader reset always reopens at
//! byte offset 0 of a rolled-back file index and relies on the receiver's
//! freshness check to absorb re-delivered records.
//!
//! # End Of Log
//!
//! [`ReadBatch::EndOfLog`] is the reader's cooperative exit signal, not an
//! error: when the log is told to stop serving (shutdown, truncation), blocked
//! readers unblock with it and the owning sender terminates cleanly.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

use crate::codec;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Write operation recorded in the change log.
///
/// Closed set: adding a variant must force every dispatch site to be
/// revisited, so no catch-all arms exist anywhere in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOp {
    /// Key set to a value.
    Set,
    /// Key deleted.
    Delete,
    /// Key given an absolute expiry (value carries the timestamp).
    ExpireAt,
}

/// One locally-applied write operation, as read back from the change log.
///
/// Immutable once produced by the reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogRecord {
    /// Node that originally applied this write (loop-prevention identity).
    pub origin_server_id: i32,
    /// Change-log file index the record was read from.
    pub file_number: u64,
    pub key: String,
    /// Payload: the value for `Set`, the expiry timestamp text for `ExpireAt`,
    /// empty for `Delete`.
    pub value: Vec<u8>,
    pub op: RecordOp,
    /// Timestamp of the original local apply; drives last-writer-wins.
    pub exec_time: i64,
}

impl ChangeLogRecord {
    /// Serialize this record as its outbound command, appended to `out`.
    pub fn encode_wire_command(&self, out: &mut Vec<u8>) {
        match self.op {
            RecordOp::Set => {
                codec::encode_command(&[b"SET", self.key.as_bytes(), &self.value], out)
            }
            RecordOp::Delete => codec::encode_command(&[b"DEL", self.key.as_bytes()], out),
            RecordOp::ExpireAt => {
                codec::encode_command(&[b"EXPIREAT", self.key.as_bytes(), &self.value], out)
            }
        }
    }
}

/// Result of one `read_batch()` call.
#[derive(Debug)]
pub enum ReadBatch {
    /// The next run of records, in log order. May be empty if the reader
    /// woke without new data.
    Records(Vec<ChangeLogRecord>),
    /// The reader was asked to exit (graceful, not an error).
    EndOfLog,
}

/// A positioned reader over the local change log.
///
/// Readers are exclusively owned by one sending loop; dropping one releases
/// its underlying resources.
pub trait BinlogReader: Send {
    /// Read the next batch of records, blocking (bounded by the log's own
    /// wakeup policy) until data is available or exit is signaled.
    fn read_batch(&mut self) -> BoxFuture<'_, ReadBatch>;

    /// Current resume position as a `(file_number, byte_offset)` pair,
    /// reflecting everything consumed so far.
    fn current_offset(&self) -> (u64, u64);
}

/// Factory for positioned readers over the local change log.
pub trait BinlogManager: Send + Sync + 'static {
    /// Open a reader at the given resume point.
    fn open_reader(
        &self,
        file_number: u64,
        byte_offset: u64,
    ) -> BoxFuture<'_, Box<dyn BinlogReader>>;
}
