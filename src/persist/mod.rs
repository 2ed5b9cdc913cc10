//! Persistence of restoration records to the sys catalog log.

/// Key/value codec for restoration records.
pub mod codec;
/// SQLite-backed log.
pub mod sqlite;

use thiserror::Error;

use crate::types::SysRowEntryType;

use self::codec::{CodecError, KeyValuePair};

/// Log sequence number assigned by a sink.
pub type LogSeq = u64;

/// Log failures.
#[derive(Debug, Error)]
pub enum PersistError {
    /// SQLite rejected the statement.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored row did not decode.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    /// Any other sink failure.
    #[error("{0}")]
    Message(String),
}

/// Result of a sink call.
pub type PersistResult<T> = Result<T, PersistError>;

/// Narrow write/read interface to the replicated sys catalog log.
pub trait RecordSink: Send {
    /// Appends `pairs` atomically. Returns the sequence of the last pair, or
    /// the current latest sequence when `pairs` is empty.
    fn append_pairs(&mut self, pairs: &[KeyValuePair]) -> PersistResult<LogSeq>;

    /// Every stored pair of `entry_type`, oldest first.
    fn load_pairs(&self, entry_type: SysRowEntryType) -> PersistResult<Vec<KeyValuePair>>;

    /// Makes appended pairs durable.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }

    /// Drops superseded writes. Returns the number removed.
    fn compact(&mut self) -> PersistResult<usize> {
        Ok(0)
    }
}
