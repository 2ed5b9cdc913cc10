//! SQLite-backed append-only sys catalog log.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};

use crate::types::SysRowEntryType;

use super::{
    LogSeq, PersistResult, RecordSink,
    codec::{self, KeyValuePair},
};

/// SQLite implementation of [`crate::persist::RecordSink`].
pub struct SqliteRecordSink {
    conn: Connection,
}

impl SqliteRecordSink {
    /// Opens or creates a SQLite-backed log at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite log.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Returns the latest sequence in the log.
    pub fn latest_seq(&self) -> PersistResult<LogSeq> {
        let seq: Option<i64> = self
            .conn
            .query_row("SELECT MAX(seq) FROM sys_catalog", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(seq.unwrap_or(0) as LogSeq)
    }

    /// Number of rows currently stored, superseded ones included.
    pub fn row_count(&self) -> PersistResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sys_catalog", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Deletes every row that is not the newest write for its key.
    pub fn compact(&mut self) -> PersistResult<usize> {
        let count = self.conn.execute(
            "DELETE FROM sys_catalog WHERE seq NOT IN \
             (SELECT MAX(seq) FROM sys_catalog GROUP BY entry_key)",
            [],
        )?;
        Ok(count)
    }
}

impl RecordSink for SqliteRecordSink {
    fn append_pairs(&mut self, pairs: &[KeyValuePair]) -> PersistResult<LogSeq> {
        if pairs.is_empty() {
            return self.latest_seq();
        }

        let ts_ms = now_ms();
        let tx = self.conn.transaction()?;
        let mut last = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO sys_catalog(ts_ms, entry_type, entry_key, entry_value) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for pair in pairs {
                let (entry_type, _) = codec::decode_key(&pair.key)?;
                stmt.execute(params![
                    ts_ms as i64,
                    entry_type.as_byte(),
                    pair.key,
                    pair.value,
                ])?;
                last = tx.last_insert_rowid();
            }
        }
        tx.commit()?;

        Ok(last as LogSeq)
    }

    fn load_pairs(&self, entry_type: SysRowEntryType) -> PersistResult<Vec<KeyValuePair>> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_key, entry_value FROM sys_catalog WHERE entry_type = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![entry_type.as_byte()], |row| {
            Ok(KeyValuePair {
                key: row.get(0)?,
                value: row.get(1)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    fn compact(&mut self) -> PersistResult<usize> {
        SqliteRecordSink::compact(self)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
