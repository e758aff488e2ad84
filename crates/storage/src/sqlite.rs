// SPDX-License-Identifier: Apache-2.0

//! Embedded-relational store backed by sqlite. Rowid order gives FIFO;
//! acknowledged packs are deleted in one range statement.

use crate::{EventStorage, StorageError};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::PathBuf;
use tbgw_core::StorageConfig;
use tracing::{debug, error};

pub struct SqliteEventStorage {
    inner: Mutex<Inner>,
    pack_size: usize,
}

struct Inner {
    conn: Connection,
    pack: Vec<String>,
    /// Rowid of the last event in the outstanding pack.
    pack_last_id: i64,
}

impl SqliteEventStorage {
    pub fn open(path: PathBuf, config: &StorageConfig) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        // put must not acknowledge until the bytes are on stable storage.
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (id INTEGER PRIMARY KEY AUTOINCREMENT, data TEXT NOT NULL)",
            [],
        )?;
        debug!(path = %path.display(), "opened sqlite event storage");
        Ok(Self {
            inner: Mutex::new(Inner { conn, pack: Vec::new(), pack_last_id: 0 }),
            pack_size: config.read_records_count.max(1),
        })
    }
}

impl EventStorage for SqliteEventStorage {
    fn put(&self, event: &str) -> bool {
        let inner = self.inner.lock();
        match inner.conn.execute("INSERT INTO events (data) VALUES (?1)", [event]) {
            Ok(_) => true,
            Err(e) => {
                error!("failed to persist event: {e}");
                false
            }
        }
    }

    fn get_event_pack(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        if !inner.pack.is_empty() {
            return inner.pack.clone();
        }
        let mut pack = Vec::new();
        let mut last_id = inner.pack_last_id;
        let result = inner
            .conn
            .prepare("SELECT id, data FROM events ORDER BY id LIMIT ?1")
            .and_then(|mut stmt| {
                let rows = stmt.query_map([self.pack_size as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?;
                for row in rows {
                    let (id, data) = row?;
                    last_id = id;
                    pack.push(data);
                }
                Ok(())
            });
        if let Err(e) = result {
            error!("failed to read event pack: {e}");
            return Vec::new();
        }
        inner.pack = pack.clone();
        inner.pack_last_id = last_id;
        pack
    }

    fn event_pack_processing_done(&self) {
        let mut inner = self.inner.lock();
        if inner.pack.is_empty() {
            return;
        }
        let last_id = inner.pack_last_id;
        if let Err(e) = inner.conn.execute("DELETE FROM events WHERE id <= ?1", [last_id]) {
            error!("failed to acknowledge event pack: {e}");
            return;
        }
        inner.pack.clear();
    }

    fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }

    fn stop(&self) {
        let inner = self.inner.lock();
        let _ = inner.conn.pragma_update(None, "wal_checkpoint", "TRUNCATE");
    }
}

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;
