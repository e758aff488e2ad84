// SPDX-License-Identifier: Apache-2.0

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tbgw-storage: durable store-and-forward queues for outgoing events.
//!
//! Every store is FIFO and pack-oriented: [`EventStorage::get_event_pack`]
//! returns the same batch until [`EventStorage::event_pack_processing_done`]
//! acknowledges it, which is what gives the dispatcher its at-least-once
//! replay behavior. The durable stores do not acknowledge `put` until the
//! bytes reached stable storage.

mod file;
mod memory;
mod sqlite;

pub use file::FileEventStorage;
pub use memory::MemoryEventStorage;
pub use sqlite::SqliteEventStorage;

use std::sync::Arc;
use tbgw_core::{StorageConfig, StorageType};
use thiserror::Error;

/// Uniform facade over the pluggable event stores.
pub trait EventStorage: Send + Sync + 'static {
    /// Append one serialized event. Returns `false` when the write failed;
    /// the caller retries.
    fn put(&self, event: &str) -> bool;

    /// Current unacknowledged batch, oldest first. Returns the same pack
    /// until it is acknowledged.
    fn get_event_pack(&self) -> Vec<String>;

    /// Acknowledge the current pack; its events will not be returned again.
    fn event_pack_processing_done(&self);

    /// Events waiting to be delivered (including the current pack).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush and release resources.
    fn stop(&self);
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage misconfigured: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Build the store selected by `storage.type`.
pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn EventStorage>, StorageError> {
    match config.kind {
        StorageType::Memory => Ok(Arc::new(MemoryEventStorage::new(config))),
        StorageType::File => {
            let folder = config.data_folder_path.clone().ok_or_else(|| {
                StorageError::Config("file storage requires data_folder_path".to_string())
            })?;
            Ok(Arc::new(FileEventStorage::open(folder, config)?))
        }
        StorageType::Sqlite => {
            let path = config.data_file_path.clone().ok_or_else(|| {
                StorageError::Config("sqlite storage requires data_file_path".to_string())
            })?;
            Ok(Arc::new(SqliteEventStorage::open(path, config)?))
        }
    }
}
