// SPDX-License-Identifier: Apache-2.0

//! In-memory ring store. Not durable; oldest events are dropped once the
//! configured capacity is reached.

use crate::EventStorage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tbgw_core::StorageConfig;
use tracing::warn;

pub struct MemoryEventStorage {
    inner: Mutex<Inner>,
    max_records: usize,
    pack_size: usize,
}

struct Inner {
    queue: VecDeque<String>,
    /// Number of queue entries handed out as the current pack.
    pack_len: usize,
}

impl MemoryEventStorage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            inner: Mutex::new(Inner { queue: VecDeque::new(), pack_len: 0 }),
            max_records: config.max_records_count.max(1),
            pack_size: config.read_records_count.max(1),
        }
    }
}

impl EventStorage for MemoryEventStorage {
    fn put(&self, event: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.queue.len() >= self.max_records {
            // Ring semantics: the oldest unsent event gives way.
            inner.queue.pop_front();
            if inner.pack_len > 0 {
                inner.pack_len -= 1;
            }
            warn!("memory event storage is full, dropping the oldest event");
        }
        inner.queue.push_back(event.to_string());
        true
    }

    fn get_event_pack(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        if inner.pack_len == 0 {
            inner.pack_len = inner.queue.len().min(self.pack_size);
        }
        inner.queue.iter().take(inner.pack_len).cloned().collect()
    }

    fn event_pack_processing_done(&self) {
        let mut inner = self.inner.lock();
        for _ in 0..inner.pack_len {
            inner.queue.pop_front();
        }
        inner.pack_len = 0;
    }

    fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    fn stop(&self) {}
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
