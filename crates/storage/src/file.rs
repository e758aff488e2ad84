// SPDX-License-Identifier: Apache-2.0

//! File-segment store. Events append to numbered segment files, one
//! compact-JSON record per line; the reader position persists in a state
//! file so unacknowledged events replay after a restart.
//!
//! `put` reports success only after the record is flushed and synced, and
//! fully consumed segments are deleted when their pack is acknowledged.

use crate::{EventStorage, StorageError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tbgw_core::StorageConfig;
use tracing::{debug, error, warn};

const STATE_FILE: &str = "state.json";

pub struct FileEventStorage {
    dir: PathBuf,
    pack_size: usize,
    max_records_per_file: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    writer: Option<File>,
    write_seq: u64,
    /// Records in the current write segment.
    write_count: usize,
    read_seq: u64,
    /// Lines of the read segment already acknowledged.
    read_offset: usize,
    /// Events not yet acknowledged.
    pending: usize,
    pack: Vec<String>,
    /// Reader position once the outstanding pack is acknowledged.
    pack_end: (u64, usize),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReaderState {
    read_seq: u64,
    read_offset: usize,
}

impl FileEventStorage {
    pub fn open(dir: PathBuf, config: &StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&dir)?;
        let state = load_state(&dir);
        let mut segments = list_segments(&dir)?;
        segments.retain(|&seq| {
            if seq < state.read_seq {
                // Fully consumed before the last shutdown.
                let _ = fs::remove_file(segment_path(&dir, seq));
                false
            } else {
                true
            }
        });

        let write_seq = segments.iter().max().copied().unwrap_or(state.read_seq);
        let mut pending = 0usize;
        for &seq in &segments {
            let lines = count_lines(&segment_path(&dir, seq))?;
            pending += if seq == state.read_seq { lines.saturating_sub(state.read_offset) } else { lines };
        }
        let write_count = count_lines(&segment_path(&dir, write_seq)).unwrap_or(0);

        debug!(dir = %dir.display(), pending, "opened file event storage");
        Ok(Self {
            dir,
            pack_size: config.read_records_count.max(1),
            max_records_per_file: config.max_records_per_file.max(1),
            inner: Mutex::new(Inner {
                writer: None,
                write_seq,
                write_count,
                read_seq: state.read_seq,
                read_offset: state.read_offset,
                pending,
                pack: Vec::new(),
                pack_end: (state.read_seq, state.read_offset),
            }),
        })
    }

    fn append(&self, inner: &mut Inner, event: &str) -> Result<(), std::io::Error> {
        if inner.write_count >= self.max_records_per_file {
            inner.write_seq += 1;
            inner.write_count = 0;
            inner.writer = None;
        }
        if inner.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(segment_path(&self.dir, inner.write_seq))?;
            inner.writer = Some(file);
        }
        if let Some(mut file) = inner.writer.take() {
            file.write_all(event.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_data()?;
            inner.writer = Some(file);
        }
        inner.write_count += 1;
        inner.pending += 1;
        Ok(())
    }

    fn read_pack(&self, inner: &mut Inner) {
        let mut seq = inner.read_seq;
        let mut offset = inner.read_offset;
        while inner.pack.len() < self.pack_size && seq <= inner.write_seq {
            let path = segment_path(&self.dir, seq);
            let Ok(file) = File::open(&path) else {
                seq += 1;
                offset = 0;
                continue;
            };
            for line in BufReader::new(file).lines().skip(offset) {
                match line {
                    Ok(line) if !line.is_empty() => {
                        inner.pack.push(line);
                        offset += 1;
                    }
                    Ok(_) => offset += 1,
                    Err(e) => {
                        error!("failed to read event segment {}: {e}", path.display());
                        break;
                    }
                }
                if inner.pack.len() >= self.pack_size {
                    break;
                }
            }
            if inner.pack.len() >= self.pack_size {
                break;
            }
            if seq == inner.write_seq {
                break;
            }
            seq += 1;
            offset = 0;
        }
        inner.pack_end = (seq, offset);
    }
}

impl EventStorage for FileEventStorage {
    fn put(&self, event: &str) -> bool {
        let mut inner = self.inner.lock();
        match self.append(&mut inner, event) {
            Ok(()) => true,
            Err(e) => {
                error!("failed to persist event: {e}");
                false
            }
        }
    }

    fn get_event_pack(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        if inner.pack.is_empty() {
            self.read_pack(&mut inner);
        }
        inner.pack.clone()
    }

    fn event_pack_processing_done(&self) {
        let mut inner = self.inner.lock();
        if inner.pack.is_empty() {
            return;
        }
        inner.pending = inner.pending.saturating_sub(inner.pack.len());
        inner.pack.clear();
        let (seq, offset) = inner.pack_end;
        for consumed in inner.read_seq..seq {
            if let Err(e) = fs::remove_file(segment_path(&self.dir, consumed)) {
                warn!("failed to remove consumed segment {consumed}: {e}");
            }
        }
        inner.read_seq = seq;
        inner.read_offset = offset;
        if let Err(e) = save_state(&self.dir, seq, offset) {
            error!("failed to persist reader state: {e}");
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().pending
    }

    fn stop(&self) {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.writer.take() {
            let _ = file.sync_all();
        }
    }
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("data_{seq}.jsonl"))
}

fn list_segments(dir: &Path) -> Result<Vec<u64>, StorageError> {
    let mut seqs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(seq) = name.strip_prefix("data_").and_then(|n| n.strip_suffix(".jsonl")) {
            if let Ok(seq) = seq.parse() {
                seqs.push(seq);
            }
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

fn count_lines(path: &Path) -> Result<usize, std::io::Error> {
    match File::open(path) {
        Ok(file) => Ok(BufReader::new(file).lines().count()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

fn load_state(dir: &Path) -> ReaderState {
    let path = dir.join(STATE_FILE);
    match fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => ReaderState::default(),
    }
}

fn save_state(dir: &Path, read_seq: u64, read_offset: usize) -> Result<(), std::io::Error> {
    let state = ReaderState { read_seq, read_offset };
    let tmp = dir.join(format!("{STATE_FILE}.tmp"));
    let raw = serde_json::to_string(&state).unwrap_or_default();
    fs::write(&tmp, raw)?;
    fs::rename(&tmp, dir.join(STATE_FILE))
}

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;
