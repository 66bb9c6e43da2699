// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Message reader (tailer) for consuming from the queue.
//!
//! The [`Tailer`] provides sequential and random-access reading of messages
//! from the queue. It supports:
//! - Sequential iteration via [`read_next`](Tailer::read_next) or the
//!   `Iterator` trait
//! - Seeking to a global index via [`move_to_index`](Tailer::move_to_index)
//! - Resuming a replay from a per-source checkpoint via
//!   [`after_last_written`](Tailer::after_last_written)
//! - Rolling to the next cycle when the current one is exhausted
//! - CRC verification on every read
//!
//! A read that finds nothing returns `Ok(None)` immediately; polling is the
//! caller's business.

use std::{path::Path, sync::Arc};

use snafu::ensure;
use tracing::debug;

use crate::{
    Queue, Result,
    codec::Lookup,
    directory::StoreDirectory,
    error::CrossSourceMisattributionSnafu,
    index::SparseIndex,
    message::{EntryHeader, Message},
    store::{CycleStore, EntryRef, RETRY_BUDGET, backoff},
};

/// Where a tailer's cursor sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum TailerState {
    /// Before the first entry of the earliest cycle.
    BeforeStart,
    /// On a specific entry.
    Positioned,
    /// After the last entry written so far.
    AtEnd,
}

/// A reader for consuming messages from the queue.
///
/// Each tailer keeps its own cursor; any number of them may read the same
/// queue concurrently. A tailer is not shared between threads.
pub struct Tailer {
    directory: Arc<StoreDirectory>,
    /// Source id this tailer reads on behalf of.
    source_id: u32,
    store:     Option<Arc<CycleStore>>,
    /// Cycle of the next entry.
    cycle:     u64,
    /// Sequence of the next entry within `cycle`.
    sequence:  u64,
    /// Byte position of the next entry within `store`.
    position:  u64,
    state:     TailerState,
}

impl Tailer {
    pub(crate) fn new(directory: Arc<StoreDirectory>, source_id: u32) -> Self {
        Self {
            directory,
            source_id,
            store: None,
            cycle: 0,
            sequence: 0,
            position: 0,
            state: TailerState::BeforeStart,
        }
    }

    pub fn state(&self) -> TailerState { self.state }

    /// Cycle of the next entry to read.
    pub fn current_cycle(&self) -> u64 { self.cycle }

    /// Global index of the next entry to read.
    pub fn index(&self) -> u64 { self.directory.geometry().to_index(self.cycle, self.sequence) }

    pub fn source_id(&self) -> u32 { self.source_id }

    /// Position at the first entry of the earliest cycle.
    pub fn to_start(&mut self) -> Result<()> {
        self.detach(self.directory.first_cycle()?.unwrap_or(0));
        self.state = TailerState::BeforeStart;
        Ok(())
    }

    /// Position after the last entry of the latest cycle.
    pub fn to_end(&mut self) -> Result<()> {
        let Some(last) = self.directory.last_cycle()? else {
            self.detach(0);
            self.state = TailerState::AtEnd;
            return Ok(());
        };
        self.detach(last);
        if let Some(store) = self.directory.acquire(last, false)? {
            let (sequence, position) = store.write_cursor()?;
            self.attach(store, sequence, position);
        }
        self.state = TailerState::AtEnd;
        Ok(())
    }

    /// Position exactly at `index`. Returns `false`, leaving the cursor where
    /// it was, if no such entry exists.
    pub fn move_to_index(&mut self, index: u64) -> Result<bool> {
        let geometry = *self.directory.geometry();
        let (cycle, sequence) = (geometry.to_cycle(index), geometry.to_sequence(index));
        let Some(store) = self.directory.acquire(cycle, false)? else {
            return Ok(false);
        };
        let Some(position) = locate(&store, sequence)? else {
            return Ok(false);
        };
        self.cycle = cycle;
        self.attach(store, sequence, position);
        self.state = TailerState::Positioned;
        Ok(true)
    }

    /// Read the next message, rolling to a later cycle when the current one
    /// is exhausted.
    ///
    /// Returns `Ok(None)` when nothing more has been written yet; the tailer
    /// stays put and can be polled again.
    pub fn read_next(&mut self) -> Result<Option<Message>> {
        loop {
            let Some(store) = self.current_store()? else {
                return Ok(None);
            };

            match store.read_header(self.position)? {
                EntryHeader::Data {
                    body_len,
                    has_history,
                } => {
                    let entry = EntryRef {
                        sequence: self.sequence,
                        position: self.position,
                        body_len,
                        has_history,
                    };
                    let (history, payload) = store.read_body(&entry)?;
                    let message = Message {
                        index: store.geometry().to_index(self.cycle, self.sequence),
                        source_id: store.source_id(),
                        history,
                        payload,
                    };
                    self.sequence += 1;
                    self.position = entry.end();
                    self.state = TailerState::Positioned;
                    return Ok(Some(message));
                }
                EntryHeader::Empty | EntryHeader::EndOfCycle => {
                    let Some(next) = self.directory.next_cycle_after(self.cycle)? else {
                        self.state = TailerState::AtEnd;
                        return Ok(None);
                    };
                    debug!(from = self.cycle, to = next, "Tailer rolling to next cycle");
                    self.detach(next);
                }
            }
        }
    }

    /// Position just past the newest entry of `other` that was replayed
    /// from this tailer's source, so a replay can resume where it stopped.
    ///
    /// Starts from the beginning when `other` holds nothing from this source.
    ///
    /// # Errors
    ///
    /// [`CrossSourceMisattribution`](crate::QueueError::CrossSourceMisattribution)
    /// when the checkpoint cannot be attributed to this source: this tailer
    /// has no source id, `other` is this tailer's own queue, or the index
    /// recorded in `other` does not exist here.
    pub fn after_last_written(&mut self, other: &Queue) -> Result<()> {
        let source_id = self.source_id;
        ensure!(
            source_id != 0,
            CrossSourceMisattributionSnafu {
                source_id,
                reason: "the tailer's queue has no source id",
            }
        );
        ensure!(
            !same_directory(other.base_path(), self.directory.base_path()),
            CrossSourceMisattributionSnafu {
                source_id,
                reason: "the checkpoint queue is the tailer's own queue",
            }
        );

        let Some(index) = other.last_index_from_source(source_id)? else {
            debug!(source_id, "No checkpoint found, replaying from the start");
            return self.to_start();
        };
        ensure!(
            self.move_to_index(index)?,
            CrossSourceMisattributionSnafu {
                source_id,
                reason: format!(
                    "index {index:#x} recorded in {} does not exist in this queue",
                    other.base_path().display()
                ),
            }
        );
        // Step over the checkpointed entry itself.
        self.read_next()?;
        debug!(source_id, checkpoint = index, next = self.index(), "Resumed after checkpoint");
        Ok(())
    }

    /// The store holding the next entry, opening the first cycle at or after
    /// `self.cycle` when none is held.
    ///
    /// A cycle whose file is not initialized yet is skipped when a later
    /// cycle exists, since no writer goes back to it.
    fn current_store(&mut self) -> Result<Option<Arc<CycleStore>>> {
        if let Some(store) = &self.store {
            return Ok(Some(Arc::clone(store)));
        }
        let cycles: Vec<u64> = self
            .directory
            .cycles()?
            .into_iter()
            .filter(|c| *c >= self.cycle)
            .collect();
        for (i, cycle) in cycles.iter().copied().enumerate() {
            let Some(store) = self.directory.acquire(cycle, false)? else {
                if i + 1 < cycles.len() {
                    debug!(cycle, "Skipping uninitialized cycle");
                }
                continue;
            };
            self.cycle = cycle;
            let data_start = store.data_start();
            self.attach(Arc::clone(&store), 0, data_start);
            return Ok(Some(store));
        }
        Ok(None)
    }

    fn attach(&mut self, store: Arc<CycleStore>, sequence: u64, position: u64) {
        self.store = Some(store);
        self.sequence = sequence;
        self.position = position;
    }

    /// Release the held store and point at the start of `cycle`.
    fn detach(&mut self, cycle: u64) {
        self.store = None;
        self.cycle = cycle;
        self.sequence = 0;
        self.position = 0;
    }
}

impl Iterator for Tailer {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> { self.read_next().transpose() }
}

impl std::fmt::Debug for Tailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tailer")
            .field("base_path", &self.directory.base_path())
            .field("source_id", &self.source_id)
            .field("cycle", &self.cycle)
            .field("sequence", &self.sequence)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Byte position of `target` in `store`: nearest index slot, then a forward
/// scan.
pub(crate) fn locate(store: &CycleStore, target: u64) -> Result<Option<u64>> {
    let index = SparseIndex::new(store);
    let mut start = None;
    for attempt in 0..RETRY_BUDGET {
        match index.lookup(target)? {
            Lookup::Found(found) => {
                start = Some(found);
                break;
            }
            Lookup::NotFound => {
                start = Some((0, store.data_start()));
                break;
            }
            Lookup::Retry => backoff(attempt),
        }
    }
    let (sequence, position) = start.unwrap_or_else(|| {
        debug!(
            cycle = store.cycle(),
            target, "Index lookup did not settle, scanning from the start of the cycle"
        );
        (0, store.data_start())
    });

    for entry in store.scan_from(sequence, position)? {
        let entry = entry?;
        if entry.sequence == target {
            return Ok(Some(entry.position));
        }
    }
    Ok(None)
}

fn same_directory(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
