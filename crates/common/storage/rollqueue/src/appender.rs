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

//! Message writer (appender) for producing to the queue.
//!
//! The [`Appender`] writes entries straight into the mapped store of the
//! current cycle. For every append it:
//! - asks the time provider which cycle is current and rolls if needed
//! - copies the entry body, then publishes its header word
//! - advances the store's last-written cell
//! - publishes a sparse index slot on spacing boundaries
//!
//! ## Concurrency
//!
//! At most one appender may write to a given cycle store at a time, across
//! all processes sharing the queue directory. This is a caller contract and
//! is not checked. Tailers may read concurrently without coordination.

use std::sync::Arc;

use snafu::ensure;
use tracing::{debug, info};

use crate::{
    Result,
    directory::StoreDirectory,
    error::{CycleFullSnafu, EncodingOverflowSnafu, InvalidStoreSnafu, ReadOnlySnafu},
    index::SparseIndex,
    message::{EncodedEntry, MAX_HISTORY_ENTRIES, Message, MessageHistory},
    store::CycleStore,
    time::TimeProvider,
};

/// Where an appender is in its write cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum AppenderState {
    /// Between appends.
    Idle,
    /// An entry is being copied and published.
    WritingEntry,
    /// The most recent append started a new cycle.
    RolledOver,
}

/// A writer for appending messages to the queue.
pub struct Appender {
    directory:  Arc<StoreDirectory>,
    time:       Arc<dyn TimeProvider>,
    store:      Option<Arc<CycleStore>>,
    state:      AppenderState,
    last_index: Option<u64>,
}

impl Appender {
    pub(crate) fn new(directory: Arc<StoreDirectory>, time: Arc<dyn TimeProvider>) -> Result<Self> {
        ensure!(
            !directory.is_read_only(),
            ReadOnlySnafu {
                path: directory.base_path().to_path_buf(),
            }
        );
        Ok(Self {
            directory,
            time,
            store: None,
            state: AppenderState::Idle,
            last_index: None,
        })
    }

    /// Append a message and return its global index.
    ///
    /// # Errors
    ///
    /// - [`CycleFull`](crate::QueueError::CycleFull) when the cycle's index
    ///   tree cannot address another entry.
    /// - [`StoreFull`](crate::QueueError::StoreFull) when the cycle file has
    ///   no room left.
    /// - [`EncodingOverflow`](crate::QueueError::EncodingOverflow) when the
    ///   cycle or position exceeds its encoding width.
    pub fn append(&mut self, payload: impl AsRef<[u8]>) -> Result<u64> {
        self.write(None, payload.as_ref())
    }

    /// Append several messages, returning their indices in order.
    pub fn append_batch<I, P>(&mut self, items: I) -> Result<Vec<u64>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        items
            .into_iter()
            .map(|payload| self.append(payload))
            .collect()
    }

    /// Append `message`, read from another queue, recording where it came
    /// from in its history.
    ///
    /// A message from a queue without a source id keeps its history as is.
    pub fn replay(&mut self, message: &Message) -> Result<u64> {
        let mut history = message.history.clone();
        if message.source_id != 0 {
            history.push(message.source_id, message.index);
        }
        self.append_with_history(&history, &message.payload)
    }

    /// Append a payload with an explicit history.
    pub fn append_with_history(
        &mut self,
        history: &MessageHistory,
        payload: impl AsRef<[u8]>,
    ) -> Result<u64> {
        let hops = history.entries().len();
        ensure!(
            hops <= MAX_HISTORY_ENTRIES,
            EncodingOverflowSnafu {
                field: "history",
                value: hops as u64,
                bits:  u16::BITS,
            }
        );
        self.write(Some(history), payload.as_ref())
    }

    /// Index returned by the most recent successful append.
    pub fn last_index_appended(&self) -> Option<u64> { self.last_index }

    /// Cycle of the store currently held, if any.
    pub fn cycle(&self) -> Option<u64> { self.store.as_ref().map(|store| store.cycle()) }

    pub fn state(&self) -> AppenderState { self.state }

    fn write(&mut self, history: Option<&MessageHistory>, payload: &[u8]) -> Result<u64> {
        let rolled = self.ensure_current_cycle()?;
        self.state = AppenderState::WritingEntry;
        let written = self.write_entry(history, payload);
        self.state = if rolled {
            AppenderState::RolledOver
        } else {
            AppenderState::Idle
        };
        let index = written?;
        self.last_index = Some(index);
        Ok(index)
    }

    /// Hold the store of the cycle the clock points at. Returns whether the
    /// appender moved to a new cycle.
    fn ensure_current_cycle(&mut self) -> Result<bool> {
        let roll_cycle = self.directory.roll_cycle();
        let geometry = *self.directory.geometry();
        let now = self.time.current_time_millis();
        let cycle = roll_cycle.cycle_for(now, self.directory.settings().epoch);
        ensure!(
            cycle <= geometry.max_cycle(),
            EncodingOverflowSnafu {
                field: "cycle",
                value: cycle,
                bits:  63 - geometry.cycle_shift(),
            }
        );

        let previous = match self.store.take() {
            Some(store) if cycle <= store.cycle() => {
                self.store = Some(store);
                return Ok(false);
            }
            previous => previous,
        };
        let rolled = previous.is_some();
        let target = match previous {
            Some(_) => cycle,
            // Never go back to a cycle earlier than one already on disk.
            None => self
                .directory
                .last_cycle()?
                .map_or(cycle, |last| last.max(cycle)),
        };

        if let Some(old) = previous {
            let (_, end) = old.write_cursor()?;
            old.write_end_of_cycle(end)?;
            old.flush()?;
            info!(from = old.cycle(), to = target, "Rolling to new cycle");
        }

        let store = self.directory.acquire(target, true)?.ok_or_else(|| {
            InvalidStoreSnafu {
                path:   self.directory.path_for(target),
                reason: "store is still being initialized",
            }
            .build()
        })?;
        store.recover_last_written()?;
        debug!(cycle = target, "Appender acquired cycle");
        self.store = Some(store);
        Ok(rolled)
    }

    fn write_entry(&self, history: Option<&MessageHistory>, payload: &[u8]) -> Result<u64> {
        let Some(store) = self.store.as_deref() else {
            return ReadOnlySnafu {
                path: self.directory.base_path().to_path_buf(),
            }
            .fail();
        };
        let geometry = store.geometry();
        let (sequence, position) = store.write_cursor()?;
        ensure!(
            sequence < geometry.capacity(),
            CycleFullSnafu {
                cycle:    store.cycle(),
                capacity: geometry.capacity(),
            }
        );

        let entry = EncodedEntry::new(history, payload)?;
        let index = SparseIndex::new(store);
        if index.is_indexed(sequence) {
            // Reserve the leaf before the entry becomes visible.
            index.ensure_leaf(sequence, position + entry.disk_size())?;
        }
        store.write_entry(sequence, position, &entry)?;
        index.publish(sequence, position)?;

        store.flush()?;
        Ok(geometry.to_index(store.cycle(), sequence))
    }
}

impl std::fmt::Debug for Appender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Appender")
            .field("base_path", &self.directory.base_path())
            .field("cycle", &self.cycle())
            .field("state", &self.state)
            .field("last_index", &self.last_index)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{QueueBuilder, RollCycle, SetTimeProvider};

    // 2026-01-14T00:00:00Z
    const START: i64 = 1_768_348_800_000;

    #[test]
    fn test_append_assigns_consecutive_indices() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(SetTimeProvider::new(START));
        let queue = QueueBuilder::new(temp_dir.path())
            .roll_cycle(RollCycle::Daily)
            .test_block_size()
            .time_provider(clock)
            .build()
            .unwrap();
        let mut appender = queue.acquire_appender().unwrap();
        assert_eq!(appender.state(), AppenderState::Idle);

        let first = appender.append(b"message 1").unwrap();
        let second = appender.append(b"message 2").unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(queue.geometry().to_sequence(first), 0);
        assert_eq!(appender.last_index_appended(), Some(second));
        assert_eq!(appender.state(), AppenderState::Idle);
    }

    #[test]
    fn test_append_batch() {
        let temp_dir = tempfile::tempdir().unwrap();
        let queue = QueueBuilder::new(temp_dir.path())
            .test_block_size()
            .time_provider(Arc::new(SetTimeProvider::new(START)))
            .build()
            .unwrap();
        let mut appender = queue.acquire_appender().unwrap();

        let indices = appender.append_batch(["msg1", "msg2", "msg3"]).unwrap();
        assert_eq!(indices.len(), 3);
        assert!(indices.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(queue.entry_count().unwrap(), 3);
    }

    #[test]
    fn test_roll_resets_sequence_and_marks_state() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(SetTimeProvider::new(START));
        let queue = QueueBuilder::new(temp_dir.path())
            .roll_cycle(RollCycle::Minutely)
            .test_block_size()
            .time_provider(clock.clone())
            .build()
            .unwrap();
        let geometry = *queue.geometry();
        let mut appender = queue.acquire_appender().unwrap();

        let first = appender.append(b"a").unwrap();
        appender.append(b"b").unwrap();
        clock.advance(Duration::from_secs(60));
        let third = appender.append(b"c").unwrap();

        assert_eq!(appender.state(), AppenderState::RolledOver);
        assert_eq!(geometry.to_cycle(third), geometry.to_cycle(first) + 1);
        assert_eq!(geometry.to_sequence(third), 0);
        assert!(third > first);

        appender.append(b"d").unwrap();
        assert_eq!(appender.state(), AppenderState::Idle);
    }

    #[test]
    fn test_clock_going_backwards_stays_on_current_cycle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(SetTimeProvider::new(START));
        let queue = QueueBuilder::new(temp_dir.path())
            .roll_cycle(RollCycle::Minutely)
            .test_block_size()
            .time_provider(clock.clone())
            .build()
            .unwrap();
        let mut appender = queue.acquire_appender().unwrap();

        let first = appender.append(b"a").unwrap();
        clock.set_time(START - 5 * 60_000);
        let second = appender.append(b"b").unwrap();
        assert_eq!(second, first + 1);

        // A fresh appender does not reopen an earlier cycle either.
        drop(appender);
        let mut appender = queue.acquire_appender().unwrap();
        let third = appender.append(b"c").unwrap();
        assert_eq!(third, second + 1);
    }

    #[test]
    fn test_new_appender_resumes_after_existing_entries() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(SetTimeProvider::new(START));
        let build = || {
            QueueBuilder::new(temp_dir.path())
                .test_block_size()
                .time_provider(clock.clone())
                .build()
                .unwrap()
        };

        let last = {
            let queue = build();
            let mut appender = queue.acquire_appender().unwrap();
            appender.append_batch(["one", "two"]).unwrap();
            appender.last_index_appended().unwrap()
        };

        let queue = build();
        let mut appender = queue.acquire_appender().unwrap();
        assert_eq!(appender.append(b"three").unwrap(), last + 1);
    }

    #[test]
    fn test_cycle_full() {
        let temp_dir = tempfile::tempdir().unwrap();
        let queue = QueueBuilder::new(temp_dir.path())
            .roll_cycle(RollCycle::TestDaily)
            .index_count(2)
            .index_spacing(1)
            .test_block_size()
            .time_provider(Arc::new(SetTimeProvider::new(START)))
            .build()
            .unwrap();
        let mut appender = queue.acquire_appender().unwrap();

        for _ in 0..4 {
            appender.append(b"x").unwrap();
        }
        let err = appender.append(b"x").unwrap_err();
        assert!(matches!(err, crate::QueueError::CycleFull { capacity: 4, .. }));
        assert_eq!(appender.state(), AppenderState::Idle);
    }

    #[test]
    fn test_replay_records_history() {
        let temp_dir = tempfile::tempdir().unwrap();
        let queue = QueueBuilder::new(temp_dir.path())
            .test_block_size()
            .time_provider(Arc::new(SetTimeProvider::new(START)))
            .build()
            .unwrap();
        let mut appender = queue.acquire_appender().unwrap();

        let mut history = MessageHistory::new();
        history.push(1, 10);
        let message = Message {
            index: 0x4_0000_0007,
            source_id: 9,
            history,
            payload: bytes::Bytes::from_static(b"payload"),
        };
        appender.replay(&message).unwrap();

        let mut tailer = queue.create_tailer();
        let read = tailer.read_next().unwrap().unwrap();
        assert_eq!(read.payload, message.payload);
        assert_eq!(read.history.index_for_source(1), Some(10));
        assert_eq!(read.history.index_for_source(9), Some(0x4_0000_0007));
    }
}
