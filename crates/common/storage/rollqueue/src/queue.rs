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

//! Main queue struct and lifecycle management.
//!
//! The [`Queue`] is the central entry point for the persistent queue library.
//! It owns:
//! - The validated configuration and index geometry
//! - The [`StoreDirectory`] that maps cycle files on demand
//! - The time provider consulted by appenders
//! - Factory methods for [`Appender`] and [`Tailer`]
//!
//! ## Usage
//!
//! ```ignore
//! // Create or open a queue
//! let queue = QueueBuilder::new("/path/to/queue").build()?;
//!
//! // Write messages
//! let mut appender = queue.acquire_appender()?;
//! appender.append(b"hello")?;
//!
//! // Read messages
//! let mut tailer = queue.create_tailer();
//! while let Some(msg) = tailer.read_next()? {
//!     println!("{:?}", msg.payload);
//! }
//! ```

use std::{path::Path, sync::Arc};

use tracing::info;

use crate::{
    QueueConfig, Result,
    appender::Appender,
    directory::StoreDirectory,
    roll_cycle::{IndexGeometry, RollCycle},
    store::StoreSettings,
    tailer::Tailer,
    time::TimeProvider,
};

/// A persistent append-only queue split into time-based cycles.
///
/// Appenders and tailers created from one `Queue` share its mapped stores.
pub struct Queue {
    config:    QueueConfig,
    geometry:  IndexGeometry,
    directory: Arc<StoreDirectory>,
    time:      Arc<dyn TimeProvider>,
}

impl Queue {
    /// Validate `config` and open the queue. Nothing is created on disk until
    /// the first append.
    pub(crate) fn open(config: QueueConfig, time: Arc<dyn TimeProvider>) -> Result<Self> {
        let geometry = config.validate()?;
        let settings = StoreSettings {
            roll_cycle: config.roll_cycle,
            geometry,
            source_id: config.source_id,
            epoch: config.epoch,
            block_size: config.block_size,
            flush_mode: config.flush_mode,
        };
        let directory = Arc::new(StoreDirectory::new(
            config.base_path.clone(),
            settings,
            config.read_only,
        ));

        info!(
            path = %config.base_path.display(),
            roll_cycle = %config.roll_cycle,
            source_id = config.source_id,
            read_only = config.read_only,
            index_count = geometry.index_count(),
            index_spacing = geometry.index_spacing(),
            "Queue opened"
        );

        Ok(Self {
            config,
            geometry,
            directory,
            time,
        })
    }

    /// Create the appender for this queue.
    ///
    /// Only one appender may write to a cycle at a time; holding two at once
    /// is a caller error.
    ///
    /// # Errors
    ///
    /// [`ReadOnly`](crate::QueueError::ReadOnly) if the queue was opened
    /// read-only.
    pub fn acquire_appender(&self) -> Result<Appender> {
        Appender::new(Arc::clone(&self.directory), Arc::clone(&self.time))
    }

    /// Create a tailer positioned before the first entry.
    #[must_use]
    pub fn create_tailer(&self) -> Tailer {
        Tailer::new(Arc::clone(&self.directory), self.config.source_id)
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig { &self.config }

    #[must_use]
    pub fn base_path(&self) -> &Path { &self.config.base_path }

    #[must_use]
    pub fn source_id(&self) -> u32 { self.config.source_id }

    #[must_use]
    pub fn roll_cycle(&self) -> RollCycle { self.config.roll_cycle }

    #[must_use]
    pub fn geometry(&self) -> &IndexGeometry { &self.geometry }

    #[must_use]
    pub fn is_read_only(&self) -> bool { self.config.read_only }

    /// Cycles with a file on disk, ascending.
    pub fn cycles(&self) -> Result<Vec<u64>> { self.directory.cycles() }

    pub fn first_cycle(&self) -> Result<Option<u64>> { self.directory.first_cycle() }

    pub fn last_cycle(&self) -> Result<Option<u64>> { self.directory.last_cycle() }

    /// Cycle the time provider currently points at.
    #[must_use]
    pub fn current_cycle(&self) -> u64 {
        self.config
            .roll_cycle
            .cycle_for(self.time.current_time_millis(), self.config.epoch)
    }

    /// Index of the first entry in the queue.
    pub fn first_index(&self) -> Result<Option<u64>> {
        for cycle in self.cycles()? {
            let Some(store) = self.directory.acquire(cycle, false)? else {
                continue;
            };
            if store.entry_count()? > 0 {
                return Ok(Some(self.geometry.to_index(cycle, 0)));
            }
        }
        Ok(None)
    }

    /// Index of the newest entry in the queue.
    pub fn last_index(&self) -> Result<Option<u64>> {
        for cycle in self.cycles()?.into_iter().rev() {
            let Some(store) = self.directory.acquire(cycle, false)? else {
                continue;
            };
            if let Some((sequence, _)) = store.last_written_settled()? {
                return Ok(Some(self.geometry.to_index(cycle, sequence)));
            }
        }
        Ok(None)
    }

    /// Entries across every cycle.
    pub fn entry_count(&self) -> Result<u64> {
        let mut total = 0;
        for cycle in self.cycles()? {
            if let Some(store) = self.directory.acquire(cycle, false)? {
                total += store.entry_count()?;
            }
        }
        Ok(total)
    }

    /// Highest index of `source_id` recorded in the history of this queue's
    /// entries: the checkpoint a replay from that source resumes after.
    ///
    /// Cycles are searched newest first and the search stops at the first
    /// cycle holding any entry from the source.
    pub fn last_index_from_source(&self, source_id: u32) -> Result<Option<u64>> {
        for cycle in self.cycles()?.into_iter().rev() {
            let Some(store) = self.directory.acquire(cycle, false)? else {
                continue;
            };
            let mut newest = None;
            for entry in store.scan_from(0, store.data_start())? {
                let entry = entry?;
                if !entry.has_history {
                    continue;
                }
                let (history, _) = store.read_body(&entry)?;
                if let Some(index) = history.index_for_source(source_id) {
                    newest = newest.max(Some(index));
                }
            }
            if newest.is_some() {
                return Ok(newest);
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("config", &self.config)
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}
