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

use std::{path::PathBuf, sync::Arc};

use crate::{
    FlushMode, Queue, QueueConfig, Result, RollCycle,
    config::TEST_BLOCK_SIZE,
    time::{SystemTimeProvider, TimeProvider},
};

pub struct QueueBuilder {
    config: QueueConfig,
    time:   Arc<dyn TimeProvider>,
}

impl QueueBuilder {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self::from_config(QueueConfig {
            base_path: base_path.into(),
            ..Default::default()
        })
    }

    /// Start from a loaded configuration.
    #[must_use]
    pub fn from_config(config: QueueConfig) -> Self {
        Self {
            config,
            time: Arc::new(SystemTimeProvider),
        }
    }

    pub fn roll_cycle(mut self, roll_cycle: RollCycle) -> Self {
        self.config.roll_cycle = roll_cycle;
        self
    }

    pub fn source_id(mut self, source_id: u32) -> Self {
        self.config.source_id = source_id;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    pub fn index_count(mut self, index_count: u32) -> Self {
        self.config.index_count = Some(index_count);
        self
    }

    pub fn index_spacing(mut self, index_spacing: u32) -> Self {
        self.config.index_spacing = Some(index_spacing);
        self
    }

    pub fn block_size(mut self, size: u64) -> Self {
        self.config.block_size = size;
        self
    }

    /// Use small cycle files, suitable for tests.
    pub fn test_block_size(self) -> Self { self.block_size(TEST_BLOCK_SIZE) }

    pub fn epoch(mut self, epoch_millis: i64) -> Self {
        self.config.epoch = epoch_millis;
        self
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.config.flush_mode = mode;
        self
    }

    pub fn time_provider(mut self, time: Arc<dyn TimeProvider>) -> Self {
        self.time = time;
        self
    }

    pub fn build(self) -> Result<Queue> { Queue::open(self.config, self.time) }
}
