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

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ensure;

use crate::{
    Result,
    error::InvalidConfigSnafu,
    roll_cycle::{IndexGeometry, RollCycle},
    store::min_block_size,
};

/// Size of each cycle file when nothing else is configured.
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Cycle file size used by tests.
pub const TEST_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct QueueConfig {
    #[default(_code = "PathBuf::from(\"./queue_data\")")]
    pub base_path:     PathBuf,
    #[default(RollCycle::Daily)]
    pub roll_cycle:    RollCycle,
    /// Identifies this queue as a producer in replayed message history.
    /// Zero means "no source id".
    pub source_id:     u32,
    pub read_only:     bool,
    /// Overrides [`RollCycle::default_index_count`].
    pub index_count:   Option<u32>,
    /// Overrides [`RollCycle::default_index_spacing`].
    pub index_spacing: Option<u32>,
    /// Bytes reserved for each cycle file.
    #[default(DEFAULT_BLOCK_SIZE)]
    pub block_size:    u64,
    /// Offset in milliseconds added to cycle boundaries.
    pub epoch:         i64,
    pub flush_mode:    FlushMode,
}

impl QueueConfig {
    /// Index geometry after applying overrides.
    pub fn geometry(&self) -> Result<IndexGeometry> {
        IndexGeometry::new(
            self.index_count
                .unwrap_or_else(|| self.roll_cycle.default_index_count()),
            self.index_spacing
                .unwrap_or_else(|| self.roll_cycle.default_index_spacing()),
        )
    }

    pub fn validate(&self) -> Result<IndexGeometry> {
        let geometry = self.geometry()?;
        let min = min_block_size(&geometry);
        ensure!(
            self.block_size >= min,
            InvalidConfigSnafu {
                reason: format!(
                    "block_size {} is too small for index_count {}, need at least {min}",
                    self.block_size,
                    geometry.index_count()
                ),
            }
        );
        ensure!(
            self.block_size % 8 == 0,
            InvalidConfigSnafu {
                reason: format!("block_size {} must be a multiple of 8", self.block_size),
            }
        );
        Ok(geometry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Leave write-back to the kernel.
    #[default]
    Async,
    /// Flush every appended entry before returning.
    Sync,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = QueueConfig::default();
        assert_eq!(config.roll_cycle, RollCycle::Daily);
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        let geometry = config.validate().unwrap();
        assert_eq!(geometry, RollCycle::Daily.default_geometry());
    }

    #[test]
    fn test_overrides_apply() {
        let config = QueueConfig {
            roll_cycle: RollCycle::Hourly,
            index_count: Some(64),
            index_spacing: Some(4),
            ..Default::default()
        };
        let geometry = config.validate().unwrap();
        assert_eq!(geometry.index_count(), 64);
        assert_eq!(geometry.index_spacing(), 4);
    }

    #[test]
    fn test_small_block_is_rejected() {
        let config = QueueConfig {
            roll_cycle: RollCycle::HugeDaily,
            block_size: 64 * 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_huge_daily_fits_test_block() {
        let config = QueueConfig {
            roll_cycle: RollCycle::HugeDaily,
            block_size: TEST_BLOCK_SIZE,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
