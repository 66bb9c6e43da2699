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

//! Time partitioning and index geometry.
//!
//! A [`RollCycle`] decides which cycle a timestamp belongs to and how the
//! cycle's sparse index is shaped. The shape ([`IndexGeometry`]) fixes how
//! many low bits of a global index hold the in-cycle sequence:
//!
//! ```text
//! 63                      cycle_shift                       0
//! ┌────────────────────────────┬─────────────────────────────┐
//! │           cycle            │     sequence within cycle    │
//! └────────────────────────────┴─────────────────────────────┘
//! ```
//!
//! `cycle_shift = max(32, 2 * log2(index_count) + log2(index_spacing))`, so
//! a cycle can address every entry its two-level index can cover.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::{Result, error::InvalidConfigSnafu};

/// Smallest number of low bits reserved for the in-cycle sequence.
const MIN_CYCLE_SHIFT: u32 = 32;

/// Upper bound for `index_count`; larger leaves stop being "sparse".
const MAX_INDEX_COUNT: u32 = 1 << 20;

/// Upper bound for `index_spacing`.
const MAX_INDEX_SPACING: u32 = 1 << 16;

/// Granularity at which the queue starts a new cycle file.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RollCycle {
    /// One cycle per second with a tiny index; meant for tests.
    TestSecondly,
    Minutely,
    Hourly,
    Daily,
    /// Daily cycles with wide index arrays for very high entry counts.
    HugeDaily,
    /// Daily cycles with an index entry for every message; meant for tests.
    TestDaily,
}

impl RollCycle {
    /// Length of one cycle in milliseconds.
    #[must_use]
    pub const fn length_millis(self) -> i64 {
        match self {
            Self::TestSecondly => 1_000,
            Self::Minutely => 60 * 1_000,
            Self::Hourly => 60 * 60 * 1_000,
            Self::Daily | Self::HugeDaily | Self::TestDaily => 24 * 60 * 60 * 1_000,
        }
    }

    #[must_use]
    pub const fn default_index_count(self) -> u32 {
        match self {
            Self::TestSecondly => 32,
            Self::Minutely => 2 << 10,
            Self::Hourly => 4 << 10,
            Self::Daily => 8 << 10,
            Self::HugeDaily => 32 << 10,
            Self::TestDaily => 8,
        }
    }

    #[must_use]
    pub const fn default_index_spacing(self) -> u32 {
        match self {
            Self::TestSecondly => 4,
            Self::Minutely | Self::Hourly => 16,
            Self::Daily | Self::HugeDaily => 64,
            Self::TestDaily => 1,
        }
    }

    /// Geometry used when the configuration does not override it.
    #[must_use]
    pub const fn default_geometry(self) -> IndexGeometry {
        IndexGeometry::from_parts(self.default_index_count(), self.default_index_spacing())
    }

    /// Stable numeric tag written into store headers.
    #[must_use]
    pub const fn code(self) -> u64 {
        match self {
            Self::TestSecondly => 1,
            Self::Minutely => 2,
            Self::Hourly => 3,
            Self::Daily => 4,
            Self::HugeDaily => 5,
            Self::TestDaily => 6,
        }
    }

    #[must_use]
    pub const fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::TestSecondly),
            2 => Some(Self::Minutely),
            3 => Some(Self::Hourly),
            4 => Some(Self::Daily),
            5 => Some(Self::HugeDaily),
            6 => Some(Self::TestDaily),
            _ => None,
        }
    }

    /// Map a wall-clock timestamp to its cycle.
    ///
    /// Monotonic in `timestamp_millis`. Timestamps before `epoch_millis`
    /// clamp to cycle 0.
    #[must_use]
    pub const fn cycle_for(self, timestamp_millis: i64, epoch_millis: i64) -> u64 {
        let since_epoch = timestamp_millis.saturating_sub(epoch_millis);
        if since_epoch <= 0 {
            return 0;
        }
        (since_epoch / self.length_millis()) as u64
    }

    /// First millisecond covered by `cycle`.
    #[must_use]
    pub const fn start_millis(self, cycle: u64, epoch_millis: i64) -> i64 {
        (cycle as i64)
            .saturating_mul(self.length_millis())
            .saturating_add(epoch_millis)
    }

    /// File stem for `cycle`, e.g. `20260114`, `20260114-13`, `20260114-1305`.
    ///
    /// The date is the cycle's start measured from the epoch, not wall clock.
    #[must_use]
    pub fn file_stem(self, cycle: u64) -> String {
        let start =
            DateTime::<Utc>::from_timestamp_millis(self.start_millis(cycle, 0)).unwrap_or_default();
        start.format(self.stem_pattern()).to_string()
    }

    /// Inverse of [`file_stem`](Self::file_stem). Returns `None` for names
    /// that were not produced by this roll cycle.
    #[must_use]
    pub fn parse_file_stem(self, stem: &str) -> Option<u64> {
        let (date_part, time_part) = stem.split_once('-').unwrap_or((stem, ""));
        let expected_time_digits = match self {
            Self::Daily | Self::HugeDaily | Self::TestDaily => 0,
            Self::Hourly => 2,
            Self::Minutely => 4,
            Self::TestSecondly => 6,
        };
        if date_part.len() != 8
            || time_part.len() != expected_time_digits
            || !time_part.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }

        let date = NaiveDate::parse_from_str(date_part, "%Y%m%d").ok()?;
        let field = |i: usize| time_part.get(i..i + 2).and_then(|s| s.parse::<u32>().ok());
        let time = NaiveTime::from_hms_opt(
            field(0).unwrap_or(0),
            field(2).unwrap_or(0),
            field(4).unwrap_or(0),
        )?;
        let millis = date.and_time(time).and_utc().timestamp_millis();
        if millis < 0 {
            return None;
        }
        let cycle = self.cycle_for(millis, 0);
        (self.start_millis(cycle, 0) == millis).then_some(cycle)
    }

    const fn stem_pattern(self) -> &'static str {
        match self {
            Self::Daily | Self::HugeDaily | Self::TestDaily => "%Y%m%d",
            Self::Hourly => "%Y%m%d-%H",
            Self::Minutely => "%Y%m%d-%H%M",
            Self::TestSecondly => "%Y%m%d-%H%M%S",
        }
    }
}

/// Shape of a cycle's sparse index and the bit split it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexGeometry {
    index_count:   u32,
    index_spacing: u32,
    cycle_shift:   u32,
}

impl IndexGeometry {
    /// Build a geometry, rejecting counts that are not powers of two.
    pub fn new(index_count: u32, index_spacing: u32) -> Result<Self> {
        ensure!(
            index_count.is_power_of_two() && (2..=MAX_INDEX_COUNT).contains(&index_count),
            InvalidConfigSnafu {
                reason: format!(
                    "index_count must be a power of two in 2..={MAX_INDEX_COUNT}, got {index_count}"
                ),
            }
        );
        ensure!(
            index_spacing.is_power_of_two() && index_spacing <= MAX_INDEX_SPACING,
            InvalidConfigSnafu {
                reason: format!(
                    "index_spacing must be a power of two <= {MAX_INDEX_SPACING}, got \
                     {index_spacing}"
                ),
            }
        );
        Ok(Self::from_parts(index_count, index_spacing))
    }

    const fn from_parts(index_count: u32, index_spacing: u32) -> Self {
        let bits = 2 * index_count.trailing_zeros() + index_spacing.trailing_zeros();
        let cycle_shift = if bits > MIN_CYCLE_SHIFT {
            bits
        } else {
            MIN_CYCLE_SHIFT
        };
        Self {
            index_count,
            index_spacing,
            cycle_shift,
        }
    }

    #[must_use]
    pub const fn index_count(&self) -> u32 { self.index_count }

    #[must_use]
    pub const fn index_spacing(&self) -> u32 { self.index_spacing }

    /// Number of low bits of a global index that hold the sequence.
    #[must_use]
    pub const fn cycle_shift(&self) -> u32 { self.cycle_shift }

    #[must_use]
    pub const fn sequence_mask(&self) -> u64 { (1u64 << self.cycle_shift) - 1 }

    /// Largest cycle number a global index can carry.
    #[must_use]
    pub const fn max_cycle(&self) -> u64 { (1u64 << (63 - self.cycle_shift)) - 1 }

    /// Entries a single cycle can hold before its index tree is exhausted.
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        let count = self.index_count as u64;
        count * count * self.index_spacing as u64
    }

    /// Compose a global index.
    #[must_use]
    pub const fn to_index(&self, cycle: u64, sequence: u64) -> u64 {
        (cycle << self.cycle_shift) | (sequence & self.sequence_mask())
    }

    #[must_use]
    pub const fn to_cycle(&self, index: u64) -> u64 { index >> self.cycle_shift }

    #[must_use]
    pub const fn to_sequence(&self, index: u64) -> u64 { index & self.sequence_mask() }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use strum::IntoEnumIterator;
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_cycle_for_is_monotonic() {
        for roll in RollCycle::iter() {
            let mut last = 0;
            for t in (0..10_000_000_i64).step_by(7_919) {
                let cycle = roll.cycle_for(t, 0);
                assert!(cycle >= last, "{roll} went backwards at {t}");
                last = cycle;
            }
        }
    }

    #[test]
    fn test_cycle_for_with_epoch() {
        let roll = RollCycle::Minutely;
        assert_eq!(roll.cycle_for(59_999, 0), 0);
        assert_eq!(roll.cycle_for(60_000, 0), 1);
        assert_eq!(roll.cycle_for(60_000, 30_000), 0);
        assert_eq!(roll.cycle_for(90_000, 30_000), 1);
        assert_eq!(roll.cycle_for(10, 1_000), 0);
    }

    #[test_case(RollCycle::Daily, "20260114")]
    #[test_case(RollCycle::HugeDaily, "20260114")]
    #[test_case(RollCycle::Hourly, "20260114-13")]
    #[test_case(RollCycle::Minutely, "20260114-1305")]
    #[test_case(RollCycle::TestSecondly, "20260114-130542")]
    fn test_file_stem_round_trip(roll: RollCycle, expected: &str) {
        let time = Utc.with_ymd_and_hms(2026, 1, 14, 13, 5, 42).unwrap();
        let cycle = roll.cycle_for(time.timestamp_millis(), 0);
        let stem = roll.file_stem(cycle);
        assert_eq!(stem, expected);
        assert_eq!(roll.parse_file_stem(&stem), Some(cycle));
    }

    #[test_case(RollCycle::Daily, 3 * 3_600_000)]
    #[test_case(RollCycle::Hourly, -1_800_000)]
    #[test_case(RollCycle::Minutely, 30_000)]
    #[test_case(RollCycle::TestSecondly, 250)]
    fn test_file_stem_round_trip_with_epoch(roll: RollCycle, epoch: i64) {
        let time = Utc.with_ymd_and_hms(2026, 1, 14, 13, 5, 42).unwrap();
        let cycle = roll.cycle_for(time.timestamp_millis(), epoch);
        for c in [cycle, cycle + 1] {
            let stem = roll.file_stem(c);
            assert_eq!(roll.parse_file_stem(&stem), Some(c), "{roll} stem {stem}");
        }
        assert_ne!(roll.file_stem(cycle), roll.file_stem(cycle + 1));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert_eq!(RollCycle::Daily.parse_file_stem("20260114-13"), None);
        assert_eq!(RollCycle::Hourly.parse_file_stem("20260114"), None);
        assert_eq!(RollCycle::Minutely.parse_file_stem("manifest"), None);
        assert_eq!(RollCycle::Minutely.parse_file_stem("2026011x-1305"), None);
    }

    #[test_case(RollCycle::Minutely, 32)]
    #[test_case(RollCycle::Hourly, 32)]
    #[test_case(RollCycle::Daily, 32)]
    #[test_case(RollCycle::HugeDaily, 36)]
    #[test_case(RollCycle::TestDaily, 32)]
    #[test_case(RollCycle::TestSecondly, 32)]
    fn test_default_cycle_shift(roll: RollCycle, shift: u32) {
        let geometry = roll.default_geometry();
        assert_eq!(geometry.cycle_shift(), shift);
        assert!(geometry.capacity() <= geometry.sequence_mask() + 1);
    }

    #[test]
    fn test_index_composition() {
        let geometry = RollCycle::Daily.default_geometry();
        let index = geometry.to_index(20_467, 12_345);
        assert_eq!(geometry.to_cycle(index), 20_467);
        assert_eq!(geometry.to_sequence(index), 12_345);
        assert!(geometry.to_index(20_467, 0) > geometry.to_index(20_466, 99));
    }

    #[test]
    fn test_geometry_validation() {
        assert!(IndexGeometry::new(8, 1).is_ok());
        assert!(IndexGeometry::new(12, 1).is_err());
        assert!(IndexGeometry::new(1, 1).is_err());
        assert!(IndexGeometry::new(8, 3).is_err());
        assert!(IndexGeometry::new(8, 0).is_err());
    }

    #[test]
    fn test_codes_round_trip() {
        for roll in RollCycle::iter() {
            assert_eq!(RollCycle::from_code(roll.code()), Some(roll));
        }
        assert_eq!(RollCycle::from_code(0), None);
    }
}
