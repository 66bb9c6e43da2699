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

use std::{io, path::PathBuf};

use snafu::Snafu;

/// Queue operation errors.
///
/// Read-side "not present" and "retry" outcomes are ordinary return values
/// ([`Option`] and [`Lookup`](crate::codec::Lookup)), not errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    /// Filesystem I/O failure.
    #[snafu(display("IO error: {source}"), context(false))]
    Io {
        source: io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// Memory mapping operation failed.
    #[snafu(display("Mmap operation failed on {}", path.display()))]
    Mmap {
        path:   PathBuf,
        source: mmap_io::MmapIoError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// A word-wise access that does not start and end on an 8-byte boundary.
    #[snafu(display("Misaligned access of {len} bytes at {offset} in {}", path.display()))]
    Misaligned {
        path:   PathBuf,
        offset: u64,
        len:    usize,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// Rejected configuration value.
    #[snafu(display("Invalid queue configuration: {reason}"))]
    InvalidConfig {
        reason: String,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// A cycle file whose header does not match this queue.
    #[snafu(display("Invalid store {}: {reason}", path.display()))]
    InvalidStore {
        path:   PathBuf,
        reason: String,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// Header or CRC mismatch detected during read.
    #[snafu(display("Corrupted entry at position {position} in cycle {cycle}: {reason}"))]
    CorruptedEntry {
        cycle:    u64,
        position: u64,
        reason:   String,
        #[snafu(implicit)]
        loc:      snafu::Location,
    },

    /// A sequence or position does not fit the configured bit widths.
    #[snafu(display("{field} value {value:#x} exceeds the {bits}-bit encoding width"))]
    EncodingOverflow {
        field: &'static str,
        value: u64,
        bits:  u32,
        #[snafu(implicit)]
        loc:   snafu::Location,
    },

    /// The cycle file has no room left between entry data and index leaves.
    #[snafu(display("Store for cycle {cycle} is full: need {needed} bytes at {position}"))]
    StoreFull {
        cycle:    u64,
        position: u64,
        needed:   u64,
        #[snafu(implicit)]
        loc:      snafu::Location,
    },

    /// The cycle already holds as many entries as its index geometry covers.
    #[snafu(display("Cycle {cycle} reached its capacity of {capacity} entries"))]
    CycleFull {
        cycle:    u64,
        capacity: u64,
        #[snafu(implicit)]
        loc:      snafu::Location,
    },

    /// Write attempted on a queue opened read-only.
    #[snafu(display("Queue at {} is read-only", path.display()))]
    ReadOnly {
        path: PathBuf,
        #[snafu(implicit)]
        loc:  snafu::Location,
    },

    /// An index slot already holds a different position.
    #[snafu(display(
        "Index slot for sequence {sequence} already holds position {existing}, refusing {position}"
    ))]
    IndexConflict {
        sequence: u64,
        existing: u64,
        position: u64,
        #[snafu(implicit)]
        loc:      snafu::Location,
    },

    /// A per-source checkpoint could not be attributed to the reading source.
    #[snafu(display("Cannot resolve checkpoint for source {source_id}: {reason}"))]
    CrossSourceMisattribution {
        source_id: u32,
        reason:    String,
        #[snafu(implicit)]
        loc:       snafu::Location,
    },
}

impl QueueError {
    /// Whether the error stems from configuration or width limits rather than
    /// from the environment.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::EncodingOverflow { .. }
                | Self::Misaligned { .. }
                | Self::InvalidConfig { .. }
                | Self::InvalidStore { .. }
                | Self::CorruptedEntry { .. }
        )
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
