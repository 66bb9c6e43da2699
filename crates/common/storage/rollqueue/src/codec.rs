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

//! Packing of `(sequence, position)` pairs into two-word cells.
//!
//! ## Cell Format
//!
//! ```text
//! word 0 (position)   ┌──────────────┬────────────────────────────────────┐
//!                     │ zero (16b)   │ byte position (48b)                │
//!                     └──────────────┴────────────────────────────────────┘
//! word 1 (check)      ┌───┬──────────────────────────┬───────────────────┐
//!                     │ P │ position tag             │ sequence          │
//!                     └───┴──────────────────────────┴───────────────────┘
//!                     63   62 ........... cycle_shift  cycle_shift-1 .. 0
//! ```
//!
//! - **P**: published flag. A check word of zero means "never written"; a
//!   nonzero word without `P` is a cell mid-update.
//! - **position tag**: the low bits of word 0, so a reader that pairs word 0
//!   of one publication with word 1 of another sees a mismatch.
//!
//! Writers mark word 1 busy, store word 0, then store the final word 1.
//! Readers load word 1, word 0, and word 1 again; any disagreement is
//! reported as [`Lookup::Retry`], never as a value.

use std::{
    ops::Deref,
    sync::atomic::{AtomicU64, Ordering},
};

use snafu::ensure;

use crate::{Result, error::EncodingOverflowSnafu, roll_cycle::IndexGeometry};

/// Width of the byte position stored in a cell.
pub const POSITION_BITS: u32 = 48;

/// Mask applied to positions before packing.
pub const POSITION_MASK: u64 = (1 << POSITION_BITS) - 1;

const PUBLISHED: u64 = 1 << 63;

/// Check-word value held while a writer replaces a cell.
const BUSY: u64 = 1 << 62;

/// Outcome of a lock-free lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    /// Confirmed absent: nothing has been published.
    NotFound,
    /// Indeterminate: a write is in flight or the cell belongs to another
    /// position. Re-issue the query.
    Retry,
}

/// Raw contents of a two-word cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedSlot {
    pub position: u64,
    pub check:    u64,
}

impl PackedSlot {
    pub const UNSET: Self = Self {
        position: 0,
        check:    0,
    };

    /// What a reader sees while a writer is replacing the cell.
    pub const BUSY: Self = Self {
        position: 0,
        check:    BUSY,
    };

    #[must_use]
    pub const fn is_unset(&self) -> bool { self.check == 0 }
}

/// Encodes `(sequence, position)` pairs for one index geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencePositionCodec {
    sequence_bits: u32,
}

impl SequencePositionCodec {
    #[must_use]
    pub const fn new(geometry: &IndexGeometry) -> Self {
        Self {
            sequence_bits: geometry.cycle_shift(),
        }
    }

    #[must_use]
    pub const fn sequence_mask(&self) -> u64 { (1 << self.sequence_bits) - 1 }

    const fn tag_mask(&self) -> u64 { (1 << (63 - self.sequence_bits)) - 1 }

    const fn tag(&self, position: u64) -> u64 { position & self.tag_mask() }

    /// Pack without range checks: bits above the sequence width and above
    /// [`POSITION_BITS`] are discarded.
    #[must_use]
    pub const fn encode(&self, sequence: u64, position: u64) -> PackedSlot {
        let position = position & POSITION_MASK;
        PackedSlot {
            position,
            check: PUBLISHED
                | (self.tag(position) << self.sequence_bits)
                | (sequence & self.sequence_mask()),
        }
    }

    /// Pack, failing instead of discarding bits that do not fit.
    pub fn try_encode(&self, sequence: u64, position: u64) -> Result<PackedSlot> {
        ensure!(
            position <= POSITION_MASK,
            EncodingOverflowSnafu {
                field: "position",
                value: position,
                bits:  POSITION_BITS,
            }
        );
        ensure!(
            sequence <= self.sequence_mask(),
            EncodingOverflowSnafu {
                field: "sequence",
                value: sequence,
                bits:  self.sequence_bits,
            }
        );
        Ok(self.encode(sequence, position))
    }

    /// Unpack a cell into `(sequence, position)`.
    #[must_use]
    pub const fn decode(&self, slot: PackedSlot) -> Lookup<(u64, u64)> {
        if slot.check == 0 {
            return Lookup::NotFound;
        }
        if slot.check & PUBLISHED == 0 || slot.position > POSITION_MASK {
            return Lookup::Retry;
        }
        let tag = (slot.check >> self.sequence_bits) & self.tag_mask();
        if tag != self.tag(slot.position) {
            return Lookup::Retry;
        }
        Lookup::Found((slot.check & self.sequence_mask(), slot.position))
    }

    /// Sequence published for `for_position`.
    ///
    /// A cell published for any other position answers [`Lookup::Retry`]:
    /// the caller raced a writer and must ask again.
    #[must_use]
    pub const fn sequence_for(&self, slot: PackedSlot, for_position: u64) -> Lookup<u64> {
        match self.decode(slot) {
            Lookup::Found((sequence, position)) => {
                if position == for_position & POSITION_MASK {
                    Lookup::Found(sequence)
                } else {
                    Lookup::Retry
                }
            }
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Retry => Lookup::Retry,
        }
    }
}

/// Two adjacent atomic words published as one value.
///
/// Generic over how the words are held: plain references, or the guarded
/// views a mapping hands out, which the cell keeps alive while it lives.
pub struct TwoWordCell<W> {
    position: W,
    check:    W,
}

impl<W: Deref<Target = AtomicU64>> TwoWordCell<W> {
    #[must_use]
    pub const fn new(position: W, check: W) -> Self { Self { position, check } }

    /// Snapshot of the cell. A snapshot taken across a concurrent update
    /// has a check word without the published flag.
    #[must_use]
    pub fn load(&self) -> PackedSlot {
        let before = self.check.load(Ordering::Acquire);
        let position = self.position.load(Ordering::Acquire);
        let after = self.check.load(Ordering::Acquire);
        PackedSlot {
            position,
            check: if before == after { after } else { BUSY },
        }
    }

    /// Replace the cell. Assumes a single writer per cell.
    pub fn publish(&self, slot: PackedSlot) {
        self.check.store(BUSY, Ordering::Release);
        self.position.store(slot.position, Ordering::Release);
        self.check.store(slot.check, Ordering::Release);
    }

    /// Replace the cell only if it still holds `expected`.
    pub fn compare_and_set(&self, expected: PackedSlot, new: PackedSlot) -> bool {
        if self
            .check
            .compare_exchange(expected.check, BUSY, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self.position.load(Ordering::Acquire) != expected.position {
            self.check.store(expected.check, Ordering::Release);
            return false;
        }
        self.position.store(new.position, Ordering::Release);
        self.check.store(new.check, Ordering::Release);
        true
    }
}

impl<W: Deref<Target = AtomicU64>> std::fmt::Debug for TwoWordCell<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TwoWordCell").field(&self.load()).finish()
    }
}
