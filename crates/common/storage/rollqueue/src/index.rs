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

//! Two-level sparse index stored inside a cycle file.
//!
//! ## Purpose
//!
//! Seeking to a sequence by scanning from the start of a cycle is O(n). The
//! index stores the position of every `index_spacing`th entry, so a seek is
//! two word loads plus a scan of fewer than `index_spacing` entries.
//!
//! ## Tree Shape
//!
//! ```text
//! root (header area)          leaves (bottom of the file)
//! ┌─────────┐                 ┌───────────┬───────────┬─────┐
//! │ leaf 0 ─┼────────────────▶│ slot 0    │ slot 1    │ ... │
//! │ leaf 1 ─┼──────┐          └───────────┴───────────┴─────┘
//! │ 0       │      └─────────▶┌───────────┬───────────┬─────┐
//! │ ...     │                 │ slot 0    │ slot 1    │ ... │
//! └─────────┘                 └───────────┴───────────┴─────┘
//! ```
//!
//! The root holds `index_count` leaf offsets (zero = not allocated). A leaf
//! holds `index_count` two-word cells; slot `k` of leaf `l` indexes sequence
//! `(l * index_count + k) * index_spacing`.
//!
//! Leaves are allocated lazily. Two publishers racing to allocate the same
//! leaf both carve space, but only one wins the compare-and-set on the root
//! slot; the loser adopts the winner's leaf and abandons its own.

use std::sync::atomic::Ordering;

use snafu::ensure;
use tracing::debug;

use crate::{
    Result,
    codec::{Lookup, PackedSlot},
    error::{CorruptedEntrySnafu, CycleFullSnafu, IndexConflictSnafu},
    store::{CycleStore, RETRY_BUDGET, backoff},
};

/// Sparse index view over one [`CycleStore`].
#[derive(Debug, Clone, Copy)]
pub struct SparseIndex<'a> {
    store: &'a CycleStore,
}

impl<'a> SparseIndex<'a> {
    #[must_use]
    pub const fn new(store: &'a CycleStore) -> Self { Self { store } }

    fn spacing(&self) -> u64 { u64::from(self.store.geometry().index_spacing()) }

    fn count(&self) -> u64 { u64::from(self.store.geometry().index_count()) }

    /// Whether `sequence` falls on an index boundary.
    #[must_use]
    pub fn is_indexed(&self, sequence: u64) -> bool { sequence % self.spacing() == 0 }

    /// `(leaf, slot)` holding the index entry for `sequence`'s boundary.
    fn slot_of(&self, sequence: u64) -> (u64, u64) {
        let slot_number = sequence / self.spacing();
        (slot_number / self.count(), slot_number % self.count())
    }

    /// Offset of `leaf`, or `None` if it was never allocated.
    fn leaf_offset(&self, leaf: u64) -> Result<Option<u64>> {
        let offset = self.store.root_slot(leaf)?.load(Ordering::Acquire);
        if offset == 0 {
            return Ok(None);
        }
        ensure!(
            self.store.is_valid_leaf(offset),
            CorruptedEntrySnafu {
                cycle:    self.store.cycle(),
                position: offset,
                reason:   format!("root slot {leaf} points outside the leaf area"),
            }
        );
        Ok(Some(offset))
    }

    /// Nearest indexed `(sequence, position)` at or below `target`.
    ///
    /// [`Lookup::NotFound`] means nothing at or below `target` is indexed and
    /// the caller should scan from the start of the cycle.
    pub fn lookup(&self, target: u64) -> Result<Lookup<(u64, u64)>> {
        let (target_leaf, target_slot) = self.slot_of(target);
        if target_leaf >= self.count() {
            // Past the end of the tree: the last slot is the best candidate.
            return self.lookup_from(self.count() - 1, self.count() - 1);
        }
        self.lookup_from(target_leaf, target_slot)
    }

    fn lookup_from(&self, mut leaf: u64, mut slot: u64) -> Result<Lookup<(u64, u64)>> {
        let codec = self.store.codec();
        loop {
            if let Some(offset) = self.leaf_offset(leaf)? {
                loop {
                    let cell = self.store.leaf_cell(offset, slot)?.load();
                    match codec.decode(cell) {
                        Lookup::Found((sequence, position)) => {
                            let expected = (leaf * self.count() + slot) * self.spacing();
                            ensure!(
                                sequence == expected,
                                CorruptedEntrySnafu {
                                    cycle: self.store.cycle(),
                                    position,
                                    reason: format!(
                                        "index slot for sequence {expected} holds {sequence}"
                                    ),
                                }
                            );
                            return Ok(Lookup::Found((sequence, position)));
                        }
                        Lookup::Retry => return Ok(Lookup::Retry),
                        Lookup::NotFound if slot == 0 => break,
                        Lookup::NotFound => slot -= 1,
                    }
                }
            }
            if leaf == 0 {
                return Ok(Lookup::NotFound);
            }
            leaf -= 1;
            slot = self.count() - 1;
        }
    }

    /// Offset of the leaf covering `sequence`, allocating and linking it if
    /// needed. New leaf space must stay above `data_end`.
    pub(crate) fn ensure_leaf(&self, sequence: u64, data_end: u64) -> Result<u64> {
        let (leaf, _) = self.slot_of(sequence);
        ensure!(
            leaf < self.count(),
            CycleFullSnafu {
                cycle:    self.store.cycle(),
                capacity: self.store.geometry().capacity(),
            }
        );
        if let Some(offset) = self.leaf_offset(leaf)? {
            return Ok(offset);
        }

        let allocated = self.store.allocate_leaf_space(data_end)?;
        match self.store.root_slot(leaf)?.compare_exchange(
            0,
            allocated,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                debug!(cycle = self.store.cycle(), leaf, offset = allocated, "Linked index leaf");
                Ok(allocated)
            }
            Err(winner) => {
                debug!(
                    cycle = self.store.cycle(),
                    leaf,
                    abandoned = allocated,
                    offset = winner,
                    "Lost leaf allocation race"
                );
                Ok(winner)
            }
        }
    }

    /// Record that `sequence` starts at `position`.
    ///
    /// Sequences off the spacing boundary are ignored. Publishing the same
    /// pair twice is a no-op; a different position for an already indexed
    /// sequence is an [`IndexConflict`](crate::QueueError::IndexConflict).
    pub fn publish(&self, sequence: u64, position: u64) -> Result<()> {
        if !self.is_indexed(sequence) {
            return Ok(());
        }
        let codec = self.store.codec();
        let slot_value = codec.try_encode(sequence, position)?;
        let data_end = self.store.write_cursor()?.1.max(position);
        let offset = self.ensure_leaf(sequence, data_end)?;
        let (_, slot) = self.slot_of(sequence);
        let cell = self.store.leaf_cell(offset, slot)?;

        if cell.compare_and_set(PackedSlot::UNSET, slot_value) {
            return Ok(());
        }
        for attempt in 0..RETRY_BUDGET {
            let existing = cell.load();
            match codec.decode(existing) {
                Lookup::Found((_, existing_position)) if existing == slot_value => {
                    debug_assert_eq!(existing_position, position);
                    return Ok(());
                }
                Lookup::Found((_, existing_position)) => {
                    return IndexConflictSnafu {
                        sequence,
                        existing: existing_position,
                        position,
                    }
                    .fail();
                }
                // Cleared by a racing compare-and-set that backed out.
                Lookup::NotFound if cell.compare_and_set(PackedSlot::UNSET, slot_value) => {
                    return Ok(());
                }
                Lookup::NotFound | Lookup::Retry => backoff(attempt),
            }
        }
        IndexConflictSnafu {
            sequence,
            existing: cell.load().position,
            position,
        }
        .fail()
    }
}
