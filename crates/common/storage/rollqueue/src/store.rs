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

//! One cycle's memory-mapped store.
//!
//! ## File Layout
//!
//! ```text
//! 0        ┌──────────────────────────────────────────────┐
//!          │ header (128 bytes, u64 fields)               │
//! 128      ├──────────────────────────────────────────────┤
//!          │ root index array: index_count × u64          │
//! start    ├──────────────────────────────────────────────┤
//!          │ entries, growing up ↓                        │
//!          │                                              │
//!          │ leaf arrays, growing down ↑                  │
//! size     └──────────────────────────────────────────────┘
//! ```
//!
//! Header fields, by offset: magic (0), version (8), cycle (16), roll cycle
//! code (24), source id (32), index count (40), index spacing (48), epoch
//! (56), last-written cell (64, 72), index allocation cursor (80), data start
//! (88). The magic is stored last, so a file whose magic is still zero is
//! being initialized by another process.

use std::{
    hint,
    ops::Deref,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    thread,
};

use bytes::{Bytes, BytesMut};
use snafu::ensure;
use tracing::{debug, warn};

use crate::{
    FlushMode, Result,
    codec::{Lookup, SequencePositionCodec, TwoWordCell},
    error::{CorruptedEntrySnafu, InvalidStoreSnafu, ReadOnlySnafu, StoreFullSnafu},
    file::MappedFile,
    message::{
        ENTRY_CRC_SIZE, ENTRY_HEADER_SIZE, EncodedEntry, EntryHeader, MessageHistory, decode_body,
        entry_checksum, entry_disk_size,
    },
    roll_cycle::{IndexGeometry, RollCycle},
};

/// Size of the fixed store header.
pub const HEADER_SIZE: u64 = 128;

/// Entry bytes every store must have room for beyond its index.
const MIN_DATA_SIZE: u64 = 64 * 1024;

const STORE_MAGIC: u64 = u64::from_le_bytes(*b"RSKQUEUE");
const STORE_VERSION: u64 = 1;

const MAGIC: u64 = 0;
const VERSION: u64 = 8;
const CYCLE: u64 = 16;
const ROLL_CYCLE: u64 = 24;
const SOURCE_ID: u64 = 32;
const INDEX_COUNT: u64 = 40;
const INDEX_SPACING: u64 = 48;
const EPOCH: u64 = 56;
const LAST_WRITTEN_POSITION: u64 = 64;
const LAST_WRITTEN_CHECK: u64 = 72;
const INDEX_LOW_WATER: u64 = 80;
const DATA_START: u64 = 88;

/// Attempts at a contended read before falling back to a scan.
pub(crate) const RETRY_BUDGET: u32 = 64;

/// Smallest cycle file that holds the header, the root array, two leaves and
/// some entry data.
#[must_use]
pub const fn min_block_size(geometry: &IndexGeometry) -> u64 {
    HEADER_SIZE + root_bytes(geometry) + 2 * leaf_bytes(geometry) + MIN_DATA_SIZE
}

pub(crate) const fn root_bytes(geometry: &IndexGeometry) -> u64 {
    geometry.index_count() as u64 * 8
}

pub(crate) const fn leaf_bytes(geometry: &IndexGeometry) -> u64 {
    geometry.index_count() as u64 * 16
}

/// Everything a store header records about the queue that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoreSettings {
    pub roll_cycle: RollCycle,
    pub geometry:   IndexGeometry,
    pub source_id:  u32,
    pub epoch:      i64,
    pub block_size: u64,
    pub flush_mode: FlushMode,
}

/// A data entry located by a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryRef {
    pub sequence:    u64,
    pub position:    u64,
    pub body_len:    u32,
    pub has_history: bool,
}

impl EntryRef {
    pub(crate) const fn end(&self) -> u64 {
        self.position + entry_disk_size(self.body_len as u64)
    }
}

/// The mapped file of a single cycle.
pub struct CycleStore {
    file:       MappedFile,
    cycle:      u64,
    source_id:  u32,
    geometry:   IndexGeometry,
    codec:      SequencePositionCodec,
    data_start: u64,
    flush_mode: FlushMode,
}

impl CycleStore {
    /// Create and initialize a store file of `settings.block_size` bytes.
    pub(crate) fn create(path: &Path, cycle: u64, settings: &StoreSettings) -> Result<Self> {
        let file = MappedFile::create(path, settings.block_size)?;
        let geometry = settings.geometry;
        let data_start = HEADER_SIZE + root_bytes(&geometry);

        file.atomic(VERSION)?.store(STORE_VERSION, Ordering::Relaxed);
        file.atomic(CYCLE)?.store(cycle, Ordering::Relaxed);
        file.atomic(ROLL_CYCLE)?
            .store(settings.roll_cycle.code(), Ordering::Relaxed);
        file.atomic(SOURCE_ID)?
            .store(u64::from(settings.source_id), Ordering::Relaxed);
        file.atomic(INDEX_COUNT)?
            .store(u64::from(geometry.index_count()), Ordering::Relaxed);
        file.atomic(INDEX_SPACING)?
            .store(u64::from(geometry.index_spacing()), Ordering::Relaxed);
        file.atomic(EPOCH)?
            .store(settings.epoch as u64, Ordering::Relaxed);
        file.atomic(INDEX_LOW_WATER)?
            .store(settings.block_size, Ordering::Relaxed);
        file.atomic(DATA_START)?.store(data_start, Ordering::Relaxed);
        file.atomic(MAGIC)?.store(STORE_MAGIC, Ordering::Release);
        file.flush(settings.flush_mode)?;

        debug!(path = %path.display(), cycle, "Created cycle store");

        Ok(Self {
            file,
            cycle,
            source_id: settings.source_id,
            geometry,
            codec: SequencePositionCodec::new(&geometry),
            data_start,
            flush_mode: settings.flush_mode,
        })
    }

    /// Map an existing store file and check its header against `settings`.
    ///
    /// Returns `None` while another process is still initializing the file.
    pub(crate) fn open(
        path: &Path,
        cycle: u64,
        settings: &StoreSettings,
        writable: bool,
    ) -> Result<Option<Self>> {
        let file = MappedFile::open(path, writable)?;
        let invalid = |reason: String| {
            InvalidStoreSnafu {
                path: path.to_path_buf(),
                reason,
            }
            .fail()
        };

        if file.size() < HEADER_SIZE {
            return invalid(format!("file is only {} bytes", file.size()));
        }
        match file.atomic(MAGIC)?.load(Ordering::Acquire) {
            0 => return Ok(None),
            STORE_MAGIC => {}
            other => return invalid(format!("bad magic {other:#x}")),
        }

        let field = |offset: u64| -> Result<u64> { Ok(file.atomic(offset)?.load(Ordering::Relaxed)) };

        let version = field(VERSION)?;
        if version != STORE_VERSION {
            return invalid(format!("unsupported version {version}"));
        }
        let stored_cycle = field(CYCLE)?;
        if stored_cycle != cycle {
            return invalid(format!("holds cycle {stored_cycle}, expected {cycle}"));
        }
        let roll_code = field(ROLL_CYCLE)?;
        if roll_code != settings.roll_cycle.code() {
            return invalid(format!(
                "written with roll cycle {:?}, queue uses {}",
                RollCycle::from_code(roll_code),
                settings.roll_cycle
            ));
        }
        let geometry = settings.geometry;
        let (count, spacing) = (field(INDEX_COUNT)?, field(INDEX_SPACING)?);
        if count != u64::from(geometry.index_count()) || spacing != u64::from(geometry.index_spacing())
        {
            return invalid(format!(
                "index geometry {count}x{spacing} differs from configured {}x{}",
                geometry.index_count(),
                geometry.index_spacing()
            ));
        }
        let epoch = field(EPOCH)? as i64;
        if epoch != settings.epoch {
            return invalid(format!("epoch {epoch} differs from configured {}", settings.epoch));
        }
        let source_id = u32::try_from(field(SOURCE_ID)?).unwrap_or(u32::MAX);
        if writable && source_id != settings.source_id {
            return invalid(format!(
                "written by source {source_id}, queue is source {}",
                settings.source_id
            ));
        }
        let data_start = field(DATA_START)?;
        let low_water = field(INDEX_LOW_WATER)?;
        if data_start != HEADER_SIZE + root_bytes(&geometry)
            || low_water > file.size()
            || low_water < data_start
        {
            return invalid(format!(
                "inconsistent layout: data start {data_start}, index low water {low_water}, size {}",
                file.size()
            ));
        }

        debug!(path = %path.display(), cycle, writable, "Opened cycle store");

        Ok(Some(Self {
            file,
            cycle,
            source_id,
            geometry,
            codec: SequencePositionCodec::new(&geometry),
            data_start,
            flush_mode: settings.flush_mode,
        }))
    }

    pub fn cycle(&self) -> u64 { self.cycle }

    /// Source id recorded when the store was created.
    pub fn source_id(&self) -> u32 { self.source_id }

    pub fn geometry(&self) -> &IndexGeometry { &self.geometry }

    pub fn codec(&self) -> &SequencePositionCodec { &self.codec }

    pub fn path(&self) -> &Path { self.file.path() }

    pub fn is_writable(&self) -> bool { self.file.is_writable() }

    /// First byte of the entry region.
    pub fn data_start(&self) -> u64 { self.data_start }

    pub fn size(&self) -> u64 { self.file.size() }

    fn ensure_writable(&self) -> Result<()> {
        ensure!(
            self.file.is_writable(),
            ReadOnlySnafu {
                path: PathBuf::from(self.file.path()),
            }
        );
        Ok(())
    }

    pub(crate) fn last_written_cell(
        &self,
    ) -> Result<TwoWordCell<impl Deref<Target = AtomicU64> + '_>> {
        Ok(TwoWordCell::new(
            self.file.atomic(LAST_WRITTEN_POSITION)?,
            self.file.atomic(LAST_WRITTEN_CHECK)?,
        ))
    }

    /// `(sequence, position)` of the newest entry, as published.
    pub fn last_written(&self) -> Result<Lookup<(u64, u64)>> {
        Ok(self.codec.decode(self.last_written_cell()?.load()))
    }

    /// Like [`last_written`](Self::last_written), re-asking while the cell is
    /// being replaced and scanning the entry region if it never settles.
    pub(crate) fn last_written_settled(&self) -> Result<Option<(u64, u64)>> {
        for attempt in 0..RETRY_BUDGET {
            match self.last_written()? {
                Lookup::Found(found) => return Ok(Some(found)),
                Lookup::NotFound => return Ok(None),
                Lookup::Retry => backoff(attempt),
            }
        }
        warn!(
            path = %self.path().display(),
            "Last-written cell did not settle, scanning entries"
        );
        let entries = self.scan_from(0, self.data_start)?.collect::<Result<Vec<_>>>()?;
        Ok(entries.last().map(|entry| (entry.sequence, entry.position)))
    }

    /// Number of entries published in this cycle.
    pub fn entry_count(&self) -> Result<u64> {
        Ok(self
            .last_written_settled()?
            .map_or(0, |(sequence, _)| sequence + 1))
    }

    /// `(next sequence, next write position)` after the newest entry.
    pub(crate) fn write_cursor(&self) -> Result<(u64, u64)> {
        match self.last_written_settled()? {
            None => Ok((0, self.data_start)),
            Some((sequence, position)) => {
                let header = self.read_header(position)?;
                Ok((sequence + 1, position + header.disk_size()))
            }
        }
    }

    /// Lowest byte used by index leaves. Entries must end at or below it.
    pub(crate) fn index_low_water(&self) -> Result<impl Deref<Target = AtomicU64> + '_> {
        self.file.atomic(INDEX_LOW_WATER)
    }

    pub(crate) fn root_slot(&self, leaf: u64) -> Result<impl Deref<Target = AtomicU64> + '_> {
        self.file.atomic(HEADER_SIZE + leaf * 8)
    }

    /// Word pair `slot` of the leaf starting at `leaf_offset`.
    pub(crate) fn leaf_cell(
        &self,
        leaf_offset: u64,
        slot: u64,
    ) -> Result<TwoWordCell<impl Deref<Target = AtomicU64> + '_>> {
        let offset = leaf_offset + slot * 16;
        Ok(TwoWordCell::new(
            self.file.atomic(offset)?,
            self.file.atomic(offset + 8)?,
        ))
    }

    /// Carve `leaf_bytes` off the bottom of the leaf area, keeping it above
    /// `data_end`. Returns the new leaf's offset.
    pub(crate) fn allocate_leaf_space(&self, data_end: u64) -> Result<u64> {
        self.ensure_writable()?;
        let cursor = self.index_low_water()?;
        let needed = leaf_bytes(&self.geometry);
        let mut low = cursor.load(Ordering::Acquire);
        loop {
            let new_low = low
                .checked_sub(needed)
                .filter(|new_low| *new_low >= data_end);
            let Some(new_low) = new_low else {
                return StoreFullSnafu {
                    cycle: self.cycle,
                    position: data_end,
                    needed,
                }
                .fail();
            };
            match cursor.compare_exchange(low, new_low, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(new_low),
                Err(current) => low = current,
            }
        }
    }

    /// Whether a leaf offset read from the root array points into the leaf
    /// area.
    pub(crate) fn is_valid_leaf(&self, leaf_offset: u64) -> bool {
        leaf_offset % 8 == 0
            && leaf_offset >= self.data_start
            && leaf_offset
                .checked_add(leaf_bytes(&self.geometry))
                .is_some_and(|end| end <= self.file.size())
    }

    /// Decode the header word at `position`. Positions that reach into the
    /// leaf area read as empty.
    pub(crate) fn read_header(&self, position: u64) -> Result<EntryHeader> {
        let limit = self.index_low_water()?.load(Ordering::Acquire);
        if position < self.data_start || position + ENTRY_HEADER_SIZE > limit {
            return Ok(EntryHeader::Empty);
        }
        let word = self.file.atomic(position)?.load(Ordering::Acquire);
        match EntryHeader::decode(word) {
            Some(header) if position + header.disk_size() <= limit => Ok(header),
            Some(_) => CorruptedEntrySnafu {
                cycle: self.cycle,
                position,
                reason: format!("entry header {word:#x} runs into the index area"),
            }
            .fail(),
            None => CorruptedEntrySnafu {
                cycle: self.cycle,
                position,
                reason: format!("unrecognized entry header {word:#x}"),
            }
            .fail(),
        }
    }

    /// Read and verify the body of a data entry.
    pub(crate) fn read_body(&self, entry: &EntryRef) -> Result<(MessageHistory, Bytes)> {
        let body_len = u64::from(entry.body_len);
        let mut buf = BytesMut::zeroed((body_len + ENTRY_CRC_SIZE) as usize);
        self.file
            .read_at(entry.position + ENTRY_HEADER_SIZE, &mut buf)?;

        let crc_bytes = buf.split_off(body_len as usize);
        let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let body = buf.freeze();
        let header = EntryHeader::data_word(entry.body_len, entry.has_history);
        ensure!(
            entry_checksum(header, &body) == stored_crc,
            CorruptedEntrySnafu {
                cycle:    self.cycle,
                position: entry.position,
                reason:   "CRC mismatch",
            }
        );

        decode_body(body, entry.has_history).map_or_else(
            || {
                CorruptedEntrySnafu {
                    cycle:    self.cycle,
                    position: entry.position,
                    reason:   "truncated message history",
                }
                .fail()
            },
            Ok,
        )
    }

    /// Walk data entries starting at `position`, which holds `sequence`.
    /// Stops at the first empty slot or end-of-cycle marker.
    pub(crate) fn scan_from(&self, sequence: u64, position: u64) -> Result<EntryScan<'_>> {
        Ok(EntryScan {
            store: self,
            sequence,
            position,
            done: false,
        })
    }

    /// Copy `entry` to `position` and publish it as `sequence`.
    ///
    /// The body lands first, then the header word, then the last-written
    /// cell, so no reader observes a partial entry.
    pub(crate) fn write_entry(&self, sequence: u64, position: u64, entry: &EncodedEntry) -> Result<()> {
        self.ensure_writable()?;
        let slot = self.codec.try_encode(sequence, position)?;
        let limit = self.index_low_water()?.load(Ordering::Acquire);
        ensure!(
            position + entry.disk_size() <= limit,
            StoreFullSnafu {
                cycle: self.cycle,
                position,
                needed: entry.disk_size(),
            }
        );

        self.file.write_words(position + ENTRY_HEADER_SIZE, &entry.body)?;
        self.file.atomic(position)?.store(entry.header, Ordering::Release);
        self.last_written_cell()?.publish(slot);
        Ok(())
    }

    /// Mark the end of this cycle at `position`. Skipped when the entry
    /// region has no room left; readers treat that as the end as well.
    pub(crate) fn write_end_of_cycle(&self, position: u64) -> Result<()> {
        self.ensure_writable()?;
        let limit = self.index_low_water()?.load(Ordering::Acquire);
        if position + ENTRY_HEADER_SIZE > limit {
            debug!(cycle = self.cycle, position, "No room for end-of-cycle marker");
            return Ok(());
        }
        self.file
            .atomic(position)?
            .store(EntryHeader::end_of_cycle_word(), Ordering::Release);
        Ok(())
    }

    /// Re-publish the last-written cell if entries exist beyond it, as left
    /// behind by a writer that stopped between the two stores.
    pub(crate) fn recover_last_written(&self) -> Result<()> {
        self.ensure_writable()?;
        let published = self.last_written_settled()?;
        let (sequence, position) = published.unwrap_or((0, self.data_start));
        let mut newest = None;
        for entry in self.scan_from(sequence, position)? {
            newest = Some(entry?);
        }
        let Some(entry) = newest else {
            return Ok(());
        };
        if published != Some((entry.sequence, entry.position)) {
            warn!(
                cycle = self.cycle,
                sequence = entry.sequence,
                position = entry.position,
                "Recovered unpublished entries"
            );
            self.last_written_cell()?
                .publish(self.codec.try_encode(entry.sequence, entry.position)?);
        }
        Ok(())
    }

    pub(crate) fn flush(&self) -> Result<()> { self.file.flush(self.flush_mode) }
}

impl std::fmt::Debug for CycleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleStore")
            .field("path", &self.file.path())
            .field("cycle", &self.cycle)
            .field("source_id", &self.source_id)
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

impl Drop for CycleStore {
    fn drop(&mut self) {
        if self.file.is_writable() {
            if let Err(e) = self.file.flush(FlushMode::Sync) {
                warn!(path = %self.file.path().display(), error = %e, "Failed to flush cycle store on release");
            }
        }
        debug!(path = %self.file.path().display(), cycle = self.cycle, "Released cycle store");
    }
}

/// Forward walk over the data entries of a store.
pub(crate) struct EntryScan<'a> {
    store:    &'a CycleStore,
    sequence: u64,
    position: u64,
    done:     bool,
}

impl Iterator for EntryScan<'_> {
    type Item = Result<EntryRef>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.store.read_header(self.position) {
            Ok(EntryHeader::Data {
                body_len,
                has_history,
            }) => {
                let entry = EntryRef {
                    sequence: self.sequence,
                    position: self.position,
                    body_len,
                    has_history,
                };
                self.sequence += 1;
                self.position = entry.end();
                Some(Ok(entry))
            }
            Ok(EntryHeader::Empty | EntryHeader::EndOfCycle) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Spin, then yield, while a concurrent writer finishes.
pub(crate) fn backoff(attempt: u32) {
    if attempt < RETRY_BUDGET / 2 {
        hint::spin_loop();
    } else {
        thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::PackedSlot, config::TEST_BLOCK_SIZE};

    fn settings(roll_cycle: RollCycle) -> StoreSettings {
        StoreSettings {
            roll_cycle,
            geometry: roll_cycle.default_geometry(),
            source_id: 7,
            epoch: 0,
            block_size: TEST_BLOCK_SIZE,
            flush_mode: FlushMode::Async,
        }
    }

    #[test]
    fn test_create_then_open() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("20260101.data");
        let settings = settings(RollCycle::Daily);

        let created = CycleStore::create(&path, 42, &settings).unwrap();
        assert_eq!(created.entry_count().unwrap(), 0);
        assert_eq!(created.write_cursor().unwrap(), (0, created.data_start()));

        let opened = CycleStore::open(&path, 42, &settings, false)
            .unwrap()
            .unwrap();
        assert_eq!(opened.source_id(), 7);
        assert_eq!(opened.data_start(), created.data_start());
    }

    #[test]
    fn test_open_rejects_mismatched_header() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("20260101.data");
        let settings = settings(RollCycle::Daily);
        drop(CycleStore::create(&path, 42, &settings).unwrap());

        assert!(CycleStore::open(&path, 43, &settings, false).is_err());

        let hourly = StoreSettings {
            roll_cycle: RollCycle::Hourly,
            ..settings
        };
        let err = CycleStore::open(&path, 42, &hourly, false).unwrap_err();
        assert!(err.is_fatal());

        let other_source = StoreSettings {
            source_id: 8,
            ..settings
        };
        assert!(CycleStore::open(&path, 42, &other_source, true).is_err());
        assert!(CycleStore::open(&path, 42, &other_source, false).is_ok());
    }

    #[test]
    fn test_write_and_scan_entries() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("20260101.data");
        let store = CycleStore::create(&path, 1, &settings(RollCycle::Daily)).unwrap();

        let mut history = MessageHistory::new();
        history.push(3, 99);
        for (sequence, payload) in [b"first".as_slice(), b"second", b"third"].iter().enumerate() {
            let (next, position) = store.write_cursor().unwrap();
            assert_eq!(next, sequence as u64);
            let entry = EncodedEntry::new(Some(&history), payload).unwrap();
            store.write_entry(next, position, &entry).unwrap();
        }
        store.write_end_of_cycle(store.write_cursor().unwrap().1).unwrap();

        let entries: Vec<_> = store
            .scan_from(0, store.data_start())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(store.entry_count().unwrap(), 3);

        let (decoded, payload) = store.read_body(&entries[1]).unwrap();
        assert_eq!(decoded, history);
        assert_eq!(payload.as_ref(), b"second");
    }

    #[test]
    fn test_corrupted_body_is_detected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("20260101.data");
        let store = CycleStore::create(&path, 1, &settings(RollCycle::Daily)).unwrap();

        let entry = EncodedEntry::new(None, b"payload").unwrap();
        store.write_entry(0, store.data_start(), &entry).unwrap();
        store
            .file
            .atomic(store.data_start() + ENTRY_HEADER_SIZE)
            .unwrap()
            .fetch_xor(1, Ordering::Relaxed);

        let entry = store
            .scan_from(0, store.data_start())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let err = store.read_body(&entry).unwrap_err();
        assert!(matches!(err, crate::QueueError::CorruptedEntry { .. }));
    }

    #[test]
    fn test_recover_unpublished_entry() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("20260101.data");
        let store = CycleStore::create(&path, 1, &settings(RollCycle::Daily)).unwrap();

        store
            .write_entry(0, store.data_start(), &EncodedEntry::new(None, b"a").unwrap())
            .unwrap();
        let (_, position) = store.write_cursor().unwrap();
        // Header published, last-written cell not yet advanced.
        let entry = EncodedEntry::new(None, b"b").unwrap();
        store.file.write_words(position + ENTRY_HEADER_SIZE, &entry.body).unwrap();
        store.file.atomic(position).unwrap().store(entry.header, Ordering::Release);
        assert_eq!(store.entry_count().unwrap(), 1);

        store.recover_last_written().unwrap();
        assert_eq!(store.entry_count().unwrap(), 2);
        assert_eq!(store.last_written().unwrap(), Lookup::Found((1, position)));
    }

    #[test]
    fn test_cells_can_be_held_across_writes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("20260101.data");
        let store = CycleStore::create(&path, 1, &settings(RollCycle::Daily)).unwrap();

        let cell = store.last_written_cell().unwrap();
        let low_water = store.index_low_water().unwrap();
        let mut last = 0;
        for payload in [b"a", b"b"] {
            let (sequence, position) = store.write_cursor().unwrap();
            store
                .write_entry(sequence, position, &EncodedEntry::new(None, payload).unwrap())
                .unwrap();
            last = position;
        }
        assert_eq!(store.codec().decode(cell.load()), Lookup::Found((1, last)));
        assert_eq!(low_water.load(Ordering::Acquire), TEST_BLOCK_SIZE);
    }

    #[test]
    fn test_unsettled_cell_falls_back_to_scan() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("20260101.data");
        let store = CycleStore::create(&path, 1, &settings(RollCycle::Daily)).unwrap();
        for payload in [b"one", b"two", b"six"] {
            let (sequence, position) = store.write_cursor().unwrap();
            store
                .write_entry(sequence, position, &EncodedEntry::new(None, payload).unwrap())
                .unwrap();
        }
        let (_, end) = store.write_cursor().unwrap();

        store.last_written_cell().unwrap().publish(PackedSlot::BUSY);
        assert_eq!(store.last_written().unwrap(), Lookup::Retry);
        assert_eq!(store.entry_count().unwrap(), 3);

        // A damaged header past the last entry fails the scan.
        store.file.atomic(end).unwrap().store(0xdead, Ordering::Release);
        assert!(matches!(
            store.entry_count(),
            Err(crate::QueueError::CorruptedEntry { .. })
        ));
    }

    #[test]
    fn test_leaf_space_stops_at_data() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("20260101.data");
        let settings = StoreSettings {
            block_size: min_block_size(&RollCycle::Daily.default_geometry()),
            ..settings(RollCycle::Daily)
        };
        let store = CycleStore::create(&path, 1, &settings).unwrap();
        let data_end = store.data_start() + MIN_DATA_SIZE;

        let first = store.allocate_leaf_space(data_end).unwrap();
        let second = store.allocate_leaf_space(data_end).unwrap();
        assert_eq!(first - second, leaf_bytes(store.geometry()));
        assert!(store.is_valid_leaf(second));
        assert!(matches!(
            store.allocate_leaf_space(data_end),
            Err(crate::QueueError::StoreFull { .. })
        ));
    }
}
