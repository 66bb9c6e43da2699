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

//! Memory-mapped cycle files using mmap-io.
//!
//! mmap-io guards a read-write mapping with a `parking_lot` read-write lock:
//! every atomic view holds a shared guard for as long as it lives, and
//! `update_region` takes the exclusive side. The lock is not reentrant, so a
//! thread holding a view that then asks for the exclusive side never wakes.
//! All writes here therefore go through atomic views, and the exclusive side
//! is never taken. Shared guards never contend with each other.

use std::{
    ops::Deref,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use mmap_io::MemoryMappedFile;
use snafu::{ResultExt, ensure};

use crate::{
    FlushMode, Result,
    error::{MisalignedSnafu, MmapSnafu},
};

const WORD: u64 = 8;

/// A fixed-size mapping of one cycle file.
///
/// Several `MappedFile`s, in this process or others, may map the same file.
/// They share pages through the OS page cache, so atomic words read through
/// one mapping observe stores made through another.
pub struct MappedFile {
    mmap:     MemoryMappedFile,
    path:     PathBuf,
    size:     u64,
    writable: bool,
}

impl MappedFile {
    /// Create a zero-filled file of `size` bytes and map it read-write.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mmap = MemoryMappedFile::create_rw(&path, size).context(MmapSnafu { path: &path })?;

        Ok(Self {
            mmap,
            path,
            size,
            writable: true,
        })
    }

    /// Map an existing file.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mapped = if writable {
            MemoryMappedFile::open_rw(&path)
        } else {
            MemoryMappedFile::open_ro(&path)
        };
        let mmap = mapped.context(MmapSnafu { path: &path })?;

        let size = mmap.len();

        Ok(Self {
            mmap,
            path,
            size,
            writable,
        })
    }

    /// Store `data` word by word with relaxed ordering. Both `offset` and
    /// `data.len()` must be multiples of 8; the caller publishes the words
    /// with a release store afterwards.
    pub fn write_words(&self, offset: u64, data: &[u8]) -> Result<()> {
        ensure!(
            offset % WORD == 0 && data.len() as u64 % WORD == 0,
            MisalignedSnafu {
                path: &self.path,
                offset,
                len: data.len(),
            }
        );
        for (i, chunk) in data.chunks_exact(WORD as usize).enumerate() {
            let mut word = [0u8; WORD as usize];
            word.copy_from_slice(chunk);
            self.atomic(offset + i as u64 * WORD)?
                .store(u64::from_le_bytes(word), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Read data from the specified offset into the provided buffer.
    #[inline]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.mmap
            .read_into(offset, buf)
            .context(MmapSnafu { path: &self.path })
    }

    /// The 8-byte aligned word at `offset`, shared with every other mapping.
    ///
    /// On a writable map the view holds the mapping's shared guard until it
    /// is dropped.
    #[inline]
    pub fn atomic(&self, offset: u64) -> Result<impl Deref<Target = AtomicU64> + '_> {
        self.mmap
            .atomic_u64(offset)
            .context(MmapSnafu { path: &self.path })
    }

    pub fn size(&self) -> u64 { self.size }

    pub fn path(&self) -> &Path { &self.path }

    pub fn is_writable(&self) -> bool { self.writable }

    /// Flush written data per the flush mode. A no-op for read-only maps.
    pub fn flush(&self, mode: FlushMode) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        match mode {
            // The kernel writes dirty pages back on its own schedule.
            FlushMode::Async => Ok(()),
            FlushMode::Sync => self.mmap.flush().context(MmapSnafu { path: &self.path }),
        }
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mapped_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("test.data");

        let file = MappedFile::create(&path, 4096).unwrap();
        assert_eq!(file.size(), 4096);
        assert!(file.is_writable());
        assert!(path.exists());
    }

    #[test]
    fn test_write_and_read_through_second_mapping() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.data");

        let writer = MappedFile::create(&path, 4096).unwrap();
        writer.write_words(128, b"Test data at offset.....").unwrap();
        writer.flush(FlushMode::Sync).unwrap();

        let reader = MappedFile::open(&path, false).unwrap();
        let mut buf = [0u8; 19];
        reader.read_at(128, &mut buf).unwrap();
        assert_eq!(&buf, b"Test data at offset");
        assert_eq!(reader.size(), 4096);
    }

    #[test]
    fn test_misaligned_words_are_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.data");

        let file = MappedFile::create(&path, 4096).unwrap();
        assert!(matches!(
            file.write_words(100, b"12345678"),
            Err(crate::QueueError::Misaligned { offset: 100, .. })
        ));
        assert!(file.write_words(96, b"odd").is_err());
    }

    #[test]
    fn test_writes_while_holding_a_view() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.data");

        let file = MappedFile::create(&path, 4096).unwrap();
        let held = file.atomic(0).unwrap();
        held.store(1, Ordering::Release);
        file.write_words(8, &7u64.to_le_bytes()).unwrap();
        assert_eq!(file.atomic(8).unwrap().load(Ordering::Acquire), 7);
        assert_eq!(held.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_atomic_words_are_shared() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.data");

        let writer = MappedFile::create(&path, 4096).unwrap();
        let reader = MappedFile::open(&path, false).unwrap();

        writer.atomic(64).unwrap().store(0xdead_beef, Ordering::Release);
        assert_eq!(reader.atomic(64).unwrap().load(Ordering::Acquire), 0xdead_beef);
    }

    #[test]
    fn test_misaligned_atomic_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.data");

        let file = MappedFile::create(&path, 4096).unwrap();
        assert!(file.atomic(3).is_err());
    }
}
