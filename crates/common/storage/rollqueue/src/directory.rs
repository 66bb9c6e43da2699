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

//! Cycle files on disk and the table of mapped stores.
//!
//! Files live flat under the base path as `{stem}.data`, where the stem is
//! the roll cycle's date format for the cycle's start relative to the epoch,
//! e.g. `20260114-1305.data`. Mapped stores are shared through a table of weak
//! handles: every cursor holding a cycle holds an `Arc<CycleStore>`, and the
//! mapping is released when the last one drops.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    Result,
    roll_cycle::{IndexGeometry, RollCycle},
    store::{CycleStore, HEADER_SIZE, StoreSettings},
};

/// File extension of cycle files.
pub const CYCLE_FILE_SUFFIX: &str = "data";

/// Age after which a claimed but uninitialized file is taken over by a
/// writer.
pub const STALE_CLAIM_AGE: Duration = Duration::from_secs(10);

/// Locates, creates and shares the cycle stores of one queue.
#[derive(Debug)]
pub struct StoreDirectory {
    base_path: PathBuf,
    settings:  StoreSettings,
    read_only: bool,
    stores:    Mutex<HashMap<u64, Weak<CycleStore>>>,
}

impl StoreDirectory {
    pub(crate) fn new(base_path: PathBuf, settings: StoreSettings, read_only: bool) -> Self {
        Self {
            base_path,
            settings,
            read_only,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_path(&self) -> &Path { &self.base_path }

    pub fn is_read_only(&self) -> bool { self.read_only }

    pub fn roll_cycle(&self) -> RollCycle { self.settings.roll_cycle }

    pub fn geometry(&self) -> &IndexGeometry { &self.settings.geometry }

    pub(crate) fn settings(&self) -> &StoreSettings { &self.settings }

    /// Path of the file holding `cycle`.
    #[must_use]
    pub fn path_for(&self, cycle: u64) -> PathBuf {
        let stem = self.settings.roll_cycle.file_stem(cycle);
        self.base_path.join(format!("{stem}.{CYCLE_FILE_SUFFIX}"))
    }

    /// Cycles with a file on disk, ascending. A missing base directory is an
    /// empty queue.
    pub fn cycles(&self) -> Result<Vec<u64>> {
        let entries = match std::fs::read_dir(&self.base_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut cycles = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some(CYCLE_FILE_SUFFIX) {
                continue;
            }
            let cycle = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|stem| self.settings.roll_cycle.parse_file_stem(stem));
            if let Some(cycle) = cycle {
                cycles.push(cycle);
            }
        }
        cycles.sort_unstable();
        Ok(cycles)
    }

    pub fn first_cycle(&self) -> Result<Option<u64>> { Ok(self.cycles()?.first().copied()) }

    pub fn last_cycle(&self) -> Result<Option<u64>> { Ok(self.cycles()?.last().copied()) }

    /// Earliest cycle on disk strictly after `cycle`.
    pub fn next_cycle_after(&self, cycle: u64) -> Result<Option<u64>> {
        Ok(self.cycles()?.into_iter().find(|c| *c > cycle))
    }

    /// Shared handle to `cycle`'s store.
    ///
    /// With `create` set and the directory writable, a missing file is
    /// created, and a file another writer claimed but left uninitialized for
    /// [`STALE_CLAIM_AGE`] is re-initialized. Otherwise a missing or
    /// uninitialized file yields `None`.
    pub fn acquire(&self, cycle: u64, create: bool) -> Result<Option<Arc<CycleStore>>> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(&cycle).and_then(Weak::upgrade) {
            return Ok(Some(store));
        }
        stores.retain(|_, weak| weak.strong_count() > 0);

        let path = self.path_for(cycle);
        let create = create && !self.read_only;
        let store = if self.claim(&path, create)? {
            Some(CycleStore::create(&path, cycle, &self.settings)?)
        } else {
            match file_state(&path)? {
                FileState::Missing => None,
                FileState::Initialized => {
                    CycleStore::open(&path, cycle, &self.settings, !self.read_only)?
                }
                FileState::Claimed { age } if create && age >= STALE_CLAIM_AGE => {
                    warn!(
                        cycle,
                        path = %path.display(),
                        age_ms = age.as_millis(),
                        "Taking over abandoned cycle file"
                    );
                    Some(CycleStore::create(&path, cycle, &self.settings)?)
                }
                FileState::Claimed { .. } => None,
            }
        };

        let Some(store) = store else {
            return Ok(None);
        };
        debug!(cycle, path = %path.display(), "Acquired cycle store");
        let store = Arc::new(store);
        stores.insert(cycle, Arc::downgrade(&store));
        Ok(Some(store))
    }

    /// Atomically create an empty file at `path`. False if it already exists
    /// or creation is not wanted.
    fn claim(&self, path: &Path, create: bool) -> Result<bool> {
        if !create {
            return Ok(false);
        }
        std::fs::create_dir_all(&self.base_path)?;
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of stores currently mapped by live handles.
    pub fn open_store_count(&self) -> usize {
        self.stores
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Missing,
    /// Exists, but its creator has not sized it or stamped the magic yet.
    Claimed {
        age: Duration,
    },
    Initialized,
}

fn file_state(path: &Path) -> Result<FileState> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileState::Missing),
        Err(e) => return Err(e.into()),
    };
    let meta = file.metadata()?;
    let mut magic = [0u8; 8];
    if meta.len() >= HEADER_SIZE && file.read_exact(&mut magic).is_ok() && magic != [0; 8] {
        return Ok(FileState::Initialized);
    }
    let age = meta
        .modified()
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .unwrap_or_default();
    Ok(FileState::Claimed { age })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FlushMode, config::TEST_BLOCK_SIZE};

    fn directory(base: &Path, roll_cycle: RollCycle, read_only: bool) -> StoreDirectory {
        let settings = StoreSettings {
            roll_cycle,
            geometry: roll_cycle.default_geometry(),
            source_id: 1,
            epoch: 0,
            block_size: TEST_BLOCK_SIZE,
            flush_mode: FlushMode::Async,
        };
        StoreDirectory::new(base.to_path_buf(), settings, read_only)
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = directory(&temp_dir.path().join("absent"), RollCycle::Daily, true);
        assert!(dir.cycles().unwrap().is_empty());
        assert!(dir.acquire(5, true).unwrap().is_none());
        assert!(!temp_dir.path().join("absent").exists());
    }

    #[test]
    fn test_acquire_shares_and_releases() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = directory(temp_dir.path(), RollCycle::Daily, false);

        let first = dir.acquire(20_000, true).unwrap().unwrap();
        let second = dir.acquire(20_000, false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dir.open_store_count(), 1);

        drop(first);
        assert_eq!(dir.open_store_count(), 1);
        drop(second);
        assert_eq!(dir.open_store_count(), 0);

        // Reopened from disk after the last release.
        assert!(dir.acquire(20_000, false).unwrap().is_some());
    }

    #[test]
    fn test_cycles_are_listed_in_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = directory(temp_dir.path(), RollCycle::Minutely, false);
        for cycle in [29_000_003, 29_000_001, 29_000_002] {
            dir.acquire(cycle, true).unwrap().unwrap();
        }
        std::fs::write(temp_dir.path().join("notes.txt"), b"ignored").unwrap();
        std::fs::write(temp_dir.path().join("garbage.data"), b"ignored").unwrap();

        assert_eq!(dir.cycles().unwrap(), vec![29_000_001, 29_000_002, 29_000_003]);
        assert_eq!(dir.first_cycle().unwrap(), Some(29_000_001));
        assert_eq!(dir.last_cycle().unwrap(), Some(29_000_003));
        assert_eq!(dir.next_cycle_after(29_000_001).unwrap(), Some(29_000_002));
        assert_eq!(dir.next_cycle_after(29_000_003).unwrap(), None);
    }

    #[test]
    fn test_read_only_never_creates() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = directory(temp_dir.path(), RollCycle::Daily, true);
        assert!(dir.acquire(20_000, true).unwrap().is_none());
        assert!(dir.cycles().unwrap().is_empty());
    }

    #[test]
    fn test_abandoned_claim_is_taken_over_once_stale() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = directory(temp_dir.path(), RollCycle::Daily, false);
        let path = dir.path_for(20_000);
        let claim = File::create(&path).unwrap();

        assert!(matches!(file_state(&path).unwrap(), FileState::Claimed { .. }));
        assert!(dir.acquire(20_000, true).unwrap().is_none());
        assert!(dir.acquire(20_000, false).unwrap().is_none());

        claim
            .set_modified(std::time::SystemTime::now() - 2 * STALE_CLAIM_AGE)
            .unwrap();
        drop(claim);
        // Readers never take over.
        assert!(dir.acquire(20_000, false).unwrap().is_none());

        let store = dir.acquire(20_000, true).unwrap().unwrap();
        assert_eq!(store.entry_count().unwrap(), 0);
        assert_eq!(file_state(&path).unwrap(), FileState::Initialized);
    }

    #[test]
    fn test_path_uses_roll_cycle_format() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = directory(temp_dir.path(), RollCycle::Hourly, false);
        // 2026-01-14T13:00:00Z
        let cycle = RollCycle::Hourly.cycle_for(1_768_395_600_000, 0);
        assert_eq!(dir.path_for(cycle), temp_dir.path().join("20260114-13.data"));
    }
}
