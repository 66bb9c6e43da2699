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

//! A persisted, append-only queue over memory-mapped cycle files.
//!
//! Entries are grouped into cycles by wall-clock time ([`RollCycle`]). Each
//! cycle is one file holding the entries and a two-level sparse index that
//! maps in-cycle sequences to byte positions. A global index combines the
//! cycle (high bits) and the sequence (low bits).
//!
//! Writers and readers in different processes share the files through the
//! page cache. Cross-cursor state is published with atomic word stores, so
//! reads take no locks.

pub mod appender;
pub mod builder;
pub mod codec;
pub mod config;
pub mod directory;
pub mod error;
pub mod file;
pub mod index;
pub mod message;
pub mod queue;
pub mod roll_cycle;
pub mod store;
pub mod tailer;
pub mod time;

pub use appender::{Appender, AppenderState};
pub use builder::QueueBuilder;
pub use codec::{Lookup, PackedSlot, SequencePositionCodec, TwoWordCell};
pub use config::{FlushMode, QueueConfig};
pub use directory::{STALE_CLAIM_AGE, StoreDirectory};
pub use error::{QueueError, Result};
pub use index::SparseIndex;
pub use message::{Message, MessageHistory, SourceEntry};
pub use queue::Queue;
pub use roll_cycle::{IndexGeometry, RollCycle};
pub use store::CycleStore;
pub use tailer::{Tailer, TailerState};
pub use time::{SetTimeProvider, SystemTimeProvider, TimeProvider};
