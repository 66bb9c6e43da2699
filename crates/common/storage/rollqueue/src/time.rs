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

use std::{
    fmt,
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use chrono::Utc;

/// Source of wall-clock time consulted once per append to pick the cycle.
pub trait TimeProvider: Send + Sync + fmt::Debug {
    fn current_time_millis(&self) -> i64;
}

/// Reads the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn current_time_millis(&self) -> i64 { Utc::now().timestamp_millis() }
}

/// Manually driven clock, shared between a test and the queue under test.
#[derive(Debug, Default)]
pub struct SetTimeProvider {
    millis: AtomicI64,
}

impl SetTimeProvider {
    #[must_use]
    pub const fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn set_time(&self, millis: i64) { self.millis.store(millis, Ordering::Release); }

    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(delta, Ordering::AcqRel);
    }
}

impl TimeProvider for SetTimeProvider {
    fn current_time_millis(&self) -> i64 { self.millis.load(Ordering::Acquire) }
}
