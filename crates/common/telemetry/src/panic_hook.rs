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

//! Panic logging and optional `parking_lot` deadlock detection.

#[cfg(feature = "deadlock_detection")]
use std::time::Duration;
use std::{
    panic,
    sync::atomic::{AtomicU64, Ordering},
};

use backtrace::Backtrace;

static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

/// Panics observed since [`set_panic_hook`] was installed.
pub fn panic_count() -> u64 { PANIC_COUNT.load(Ordering::Relaxed) }

/// Log every panic as an `error!` event with its location and backtrace,
/// then run the previously installed hook.
///
/// With the `deadlock_detection` feature, also starts a thread that reports
/// `parking_lot` deadlocks every five seconds.
pub fn set_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic| {
        let count = PANIC_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        let backtrace = format!("{:?}", Backtrace::new());
        match panic.location() {
            Some(location) => tracing::error!(
                message = %panic,
                backtrace = %backtrace,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.count = count,
            ),
            None => tracing::error!(message = %panic, backtrace = %backtrace, panic.count = count),
        }
        default_hook(panic);
    }));

    #[cfg(feature = "deadlock_detection")]
    spawn_deadlock_watchdog();
}

#[cfg(feature = "deadlock_detection")]
fn spawn_deadlock_watchdog() {
    let spawned = std::thread::Builder::new()
        .name("deadlock-watchdog".to_string())
        .spawn(|| {
            loop {
                std::thread::sleep(Duration::from_secs(5));
                for (i, threads) in parking_lot::deadlock::check_deadlock().iter().enumerate() {
                    for t in threads {
                        tracing::warn!(
                            cycle = i,
                            thread_id = ?t.thread_id(),
                            backtrace = ?t.backtrace(),
                            "Deadlock detected"
                        );
                    }
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "Failed to start deadlock watchdog");
    }
}
