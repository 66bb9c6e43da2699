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
    env,
    io::IsTerminal,
    sync::{Mutex, Once},
};

use bon::Builder;
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter,
    layer::{Layered, SubscriberExt},
    reload,
};

/// Deserializes a string value, using `Default::default()` if the string is
/// empty.
///
/// Lets configuration files write `log_format = ""` to mean "the default".
///
/// # Errors
/// Returns an error if the non-empty string is not a valid `T`.
pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        Ok(T::default())
    } else {
        T::deserialize(de::value::StrDeserializer::new(&s)).map_err(|e: de::value::Error| {
            de::Error::custom(format!("invalid value, expect empty string, err: {e}"))
        })
    }
}

/// Default directory for log files when file logging is enabled.
pub const DEFAULT_LOGGING_DIR: &str = "logs";

/// Handle for changing the level filter at runtime.
///
/// Set by [`init_global_logging`]; `None` before that.
pub static RELOAD_HANDLE: OnceCell<reload::Handle<filter::Targets, Registry>> = OnceCell::new();

/// Configuration for the logging system.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for hourly-rotated log files. Empty disables file logging.
    #[default = ""]
    #[builder(default)]
    pub dir: String,

    /// Level filter such as `"info"` or `"info,rollqueue=debug"`. Falls back
    /// to `RUST_LOG`, then `"info"`.
    pub level: Option<String>,

    #[serde(default, deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// Rotated files kept per log kind. 720 is thirty days of hourly files.
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,
}

/// Log line format.
#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per line, with span context.
    Json,

    /// Human-readable text.
    #[default]
    Text,
}

/// Stdout-only text logging with default options.
///
/// Keep the returned guards alive for as long as logs should be flushed.
#[must_use]
pub fn init_tracing_subscriber(app_name: &str) -> Vec<WorkerGuard> {
    init_global_logging(app_name, &LoggingOptions::default())
}

/// Logging for tests, safe to call from every test.
///
/// Writes to `UNITTEST_LOG_DIR` (default `/tmp/__unittest_logs`) at
/// `UNITTEST_LOG_LEVEL` (default `debug`). Only the first call does anything.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let dir =
            env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_string());
        let level = env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let opts = LoggingOptions {
            dir: dir.clone(),
            level: Some(level),
            ..Default::default()
        };
        let guards = init_global_logging("unittest", &opts);
        if let Ok(mut g) = GLOBAL_UT_LOG_GUARD.lock() {
            *g = Some(guards);
        }

        tracing::info!("logs dir = {}", dir);
    });
}

/// Keeps the unit test writer threads alive for the whole test binary.
static GLOBAL_UT_LOG_GUARD: Lazy<Mutex<Option<Vec<WorkerGuard>>>> = Lazy::new(|| Mutex::new(None));

const DEFAULT_LOG_TARGETS: &str = "info";

type FilteredRegistry = Layered<reload::Layer<filter::Targets, Registry>, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

fn fmt_layer<W>(writer: W, format: LogFormat, ansi: bool) -> BoxedLayer
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::Layer::new()
            .json()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::Layer::new()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
    }
}

fn rolling_appender(prefix: &str, opts: &LoggingOptions) -> RollingFileAppender {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(opts.max_log_files)
        .build(&opts.dir)
        .unwrap_or_else(|e| {
            panic!(
                "initializing rolling file appender at {} failed: {}",
                &opts.dir, e
            )
        })
}

/// Install the global subscriber.
///
/// Layers, each optional:
/// - stdout, when `append_stdout` is set
/// - `{app_name}.*` files under `dir`, rotated hourly
/// - `{app_name}-err.*` files holding only errors
///
/// Only the first call installs anything; later calls return no guards.
/// Drop the returned guards to flush and stop the writer threads.
///
/// # Panics
///
/// When the log directory cannot be created or the level string is invalid.
pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Vec<WorkerGuard> {
    static START: Once = Once::new();
    let mut guards = vec![];

    START.call_once(|| {
        // Another logger may already own the `log` facade.
        let _ = LogTracer::init();

        let filter = opts
            .level
            .as_deref()
            .or(env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
            .unwrap_or(DEFAULT_LOG_TARGETS)
            .parse::<filter::Targets>()
            .unwrap_or_else(|e| panic!("error parsing log level string: {e}"));

        let (dyn_filter, reload_handle) = reload::Layer::new(filter);
        let _ = RELOAD_HANDLE.set(reload_handle);

        let stdout_logging_layer = opts.append_stdout.then(|| {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            guards.push(guard);
            fmt_layer(writer, opts.log_format, std::io::stdout().is_terminal())
        });

        let (file_logging_layer, err_file_logging_layer) = if opts.dir.is_empty() {
            (None, None)
        } else {
            let (writer, guard) = tracing_appender::non_blocking(rolling_appender(app_name, opts));
            guards.push(guard);
            let file = fmt_layer(writer, opts.log_format, false);

            let (writer, guard) =
                tracing_appender::non_blocking(rolling_appender(&format!("{app_name}-err"), opts));
            guards.push(guard);
            let err = fmt_layer(writer, opts.log_format, false)
                .with_filter(filter::LevelFilter::ERROR)
                .boxed();
            (Some(file), Some(err))
        };

        let subscriber = Registry::default()
            .with(dyn_filter)
            .with(
                stdout_logging_layer
                    .into_iter()
                    .chain(file_logging_layer)
                    .chain(err_file_logging_layer)
                    .collect::<Vec<BoxedLayer>>(),
            );

        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("a global tracing subscriber is already installed");
        }
    });

    guards
}
