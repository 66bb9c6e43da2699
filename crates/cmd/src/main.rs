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
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use rollqueue::{Message, Queue, QueueBuilder, QueueConfig, RollCycle};
use rsketch_common_telemetry::{LoggingOptions, init_global_logging, set_panic_hook};
use snafu::{ResultExt, Whatever};

#[derive(Debug, Parser)]
#[clap(
name = "rsketch",
about = "Inspect and feed rolling queues",
author = env!("CARGO_PKG_AUTHORS"),
version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Log level filter, e.g. `debug` or `warn,rollqueue=debug`.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Dump(DumpArgs),
    Tail(TailArgs),
    Append(AppendArgs),
}

/// Where the queue lives and how it is laid out.
#[derive(Debug, Clone, Args)]
struct QueueArgs {
    /// Queue directory.
    path: PathBuf,

    /// JSON file holding a queue config. Flags override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// e.g. `daily`, `hourly`, `minutely`.
    #[arg(long)]
    roll_cycle: Option<RollCycle>,

    #[arg(long)]
    source_id: Option<u32>,
}

impl QueueArgs {
    fn load_config(&self, read_only: bool) -> Result<QueueConfig, Whatever> {
        let mut config = match &self.config {
            Some(file) => {
                let raw = std::fs::read_to_string(file)
                    .with_whatever_context(|_| format!("reading {}", file.display()))?;
                serde_json::from_str::<QueueConfig>(&raw)
                    .with_whatever_context(|_| format!("parsing {}", file.display()))?
            }
            None => QueueConfig::default(),
        };
        config.base_path.clone_from(&self.path);
        config.read_only = read_only;
        if let Some(roll_cycle) = self.roll_cycle {
            config.roll_cycle = roll_cycle;
        }
        if let Some(source_id) = self.source_id {
            config.source_id = source_id;
        }
        Ok(config)
    }

    fn open(&self, read_only: bool) -> Result<Queue, Whatever> {
        QueueBuilder::from_config(self.load_config(read_only)?)
            .build()
            .with_whatever_context(|_| format!("opening queue at {}", self.path.display()))
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Print every entry of a queue with its index and history.
Examples:

rsketch dump ./queue_data
rsketch dump ./queue_data --roll-cycle hourly --from 0x4f2a00000000

")]
struct DumpArgs {
    #[command(flatten)]
    queue: QueueArgs,

    /// Start at this global index instead of the first entry.
    #[arg(long, value_parser = parse_index)]
    from: Option<u64>,
}

impl DumpArgs {
    fn run(&self) -> Result<(), Whatever> {
        let queue = self.queue.open(true)?;
        for cycle in queue.cycles().whatever_context("listing cycles")? {
            println!(
                "# cycle {cycle} starts {}",
                cycle_start(&queue, cycle).map_or_else(|| "?".to_string(), |t| t.to_rfc3339())
            );
        }

        let mut tailer = queue.create_tailer();
        if let Some(index) = self.from
            && !tailer.move_to_index(index).whatever_context("seeking")?
        {
            snafu::whatever!("no entry at index {index:#x}");
        }
        let mut count = 0_u64;
        for msg in tailer {
            print_message(&queue, &msg.whatever_context("reading entry")?);
            count += 1;
        }
        println!("# {count} entries");
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Follow a queue and print entries as they are appended. Stops on Ctrl-C.
Examples:

rsketch tail ./queue_data
rsketch tail ./queue_data --from-start

")]
struct TailArgs {
    #[command(flatten)]
    queue: QueueArgs,

    /// Print existing entries first instead of only new ones.
    #[arg(long)]
    from_start: bool,

    /// Milliseconds to sleep when no entry is available.
    #[arg(long, default_value_t = 100)]
    poll_ms: u64,
}

impl TailArgs {
    fn run(&self) -> Result<(), Whatever> {
        let running = Arc::new(AtomicBool::new(true));
        {
            let running = Arc::clone(&running);
            ctrlc::set_handler(move || running.store(false, Ordering::Release))
                .whatever_context("installing Ctrl-C handler")?;
        }

        let queue = self.queue.open(true)?;
        let mut tailer = queue.create_tailer();
        if !self.from_start {
            tailer.to_end().whatever_context("seeking to end")?;
        }
        while running.load(Ordering::Acquire) {
            match tailer.read_next().whatever_context("reading entry")? {
                Some(msg) => print_message(&queue, &msg),
                None => std::thread::sleep(Duration::from_millis(self.poll_ms)),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Append each argument as one entry and print the assigned indices.
Examples:

rsketch append ./queue_data hello world
rsketch append ./queue_data --source-id 7 'replayable entry'

")]
struct AppendArgs {
    #[command(flatten)]
    queue: QueueArgs,

    #[arg(required = true)]
    messages: Vec<String>,
}

impl AppendArgs {
    fn run(&self) -> Result<(), Whatever> {
        let queue = self.queue.open(false)?;
        let mut appender = queue.acquire_appender().whatever_context("acquiring appender")?;
        for index in appender
            .append_batch(&self.messages)
            .whatever_context("appending")?
        {
            println!("{index:#x}");
        }
        Ok(())
    }
}

/// Accepts decimal or `0x`-prefixed hex.
fn parse_index(s: &str) -> Result<u64, std::num::ParseIntError> {
    s.strip_prefix("0x")
        .map_or_else(|| s.parse(), |hex| u64::from_str_radix(hex, 16))
}

fn cycle_start(queue: &Queue, cycle: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(queue.roll_cycle().start_millis(cycle, queue.config().epoch))
}

fn print_message(queue: &Queue, msg: &Message) {
    let geometry = queue.geometry();
    let history = msg
        .history
        .entries()
        .iter()
        .map(|hop| format!("{}@{:#x}", hop.source_id, hop.index))
        .collect::<Vec<_>>()
        .join(",");
    println!(
        "{:#x} cycle={} seq={} history=[{history}] {}",
        msg.index,
        geometry.to_cycle(msg.index),
        geometry.to_sequence(msg.index),
        String::from_utf8_lossy(&msg.payload)
    );
}

fn main() -> Result<(), Whatever> {
    human_panic::setup_panic!();
    set_panic_hook();

    let cli = Cli::parse();
    let _guards = init_global_logging("rsketch", &LoggingOptions {
        level: Some(cli.log_level.clone()),
        ..Default::default()
    });

    match cli.commands {
        Commands::Dump(args) => args.run(),
        Commands::Tail(args) => args.run(),
        Commands::Append(args) => args.run(),
    }
}
