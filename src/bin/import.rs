//! Bulk event import (§10.7): stream newline-delimited JSON events from a
//! file or stdin through the same validator and write path the live
//! server uses, reporting progress with `indicatif`. Restores the
//! operational bulk-loading surface the distilled spec dropped; it talks
//! to storage directly rather than over the wire protocol.
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use nostr_relay_core::config::Settings;
use nostr_relay_core::db::Storage;
use nostr_relay_core::event::Event;
use nostr_relay_core::validator;
use nostr_relay_core::writer::{self, WriteOutcome};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "import-events", about = "Bulk-load newline-delimited Nostr events into the relay's database")]
struct Args {
    /// Path to a TOML configuration file, for the database location and allow-list.
    #[arg(long, env = "RELAY_CONFIG", default_value = "config.toml")]
    config: String,
    /// Path to a file of newline-delimited JSON events; reads stdin if omitted.
    #[arg(long)]
    input: Option<PathBuf>,
}

fn open_input(path: &Option<PathBuf>) -> Box<dyn BufRead> {
    match path {
        Some(path) => {
            let file = std::fs::File::open(path).unwrap_or_else(|e| {
                eprintln!("failed to open {}: {e}", path.display());
                std::process::exit(1);
            });
            Box::new(io::BufReader::new(file))
        }
        None => Box::new(io::BufReader::new(io::stdin())),
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let settings = Settings::load(&args.config).unwrap_or_else(|e| {
        eprintln!("failed to load configuration from {}: {e}", args.config);
        std::process::exit(1);
    });
    let storage = Storage::open(Path::new(&settings.database.data_directory)).unwrap_or_else(|e| {
        eprintln!("failed to open storage: {e}");
        std::process::exit(1);
    });

    let input = open_input(&args.input);
    let progress = ProgressBar::new_spinner();
    progress
        .set_style(ProgressStyle::with_template("{spinner} {pos} events processed ({msg})").unwrap());

    let (mut stored, mut duplicate, mut rejected) = (0u64, 0u64, 0u64);
    for line in input.lines() {
        let line = match line {
            Ok(l) if l.trim().is_empty() => continue,
            Ok(l) => l,
            Err(e) => {
                progress.println(format!("read error, stopping: {e}"));
                break;
            }
        };
        let outcome = Event::from_json(&line).and_then(|event| {
            validator::validate(&event, &settings.authorization)?;
            writer::write(&storage, &event, settings.limits.write_retry_attempts)
        });
        match outcome {
            Ok(WriteOutcome::Stored) => stored += 1,
            Ok(WriteOutcome::Duplicate) => duplicate += 1,
            Err(e) => {
                rejected += 1;
                progress.println(format!("rejected: {e}"));
            }
        }
        progress.inc(1);
        progress.set_message(format!("{stored} stored, {duplicate} duplicate, {rejected} rejected"));
    }
    progress.finish_with_message(format!(
        "done: {stored} stored, {duplicate} duplicate, {rejected} rejected"
    ));
}
