//! replay_events - Feed recorded inspection events through the batch engine.
//!
//! Reads newline-delimited JSON (one event object or event array per line) from a
//! file or stdin and prints every finalized batch as one JSON line. Open batches
//! are flushed when the input ends.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::Duration;

use inspection_batcher::transport::decode_payload;
use inspection_batcher::{AggregatorConfig, BatchEngine};

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay recorded inspection events into batches")]
struct Args {
    /// Input file with one JSON payload per line. Reads stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Delay between input lines, to mimic live arrival spacing.
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = AggregatorConfig::load()?;

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path)
                .with_context(|| format!("failed to open input {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let (engine, batches) = BatchEngine::new(cfg).spawn_with_channel()?;
    let printer = std::thread::spawn(move || -> Result<usize> {
        let stdout = std::io::stdout();
        let mut count = 0;
        for batch in batches {
            let mut out = stdout.lock();
            writeln!(out, "{}", serde_json::to_string(&batch)?)?;
            count += 1;
        }
        Ok(count)
    });

    let mut ingested = 0usize;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match decode_payload(line.as_bytes()) {
            Ok(events) => {
                for event in events {
                    engine.ingest(event)?;
                    ingested += 1;
                }
            }
            Err(e) => log::warn!("line {}: {}", line_no + 1, e),
        }
        if args.interval_ms > 0 {
            std::thread::sleep(Duration::from_millis(args.interval_ms));
        }
    }

    engine.stop()?;
    let emitted = printer
        .join()
        .map_err(|_| anyhow::anyhow!("batch printer thread panicked"))??;
    log::info!("replayed {} event(s) into {} batch(es)", ingested, emitted);
    Ok(())
}
