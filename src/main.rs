//! keyscan - sharded Redis key scanner
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use keyscan::config::{CliArgs, OutputFormat, ScanConfig};
use keyscan::progress::{print_header, print_summary, ProgressReporter, ScanOutcome};
use keyscan::scan::KeyScanner;
use keyscan::KeyscanError;
use std::io::{BufWriter, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    // Validate and create config
    let config = ScanConfig::from_args(args).context("Invalid configuration")?;

    if config.show_progress {
        let shards: Vec<String> = config.shards.iter().map(|s| s.to_string()).collect();
        print_header(&config.pattern, &shards, config.batch_hint.get());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")?;

    runtime.block_on(run_scan(config))
}

async fn run_scan(config: ScanConfig) -> Result<()> {
    let gateway = Arc::new(config.gateway());
    let directory = Arc::new(config.directory());
    let scanner = KeyScanner::new(gateway, directory).with_options(config.scan_options());

    // Setup signal handler for graceful shutdown
    let (interrupt_tx, mut interrupt_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        let _ = interrupt_tx.send(());
    })
    .context("Failed to set signal handler")?;

    let progress = if config.show_progress {
        Some(ProgressReporter::new())
    } else {
        None
    };
    if let Some(ref p) = progress {
        p.set_status("Connecting to shards...");
    }

    let subscription = scanner.subscribe(&config.pattern);
    let handle = subscription.handle();
    let counters = subscription.counters();
    let prefetch = scanner.options().prefetch.unwrap_or(config.batch_hint.get() as u64);
    let mut keys = subscription.into_stream(prefetch);

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let mut printed: u64 = 0;
    let mut failure: Option<KeyscanError> = None;

    let outcome = loop {
        if config.limit.is_some_and(|limit| printed >= limit) {
            handle.cancel();
            break ScanOutcome::LimitReached;
        }

        tokio::select! {
            _ = interrupt_rx.recv() => {
                handle.cancel();
                failure = Some(KeyscanError::Interrupted);
                break ScanOutcome::Interrupted;
            }
            _ = ticker.tick() => {
                if let Some(ref p) = progress {
                    p.update(&counters.progress());
                }
            }
            next = keys.next() => match next {
                Some(Ok(key)) => {
                    write_key(&mut out, &key, config.output_format)?;
                    printed += 1;
                }
                Some(Err(e)) => {
                    debug!(shard = e.shard(), kind = ?e.kind(), "Scan failed");
                    failure = Some(e.into());
                    break ScanOutcome::Failed;
                }
                None => break ScanOutcome::Completed,
            },
        }
    };
    out.flush().context("Failed to flush output")?;
    drop(keys);

    if let Some(ref p) = progress {
        p.finish_and_clear();
    }

    let summary = counters.progress();
    if config.show_progress {
        print_summary(&summary, printed, outcome);
    }
    info!(
        keys = printed,
        round_trips = summary.round_trips,
        outcome = ?outcome,
        "Scan finished"
    );

    match failure {
        Some(KeyscanError::Interrupted) => Err(KeyscanError::Interrupted.into()),
        Some(e) => Err(e).context("Scan failed"),
        None => Ok(()),
    }
}

fn write_key<W: Write>(out: &mut W, key: &str, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => writeln!(out, "{}", key),
        OutputFormat::Json => {
            let encoded = serde_json::to_string(key).context("Failed to encode key")?;
            writeln!(out, "{}", encoded)
        }
    }
    .map_err(KeyscanError::from)
    .context("Failed to write key")
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("keyscan=debug,warn")
    } else {
        EnvFilter::new("keyscan=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
