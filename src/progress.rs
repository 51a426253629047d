//! Progress reporting for key scans
//!
//! Provides real-time progress display using indicatif progress bars. All
//! output goes to stderr so stdout stays clean for keys.

use crate::scan::ScanProgress;
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Progress reporter that displays scan status
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the progress display
    pub fn update(&self, progress: &ScanProgress) {
        self.bar.set_message(progress_line(progress));
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish and clear the progress display
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn progress_line(progress: &ScanProgress) -> String {
    format!(
        "Keys: {} | Round-trips: {} | Rate: {:.0}/s | Shards: {}/{} done",
        format_number(progress.keys_emitted),
        format_number(progress.round_trips),
        progress.keys_per_second(),
        progress.shards_completed,
        progress.shards,
    )
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// How a scan ended, for the summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    /// Stopped at --limit
    LimitReached,
    Interrupted,
    Failed,
}

/// Print a summary of the scan results
pub fn print_summary(progress: &ScanProgress, printed: u64, outcome: ScanOutcome) {
    let duration_secs = progress.elapsed.as_secs_f64();

    let title = match outcome {
        ScanOutcome::Completed => style("Scan Complete").green().bold(),
        ScanOutcome::LimitReached => style("Scan Stopped (limit reached)").green().bold(),
        ScanOutcome::Interrupted => style("Scan Interrupted").yellow().bold(),
        ScanOutcome::Failed => style("Scan Failed").red().bold(),
    };

    eprintln!();
    eprintln!("{}", title);
    eprintln!("{}", style("─".repeat(50)).dim());
    eprintln!("  {} {}", style("Keys:").bold(), format_number(printed));
    eprintln!(
        "  {} {}",
        style("Round-trips:").bold(),
        format_number(progress.round_trips)
    );
    eprintln!(
        "  {} {}/{}",
        style("Shards done:").bold(),
        progress.shards_completed,
        progress.shards
    );
    if progress.shards_stalled > 0 || progress.shards_wrapped > 0 {
        eprintln!(
            "  {} {} stalled, {} wrapped",
            style("Early stops:").yellow().bold(),
            progress.shards_stalled,
            progress.shards_wrapped
        );
    }
    if progress.keys_discarded > 0 {
        eprintln!(
            "  {} {}",
            style("Discarded:").yellow().bold(),
            format_number(progress.keys_discarded)
        );
    }
    eprintln!(
        "  {} {:.1}s ({:.0} keys/sec)",
        style("Duration:").bold(),
        duration_secs,
        progress.keys_per_second()
    );
    eprintln!();
}

/// Print a header at the start of the scan
pub fn print_header(pattern: &str, shards: &[String], batch_hint: usize) {
    eprintln!();
    eprintln!(
        "{} {}",
        style("keyscan").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("{}", style("─".repeat(50)).dim());
    eprintln!("  {} {}", style("Pattern:").bold(), pattern);
    eprintln!("  {} {}", style("Count:").bold(), batch_hint);
    eprintln!("  {} {}", style("Shards:").bold(), shards.join(", "));
    eprintln!();
}
