//! Terminal progress for a sync pass
//!
//! A bar counts queued transfers at the bottom; finished files scroll above it
//! when verbose.

use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct SyncProgress {
    bar: ProgressBar,
    start_time: Instant,
    bytes: AtomicU64,
    show_files: bool,
}

impl SyncProgress {
    pub fn new(total: u64, verbose: bool) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:30}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self::with_bar(bar, verbose)
    }

    /// Draws nothing; for tests and non-interactive runs
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden(), false)
    }

    fn with_bar(bar: ProgressBar, show_files: bool) -> Self {
        Self {
            bar,
            start_time: Instant::now(),
            bytes: AtomicU64::new(0),
            show_files,
        }
    }

    pub fn set_total(&self, total: u64) {
        self.bar.set_length(total);
    }

    pub fn file_done(&self, operation: &str, name: &str, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        if self.show_files {
            self.bar.suspend(|| {
                println!("  {} {}", operation.with(Color::Green).bold(), name.with(Color::Cyan));
            });
        }
        self.bar.set_message(name.to_string());
        self.bar.inc(1);
    }

    pub fn file_skipped(&self, name: &str, reason: &str) {
        self.bar.suspend(|| {
            println!("  {} {} ({})", "Skipped".with(Color::Yellow).bold(), name, reason);
        });
        self.bar.inc(1);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn finish_success(&self, files: u64) {
        let elapsed = self.start_time.elapsed();
        self.bar.finish_with_message(format!(
            "{} {} files ({:.1} KB) in {:.1}s",
            "Synced".with(Color::Green).bold(),
            files,
            self.bytes() as f64 / 1024.0,
            elapsed.as_secs_f64()
        ));
    }

    pub fn finish_error(&self, msg: &str) {
        self.bar
            .abandon_with_message(format!("{} {}", "Failed".with(Color::Red).bold(), msg));
    }
}
