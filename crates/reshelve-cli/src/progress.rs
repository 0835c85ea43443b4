use indicatif::{ProgressBar, ProgressStyle};
use reshelve_core::ProgressReporter;
use std::sync::Mutex;
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif progress bars.
///
/// - Scan phase: spinner (total unknown upfront)
/// - Apply phase: one bar per chunk
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(old) = guard.take() {
                old.finish_and_clear();
            }
            *guard = Some(pb);
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(pb) = guard.as_ref() {
                f(pb);
            }
        }
    }
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(TICK_CHARS);
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

impl ProgressReporter for CliReporter {
    fn on_scan_start(&self) {
        self.set_bar(spinner("Scanning files..."));
    }

    fn on_scan_progress(&self, files_scanned: usize, _current_path: &str) {
        self.with_bar(|pb| pb.set_message(format!("Scanning... {} files hashed", files_scanned)));
    }

    fn on_scan_complete(&self, total_files: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Scan complete: {} files in {:.2}s",
            total_files, duration_secs
        );
    }

    fn on_plan_complete(&self, chunks: usize, steps: usize) {
        eprintln!(
            "  \x1b[32m✓\x1b[0m Plan complete: {} steps in {} chunks",
            steps, chunks
        );
    }

    fn on_chunk_start(&self, chunk_id: &str, steps: usize) {
        let pb = ProgressBar::new(steps as u64);
        let style = ProgressStyle::with_template(
            "  {spinner:.cyan} {msg} [{bar:30.cyan/dim}] {pos}/{len} steps",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━╸─")
        .tick_chars(TICK_CHARS);
        pb.set_style(style);
        pb.set_message(chunk_id.to_string());
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_step_complete(&self, _chunk_id: &str) {
        self.with_bar(|pb| pb.inc(1));
    }

    fn on_chunk_complete(&self, chunk_id: &str, committed: usize, failed: usize) {
        self.finish_bar();
        if failed == 0 {
            eprintln!("  \x1b[32m✓\x1b[0m {}: {} committed", chunk_id, committed);
        } else {
            eprintln!(
                "  \x1b[31m✗\x1b[0m {}: {} committed, {} failed",
                chunk_id, committed, failed
            );
        }
    }
}
