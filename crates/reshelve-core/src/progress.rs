/// Trait for reporting run progress.
///
/// The CLI implements it with indicatif bars. All methods have default no-op
/// implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_scan_start(&self) {}
    fn on_scan_progress(&self, _files_scanned: usize, _current_path: &str) {}
    fn on_scan_complete(&self, _total_files: usize, _duration_secs: f64) {}
    fn on_plan_complete(&self, _chunks: usize, _steps: usize) {}
    fn on_chunk_start(&self, _chunk_id: &str, _steps: usize) {}
    fn on_step_complete(&self, _chunk_id: &str) {}
    fn on_chunk_complete(&self, _chunk_id: &str, _committed: usize, _failed: usize) {}
    fn on_run_complete(&self, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
