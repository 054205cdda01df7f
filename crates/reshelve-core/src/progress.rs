/// Trait for reporting pipeline progress.
///
/// The CLI implements it with indicatif. All methods have default no-op
/// implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_scan_start(&self) {}
    fn on_scan_progress(&self, _files_found: usize, _current_path: &str) {}
    fn on_scan_complete(&self, _total_files: usize, _duration_secs: f64) {}
    fn on_cluster_complete(&self, _clusters: usize, _duration_secs: f64) {}
    fn on_plan_start(&self) {}
    fn on_plan_progress(&self, _records_planned: usize) {}
    fn on_plan_complete(&self, _executable: usize, _blocked: usize, _duration_secs: f64) {}
    fn on_apply_start(&self, _total_moves: usize) {}
    fn on_apply_progress(&self, _processed: usize, _total_moves: usize) {}
    fn on_apply_complete(&self, _moved: usize, _failed: usize, _duration_secs: f64) {}
    fn on_cleanup_complete(&self, _removed: usize) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
