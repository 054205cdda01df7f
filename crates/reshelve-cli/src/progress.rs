use indicatif::{ProgressBar, ProgressStyle};
use reshelve_core::ProgressReporter;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const TICKS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif progress bars.
///
/// - Scan and plan phases: spinner (totals unknown while streaming)
/// - Apply phase: progress bar over the plan's move count
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.bar.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.lock();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        if let Some(pb) = self.lock().take() {
            pb.finish_and_clear();
        }
    }

    fn spinner(&self, message: &'static str) {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars(TICKS),
        );
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn done(&self, line: String) {
        self.finish_bar();
        eprintln!("  \x1b[32m✓\x1b[0m {}", line);
    }
}

impl ProgressReporter for CliReporter {
    fn on_scan_start(&self) {
        self.spinner("Scanning files...");
    }

    fn on_scan_progress(&self, files_found: usize, _current_path: &str) {
        if let Some(pb) = self.lock().as_ref() {
            pb.set_message(format!("Scanning... {} files indexed", files_found));
        }
    }

    fn on_scan_complete(&self, total_files: usize, duration_secs: f64) {
        self.done(format!(
            "Scan complete: {} files in {:.2}s",
            total_files, duration_secs
        ));
    }

    fn on_cluster_complete(&self, clusters: usize, duration_secs: f64) {
        self.done(format!(
            "Cluster detection complete: {} clusters in {:.2}s",
            clusters, duration_secs
        ));
    }

    fn on_plan_start(&self) {
        self.spinner("Compiling plan...");
    }

    fn on_plan_progress(&self, records_planned: usize) {
        if let Some(pb) = self.lock().as_ref() {
            pb.set_message(format!("Compiling plan... {} records", records_planned));
        }
    }

    fn on_plan_complete(&self, executable: usize, blocked: usize, duration_secs: f64) {
        self.done(format!(
            "Plan complete: {} moves, {} blocked in {:.2}s",
            executable, blocked, duration_secs
        ));
    }

    fn on_apply_start(&self, total_moves: usize) {
        let pb = ProgressBar::new(total_moves as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "  {spinner:.cyan} Moving [{bar:30.cyan/dim}] {pos}/{len} files ({eta} remaining)",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━╸─")
            .tick_chars(TICKS),
        );
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_apply_progress(&self, processed: usize, total_moves: usize) {
        if let Some(pb) = self.lock().as_ref() {
            if pb.length() != Some(total_moves as u64) {
                pb.set_length(total_moves as u64);
            }
            pb.set_position(processed as u64);
        }
    }

    fn on_apply_complete(&self, moved: usize, failed: usize, duration_secs: f64) {
        self.done(format!(
            "Apply complete: {} moved, {} failed in {:.2}s",
            moved, failed, duration_secs
        ));
    }

    fn on_cleanup_complete(&self, removed: usize) {
        self.done(format!("Removed {} empty directories", removed));
    }
}
