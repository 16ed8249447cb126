//! Progress bar for patch runs

use crate::output::format_bytes;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use uplift_core::{PatchReport, ProgressObserver};
use uplift_types::Progress;

/// Renders applier progress as a percent bar
pub struct PatchProgress {
    bar: ProgressBar,
}

impl PatchProgress {
    pub fn new(patch_file: &Path, archive_size: u64) -> Self {
        let bar = ProgressBar::new(100);
        if let Ok(template) =
            ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        {
            bar.set_style(template.progress_chars("█▓▒░  "));
        }

        let name = patch_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| patch_file.display().to_string());
        bar.set_message(format!("{} ({})", name, format_bytes(archive_size)));
        Self { bar }
    }

    /// Close the bar with a status line for the finished run
    pub fn finish(&self, report: &PatchReport) {
        if report.cancelled {
            self.bar
                .abandon_with_message(format!("{} Cancelled", style("○").dim()));
        } else if report.failures.is_empty() {
            self.bar
                .finish_with_message(format!("{} Patch applied", style("✓").green().bold()));
        } else {
            self.bar.abandon_with_message(format!(
                "{} Applied with {} failed entries",
                style("✗").red().bold(),
                report.failures.len()
            ));
        }
    }
}

impl ProgressObserver for PatchProgress {
    fn progress(&self, progress: Progress) {
        match progress {
            Progress::Percent(percent) => self.bar.set_position(u64::from(percent)),
            Progress::Indeterminate => self.bar.enable_steady_tick(std::time::Duration::from_millis(120)),
        }
    }
}
