//! Output formatting utilities

use serde::Serialize;
use std::fmt;
use std::path::Path;
use uplift_core::PatchReport;

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Printable result of one patch run
#[derive(Debug, Serialize)]
pub struct PatchSummary {
    pub app_dir: String,
    pub outcome: String,
    pub applied: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failures: Vec<FailureLine>,
}

#[derive(Debug, Serialize)]
pub struct FailureLine {
    pub entry: String,
    pub error: String,
}

impl PatchSummary {
    pub fn new(app_dir: &Path, report: &PatchReport) -> Self {
        Self {
            app_dir: app_dir.display().to_string(),
            outcome: report.outcome().to_string(),
            applied: report.applied,
            deleted: report.deleted,
            skipped: report.skipped,
            failures: report
                .failures
                .iter()
                .map(|f| FailureLine {
                    entry: f.entry.clone(),
                    error: f.error.to_string(),
                })
                .collect(),
        }
    }
}

impl fmt::Display for PatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {}", self.app_dir, self.outcome)?;
        write!(
            f,
            "  {} applied, {} deleted, {} skipped",
            self.applied, self.deleted, self.skipped
        )?;
        for failure in &self.failures {
            write!(f, "\n  failed {}: {}", failure.entry, failure.error)?;
        }
        Ok(())
    }
}

/// Print output in the specified format
pub fn print_output<T: Serialize + fmt::Display>(value: &T, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Human => {
            println!("{}", value);
        }
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;
    use uplift_core::{PatchApplier, PatchWriter};

    #[test]
    fn summary_lists_failures() {
        let work = TempDir::new().unwrap();
        let app = TempDir::new().unwrap();
        let patch = work.path().join("p.zip");
        let mut writer = PatchWriter::new(File::create(&patch).unwrap());
        writer.add_create("ok.txt", b"fine").unwrap();
        writer.add_patch("missing.bin", b"old", b"new").unwrap();
        writer.finish().unwrap();

        let report = PatchApplier::new(app.path()).apply(&patch).unwrap();
        let summary = PatchSummary::new(app.path(), &report);

        assert_eq!(summary.outcome, "succeeded");
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].entry, "missing.bin.patch");

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["applied"], 1);
        assert!(summary.to_string().contains("failed missing.bin.patch"));
    }
}
