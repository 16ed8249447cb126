//! Uplift CLI - Standalone patch application
//!
//! Applies a patch archive to an installed application directory.

mod output;
mod progress;

use anyhow::{bail, Context, Result};
use clap::Parser;
use console::style;
use output::{OutputFormat, PatchSummary};
use progress::PatchProgress;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uplift_core::{PatchApplier, PatchReport};

/// Exit status when the run finished but some entries failed
const EXIT_ENTRY_FAILURES: u8 = 2;
/// Exit status when the run was interrupted
const EXIT_CANCELLED: u8 = 130;

/// Uplift - apply a patch archive to an application directory
#[derive(Parser)]
#[command(name = "uplift-patch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Application directory to patch
    app_dir: PathBuf,

    /// Patch archive to apply
    patch_file: PathBuf,

    /// Output format for the final summary
    #[arg(long, default_value = "human", env = "UPLIFT_OUTPUT")]
    output: OutputFormat,

    /// Hide the progress bar
    #[arg(short, long)]
    quiet: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if !cli.app_dir.is_dir() {
        bail!("{} is not a directory", cli.app_dir.display());
    }
    let archive_size = std::fs::metadata(&cli.patch_file)
        .with_context(|| format!("Cannot read {}", cli.patch_file.display()))?
        .len();

    let progress = (!cli.quiet && matches!(cli.output, OutputFormat::Human))
        .then(|| Arc::new(PatchProgress::new(&cli.patch_file, archive_size)));

    let mut applier = PatchApplier::new(&cli.app_dir);
    if let Some(progress) = &progress {
        applier = applier.with_observer(progress.clone());
    }
    let cancel = applier.cancel_handle();

    let patch_file = cli.patch_file.clone();
    let mut task = tokio::task::spawn_blocking(move || applier.apply(&patch_file));

    let report: PatchReport = tokio::select! {
        joined = &mut task => joined.context("Patch task panicked")??,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, stopping after the current chunk");
            cancel.cancel();
            task.await.context("Patch task panicked")??
        }
    };

    if let Some(progress) = &progress {
        progress.finish(&report);
    }

    let summary = PatchSummary::new(&cli.app_dir, &report);
    output::print_output(&summary, cli.output)?;

    if !report.outcome().is_success() {
        return Ok(ExitCode::from(EXIT_CANCELLED));
    }
    if !report.failures.is_empty() {
        eprintln!(
            "{} {} entries could not be applied",
            style("!").yellow().bold(),
            report.failures.len()
        );
        return Ok(ExitCode::from(EXIT_ENTRY_FAILURES));
    }
    Ok(ExitCode::SUCCESS)
}

/// Log to stderr, honoring `RUST_LOG` when set
fn init_logging(verbose: bool) {
    let default = if verbose { "uplift_core=debug,info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
