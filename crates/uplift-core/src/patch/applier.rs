//! Applies a patch archive to an application directory

use super::{EntryFailure, PatchReport, OLD_SUFFIX};
use crate::delta;
use crate::error::{DeltaError, EntryError, UpliftError};
use crate::progress::{CancelHandle, PercentReporter, ProgressObserver};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::ops::ControlFlow;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uplift_types::{Outcome, PatchAction, PatchEntry, PATCH_SUFFIX};
use zip::ZipArchive;

const BUFFER_SIZE: usize = 4096;

/// One patch session against one application directory.
///
/// Consumed by [`apply`](Self::apply); callers must not run two sessions on
/// the same directory at once.
pub struct PatchApplier {
    app_dir: PathBuf,
    observer: Option<Arc<dyn ProgressObserver>>,
    cancel: CancelHandle,
}

/// Archive entry as listed in the central directory
struct IndexedEntry {
    index: usize,
    name: String,
    compressed_size: u64,
    /// Uncompressed length, what a Create entry actually writes
    size: u64,
}

impl PatchApplier {
    pub fn new(app_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_dir: app_dir.into(),
            observer: None,
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Handle that stops the run at the next chunk boundary
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Apply the archive and report its terminal outcome
    pub fn run(self, patch_file: &Path) -> Outcome {
        match self.apply(patch_file) {
            Ok(report) => report.outcome(),
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    /// Apply every entry of `patch_file`.
    ///
    /// Failures confined to one entry are collected in the report and the run
    /// moves on; only an unreadable archive is returned as `Err`.
    pub fn apply(self, patch_file: &Path) -> Result<PatchReport, UpliftError> {
        info!("Applying {} to {}", patch_file.display(), self.app_dir.display());
        let file = File::open(patch_file)?;
        let mut archive = ZipArchive::new(BufReader::new(file))?;

        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let entry = archive.by_index_raw(index)?;
            if entry.is_dir() {
                continue;
            }
            entries.push(IndexedEntry {
                index,
                name: entry.name().to_string(),
                compressed_size: entry.compressed_size(),
                size: entry.size(),
            });
        }
        let total = entries.iter().map(|e| e.compressed_size).sum();

        let mut session = Session {
            app_dir: &self.app_dir,
            cancel: &self.cancel,
            tally: Tally {
                reporter: self.observer.clone().map(PercentReporter::new),
                completed: 0,
                total,
            },
        };
        let mut report = PatchReport::default();

        for indexed in &entries {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let Some(entry) = PatchEntry::from_entry_name(&indexed.name, indexed.compressed_size) else {
                warn!("Skipping unrecognized patch entry {}", indexed.name);
                report.skipped += 1;
                session.tally.finish_entry(indexed.compressed_size);
                continue;
            };

            match session.apply_entry(&mut archive, indexed, &entry) {
                Ok(true) => match entry.action {
                    PatchAction::Delete => report.deleted += 1,
                    PatchAction::Create | PatchAction::Patch => report.applied += 1,
                },
                Ok(false) => {}
                Err(EntryError::Cancelled) => {
                    warn!("Cancelled while applying {}", indexed.name);
                    report.failures.push(EntryFailure {
                        entry: indexed.name.clone(),
                        error: EntryError::Cancelled,
                    });
                    report.cancelled = true;
                    break;
                }
                Err(error) => {
                    warn!("Failed to apply {}: {}", indexed.name, error);
                    report.failures.push(EntryFailure {
                        entry: indexed.name.clone(),
                        error,
                    });
                }
            }
            session.tally.finish_entry(indexed.compressed_size);
        }

        if !report.cancelled {
            session.tally.complete();
        }
        info!(
            "Patch finished: {} applied, {} deleted, {} skipped, {} failed",
            report.applied,
            report.deleted,
            report.skipped,
            report.failures.len()
        );
        Ok(report)
    }
}

/// Weights progress by each entry's stored size
struct Tally {
    reporter: Option<PercentReporter>,
    completed: u64,
    total: u64,
}

impl Tally {
    /// Report `done` bytes into an entry whose share is `share`
    fn within(&mut self, done: u64, share: u64) {
        if let Some(reporter) = &mut self.reporter {
            reporter.update(self.completed + done.min(share), self.total);
        }
    }

    fn finish_entry(&mut self, share: u64) {
        self.completed += share;
        self.within(0, 0);
    }

    fn complete(&mut self) {
        if let Some(reporter) = &mut self.reporter {
            reporter.update(1, 1);
        }
    }
}

/// Maps bytes written for an entry onto its slice of the archive total
#[derive(Clone, Copy)]
struct EntryWeight {
    share: u64,
    size: u64,
}

impl EntryWeight {
    fn scale(&self, written: u64) -> u64 {
        if self.size == 0 {
            return 0;
        }
        (self.share as u128 * written as u128 / self.size as u128) as u64
    }
}

struct Session<'a> {
    app_dir: &'a Path,
    cancel: &'a CancelHandle,
    tally: Tally,
}

impl Session<'_> {
    /// Returns whether the entry changed anything on disk
    fn apply_entry<R: Read + Seek>(
        &mut self,
        archive: &mut ZipArchive<R>,
        indexed: &IndexedEntry,
        entry: &PatchEntry,
    ) -> Result<bool, EntryError> {
        let index = indexed.index;
        let target = resolve_target(self.app_dir, &entry.relative_path)?;
        let share = entry.compressed_size;
        match entry.action {
            PatchAction::Create => {
                debug!("Creating {}", target.display());
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let weight = EntryWeight {
                    share,
                    size: indexed.size,
                };
                self.extract(archive, index, &target, Some(weight))?;
                Ok(true)
            }
            PatchAction::Patch => {
                debug!("Patching {}", target.display());
                self.patch(archive, index, &target, share)?;
                Ok(true)
            }
            PatchAction::Delete => match fs::remove_file(&target) {
                Ok(()) => {
                    debug!("Deleted {}", target.display());
                    Ok(true)
                }
                Err(e) => {
                    warn!("Could not delete {}: {}", target.display(), e);
                    Ok(false)
                }
            },
        }
    }

    /// Stream one entry to `dest`, reporting into the entry's share when given
    fn extract<R: Read + Seek>(
        &mut self,
        archive: &mut ZipArchive<R>,
        index: usize,
        dest: &Path,
        weight: Option<EntryWeight>,
    ) -> Result<(), EntryError> {
        let mut entry = archive.by_index(index)?;
        let mut out = BufWriter::new(File::create(dest)?);
        let mut buffer = [0u8; BUFFER_SIZE];
        let mut copied = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return Err(EntryError::Cancelled);
            }
            let n = match entry.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            out.write_all(&buffer[..n])?;
            copied += n as u64;
            if let Some(weight) = weight {
                self.tally.within(weight.scale(copied), weight.share);
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Rebuild `target` from its current contents and the entry's delta.
    ///
    /// On failure the extracted delta and the `.old` copy stay on disk.
    fn patch<R: Read + Seek>(
        &mut self,
        archive: &mut ZipArchive<R>,
        index: usize,
        target: &Path,
        share: u64,
    ) -> Result<(), EntryError> {
        let delta_path = with_suffix(target, PATCH_SUFFIX);
        let old_path = with_suffix(target, OLD_SUFFIX);

        self.extract(archive, index, &delta_path, None)?;

        match fs::remove_file(&old_path) {
            Ok(()) => debug!("Removed stale {}", old_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(EntryError::Sidecar { path: old_path, source }),
        }
        if let Err(source) = fs::rename(target, &old_path) {
            return Err(EntryError::Sidecar { path: old_path, source });
        }

        let cancel = self.cancel;
        let tally = &mut self.tally;
        delta::apply_files(&old_path, &delta_path, target, |percent| {
            if cancel.is_cancelled() {
                return ControlFlow::Break(());
            }
            tally.within(share * u64::from(percent) / 100, share);
            ControlFlow::Continue(())
        })
        .map_err(|e| match e {
            DeltaError::Aborted => EntryError::Cancelled,
            other => EntryError::Delta(other),
        })?;

        for leftover in [&delta_path, &old_path] {
            if let Err(e) = fs::remove_file(leftover) {
                warn!("Could not remove {}: {}", leftover.display(), e);
            }
        }
        Ok(())
    }
}

/// Join `relative` onto `app_dir`, refusing anything that would leave it
fn resolve_target(app_dir: &Path, relative: &str) -> Result<PathBuf, EntryError> {
    let mut target = app_dir.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(EntryError::UnsafePath(relative.to_string()));
            }
        }
    }
    if target == app_dir {
        return Err(EntryError::UnsafePath(relative.to_string()));
    }
    Ok(target)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
