//! Patch archives
//!
//! A patch archive is a zip whose entry names carry an action suffix
//! (`.create`, `.patch`, `.delete`). [`PatchApplier`] applies one to an
//! application directory, [`PatchWriter`] builds one.

mod applier;
mod writer;

pub use applier::PatchApplier;
pub use writer::PatchWriter;

use crate::error::EntryError;
use uplift_types::Outcome;

/// Suffix of the renamed copy a delta is applied against
pub const OLD_SUFFIX: &str = ".old";

/// An entry that could not be applied
#[derive(Debug)]
pub struct EntryFailure {
    /// Archive entry name
    pub entry: String,
    pub error: EntryError,
}

/// What a patch run did
#[derive(Debug, Default)]
pub struct PatchReport {
    /// Create and Patch entries written
    pub applied: usize,
    /// Files removed by Delete entries
    pub deleted: usize,
    /// Entries with an unrecognized suffix
    pub skipped: usize,
    pub failures: Vec<EntryFailure>,
    pub cancelled: bool,
}

impl PatchReport {
    /// Terminal outcome of the run.
    ///
    /// Entry failures are logged and listed in `failures` but do not turn a
    /// completed run into a failed one.
    pub fn outcome(&self) -> Outcome {
        if self.cancelled {
            Outcome::Cancelled
        } else {
            Outcome::Succeeded
        }
    }

    /// True when every recognized entry was applied
    pub fn is_clean(&self) -> bool {
        !self.cancelled && self.failures.is_empty()
    }
}
