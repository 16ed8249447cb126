//! Shared types for Uplift
//!
//! This crate contains the plain data structures passed between the
//! manifest layer, the core engine and the CLI.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

// ============================================================================
// Resource Types
// ============================================================================

/// One remote file to synchronize into the application directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    /// Where the bytes come from
    pub remote: Url,
    /// Final location inside the application directory
    pub local: PathBuf,
    /// Where transports write before the caller commits the file
    pub staging: PathBuf,
}

impl Resource {
    /// Create a resource staged next to its final path as `<local>_new`
    pub fn new(remote: Url, local: PathBuf) -> Self {
        let staging = staging_path_for(&local);
        Self {
            remote,
            local,
            staging,
        }
    }

    /// Create a resource with an explicit staging path
    pub fn with_staging(remote: Url, local: PathBuf, staging: PathBuf) -> Self {
        Self {
            remote,
            local,
            staging,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.remote, self.local.display())
    }
}

fn staging_path_for(local: &Path) -> PathBuf {
    let mut name: OsString = local.as_os_str().to_owned();
    name.push("_new");
    PathBuf::from(name)
}

// ============================================================================
// Progress & Outcome Types
// ============================================================================

/// Progress reported to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Progress {
    /// Percent complete, 0 to 100
    Percent(u8),
    /// The total size is unknown, so no percentage can be computed
    Indeterminate,
}

impl Progress {
    /// Percent complete, if known
    pub fn percent(&self) -> Option<u8> {
        match self {
            Progress::Percent(p) => Some(*p),
            Progress::Indeterminate => None,
        }
    }
}

/// Terminal result of a download batch or patch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Cancelled,
    Failed(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded => write!(f, "succeeded"),
            Outcome::Cancelled => write!(f, "cancelled"),
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

// ============================================================================
// Patch Types
// ============================================================================

/// Entry name suffix for files created (or overwritten) verbatim
pub const CREATE_SUFFIX: &str = ".create";
/// Entry name suffix for files rebuilt from a binary delta
pub const PATCH_SUFFIX: &str = ".patch";
/// Entry name suffix for files removed from the application directory
pub const DELETE_SUFFIX: &str = ".delete";

/// What a patch entry does to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchAction {
    Create,
    Patch,
    Delete,
}

impl PatchAction {
    /// The archive entry suffix that selects this action
    pub fn suffix(&self) -> &'static str {
        match self {
            PatchAction::Create => CREATE_SUFFIX,
            PatchAction::Patch => PATCH_SUFFIX,
            PatchAction::Delete => DELETE_SUFFIX,
        }
    }
}

/// One instruction decoded from a patch archive entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchEntry {
    /// Path relative to the application directory, suffix stripped
    pub relative_path: String,
    pub action: PatchAction,
    /// Stored size of the entry inside the archive, used for progress weighting
    pub compressed_size: u64,
}

impl PatchEntry {
    /// Decode an archive entry name, returning `None` for unrecognized suffixes
    pub fn from_entry_name(name: &str, compressed_size: u64) -> Option<Self> {
        [PatchAction::Create, PatchAction::Patch, PatchAction::Delete]
            .into_iter()
            .find_map(|action| {
                name.strip_suffix(action.suffix())
                    .filter(|path| !path.is_empty())
                    .map(|path| Self {
                        relative_path: path.to_string(),
                        action,
                        compressed_size,
                    })
            })
    }

    /// The archive entry name this instruction was decoded from
    pub fn entry_name(&self) -> String {
        format!("{}{}", self.relative_path, self.action.suffix())
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Transfer engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// User agent sent with every HTTP request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Read timeout in seconds (0 = none)
    #[serde(default)]
    pub read_timeout_secs: u64,
    /// Copy buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum concurrent piece requests for the peer transport
    #[serde(default = "default_max_peer_connections")]
    pub max_peer_connections: usize,
    /// Stall detection for the primary transport
    #[serde(default)]
    pub stall: StallSettings,
}

/// Thresholds used to decide that a primary transfer is unhealthy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallSettings {
    /// Bytes that must have arrived once the time threshold elapses
    #[serde(default = "default_min_progress_bytes")]
    pub min_progress_bytes: u64,
    /// Time since transfer start after which progress is judged
    #[serde(default = "default_time_threshold_ms")]
    pub time_threshold_ms: u64,
    /// How often the watchdog samples the byte counter
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_user_agent() -> String {
    format!("Uplift/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_buffer_size() -> usize {
    4096
}

fn default_max_peer_connections() -> usize {
    4
}

fn default_min_progress_bytes() -> u64 {
    4000
}

fn default_time_threshold_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: 0,
            buffer_size: default_buffer_size(),
            max_peer_connections: default_max_peer_connections(),
            stall: StallSettings::default(),
        }
    }
}

impl Default for StallSettings {
    fn default() -> Self {
        Self {
            min_progress_bytes: default_min_progress_bytes(),
            time_threshold_ms: default_time_threshold_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}
