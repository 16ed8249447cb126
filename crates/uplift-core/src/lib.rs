//! Uplift Core - Update Engine
//!
//! This crate moves application resources from a remote host to local
//! staging paths and applies patch archives to an installed application.
//! It handles HTTP and peer-swarm transports, stall-triggered fallback
//! between them, binary deltas, and progress reporting.

pub mod delta;
mod downloader;
mod error;
mod fallback;
pub mod patch;
mod progress;
mod transport;

pub use downloader::*;
pub use error::*;
pub use fallback::*;
pub use patch::{EntryFailure, PatchApplier, PatchReport, PatchWriter};
pub use progress::{CancelHandle, ProgressObserver};
pub use transport::*;

pub use uplift_types::*;
