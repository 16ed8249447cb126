//! Transports - strategies for moving a resource's bytes into its staging file
//!
//! Every transport offers the same two operations: a metadata-only size probe
//! and a fetch that streams the body into `Resource::staging`. Transports never
//! touch `Resource::local`; committing the staged file is the caller's job.

mod http;
mod peer;

pub use http::*;
pub use peer::*;

use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;
use uplift_types::Resource;

/// Callback invoked with the size of every chunk written to the staging file.
///
/// Returning `ControlFlow::Break` asks the transport to stop; it then returns
/// [`TransportError::Aborted`].
pub type ByteSink<'a> = dyn FnMut(u64) -> ControlFlow<()> + Send + 'a;

/// A way of acquiring a single resource
#[async_trait]
pub trait Transport: Send + Sync {
    /// Learn how many bytes a fetch will transfer without downloading the body.
    /// `None` means the size is unknown.
    async fn check_size(&self, resource: &Resource) -> Result<Option<u64>, TransportError>;

    /// Write the resource into a freshly created staging file
    async fn fetch(
        &self,
        resource: &Resource,
        on_bytes: &mut ByteSink<'_>,
    ) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn check_size(&self, resource: &Resource) -> Result<Option<u64>, TransportError> {
        (**self).check_size(resource).await
    }

    async fn fetch(
        &self,
        resource: &Resource,
        on_bytes: &mut ByteSink<'_>,
    ) -> Result<(), TransportError> {
        (**self).fetch(resource, on_bytes).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn check_size(&self, resource: &Resource) -> Result<Option<u64>, TransportError> {
        (**self).check_size(resource).await
    }

    async fn fetch(
        &self,
        resource: &Resource,
        on_bytes: &mut ByteSink<'_>,
    ) -> Result<(), TransportError> {
        (**self).fetch(resource, on_bytes).await
    }
}

/// Byte accounting for one transfer attempt.
///
/// Written only by the transfer worker; anyone else (the stall watchdog) just
/// reads it.
#[derive(Debug)]
pub struct TransferState {
    expected_size: Option<u64>,
    transferred: AtomicU64,
    started_at: Instant,
    last_progress_at: Mutex<Instant>,
}

impl TransferState {
    pub fn new(expected_size: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            expected_size,
            transferred: AtomicU64::new(0),
            started_at: now,
            last_progress_at: Mutex::new(now),
        }
    }

    /// Note that `bytes` more bytes reached the staging file
    pub fn record(&self, bytes: u64) -> u64 {
        let total = self.transferred.fetch_add(bytes, Ordering::AcqRel) + bytes;
        *self.last_progress_at.lock() = Instant::now();
        total
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    pub fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    /// Time since this attempt started
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time since bytes last arrived
    pub fn idle(&self) -> Duration {
        self.last_progress_at.lock().elapsed()
    }
}

/// Remove a partial staging file, tolerating its absence
pub(crate) async fn discard_staging(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to discard staging file {}: {}", path.display(), e),
    }
}

/// Create the staging file from scratch, making its parent directory if needed
pub(crate) async fn create_staging(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::File::create(path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn transfer_state_tracks_bytes_and_time() {
        let state = TransferState::new(Some(100));
        assert_eq!(state.record(40), 40);
        assert_eq!(state.record(10), 50);
        assert_eq!(state.transferred(), 50);
        assert_eq!(state.expected_size(), Some(100));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(state.elapsed() >= Duration::from_secs(5));
        assert!(state.idle() >= Duration::from_secs(5));

        state.record(1);
        assert!(state.idle() < Duration::from_secs(1));
    }
}
