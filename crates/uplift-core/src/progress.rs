//! Progress reporting and cooperative cancellation
//!
//! Long-running operations report through a [`ProgressObserver`] and poll a
//! [`CancelHandle`] at chunk granularity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uplift_types::Progress;

/// Receives progress reports from downloads and patch runs
pub trait ProgressObserver: Send + Sync {
    fn progress(&self, progress: Progress);
}

impl<F> ProgressObserver for F
where
    F: Fn(Progress) + Send + Sync,
{
    fn progress(&self, progress: Progress) {
        self(progress)
    }
}

/// Shared cancellation flag, checked between chunks
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the running operation stops at its next check
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Turns completed/total counts into a non-decreasing percent stream
pub(crate) struct PercentReporter {
    observer: Arc<dyn ProgressObserver>,
    last: Option<u8>,
}

impl PercentReporter {
    pub(crate) fn new(observer: Arc<dyn ProgressObserver>) -> Self {
        Self {
            observer,
            last: None,
        }
    }

    /// Report `floor(100 * completed / total)`, only when it increases
    pub(crate) fn update(&mut self, completed: u64, total: u64) {
        if total == 0 {
            return;
        }
        let percent = (completed as u128 * 100 / total as u128).min(100) as u8;
        if self.last.map_or(true, |last| percent > last) {
            self.last = Some(percent);
            self.observer.progress(Progress::Percent(percent));
        }
    }

    pub(crate) fn indeterminate(&self) {
        self.observer.progress(Progress::Indeterminate);
    }
}
