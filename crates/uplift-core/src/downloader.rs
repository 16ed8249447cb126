//! Batch downloader
//!
//! Drives one transport over a set of resources:
//! - Every size is probed before the first fetch, so progress has a fixed denominator
//! - Any failed probe fails the whole batch
//! - Byte counting only happens when someone is observing
//! - Cancellation is cooperative and checked after every chunk

use crate::error::{TransportError, UpliftError};
use crate::progress::{CancelHandle, PercentReporter, ProgressObserver};
use crate::transport::{discard_staging, Transport, TransferState};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uplift_types::{Outcome, Resource};

/// Downloads a batch of resources through a single transport
pub struct Downloader<T> {
    transport: T,
    observer: Option<Arc<dyn ProgressObserver>>,
    cancel: CancelHandle,
}

impl<T: Transport> Downloader<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            observer: None,
            cancel: CancelHandle::new(),
        }
    }

    /// Report progress for every run to `observer`
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Handle that cancels the running batch
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Download the batch and report its terminal outcome
    pub async fn run(&self, resources: &[Resource]) -> Outcome {
        match self.try_run(resources).await {
            Ok(()) => Outcome::Succeeded,
            Err(UpliftError::Cancelled) => {
                info!("Download batch cancelled");
                Outcome::Cancelled
            }
            Err(e) => {
                error!(
                    "Download batch failed: {} (retryable: {})",
                    e,
                    e.is_retryable()
                );
                Outcome::Failed(e.to_string())
            }
        }
    }

    /// Download the batch, returning `UpliftError::Cancelled` if cancelled
    pub async fn try_run(&self, resources: &[Resource]) -> Result<(), UpliftError> {
        if resources.is_empty() {
            debug!("Empty download batch");
            if let Some(mut reporter) = self.observer.clone().map(PercentReporter::new) {
                reporter.update(1, 1);
            }
            return Ok(());
        }

        let mut sizes = Vec::with_capacity(resources.len());
        for resource in resources {
            self.check_cancelled()?;
            let size = self.transport.check_size(resource).await?;
            debug!("Size of {}: {:?}", resource.remote, size);
            sizes.push(size);
        }

        let total: Option<u64> = sizes.iter().copied().sum();
        let total = total.filter(|&t| t > 0);
        info!(
            "Downloading {} resources ({:?} bytes)",
            resources.len(),
            total
        );

        let mut reporter = self.observer.clone().map(PercentReporter::new);
        if let (Some(reporter), None) = (&reporter, total) {
            reporter.indeterminate();
        }

        let mut completed = 0u64;
        for (resource, size) in resources.iter().zip(sizes) {
            self.check_cancelled()?;

            let state = TransferState::new(size);
            let result = {
                let cancel = &self.cancel;
                let mut on_bytes = |bytes: u64| {
                    if let Some(reporter) = reporter.as_mut() {
                        let transferred = state.record(bytes);
                        if let Some(total) = total {
                            reporter.update(completed + transferred, total);
                        }
                    }
                    if cancel.is_cancelled() {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                };
                self.transport.fetch(resource, &mut on_bytes).await
            };

            match result {
                Ok(()) => {
                    let transferred = state.transferred();
                    // Bytes are only counted while someone observes
                    let mismatch = state.expected_size().filter(|&e| e != transferred);
                    if let (Some(expected), true) = (mismatch, reporter.is_some()) {
                        warn!(
                            "{} delivered {} bytes, probe said {}",
                            resource.remote, transferred, expected
                        );
                    }
                    completed += transferred;
                    info!("Fetched {} into {}", resource.remote, resource.staging.display());
                }
                Err(TransportError::Aborted) => {
                    discard_staging(&resource.staging).await;
                    return Err(UpliftError::Cancelled);
                }
                Err(e) => {
                    discard_staging(&resource.staging).await;
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), UpliftError> {
        if self.cancel.is_cancelled() {
            Err(UpliftError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl<T: Transport + 'static> Downloader<T> {
    /// Run the batch on its own task so the caller is never blocked
    pub fn spawn(self, resources: Vec<Resource>) -> JoinHandle<Outcome> {
        tokio::spawn(async move { self.run(&resources).await })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::error::TransportError;
    use crate::transport::{ByteSink, Transport};
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uplift_types::Resource;

    /// Transport that replays a fixed chunk script into the staging file
    pub(crate) struct ScriptedTransport {
        size: Option<Option<u64>>,
        chunks: Vec<usize>,
        chunk_delay: Duration,
        stall_after: Option<usize>,
        fail_fetch: bool,
        fill: u8,
        probes: AtomicUsize,
        fetches: AtomicUsize,
    }

    impl ScriptedTransport {
        pub(crate) fn new(size: Option<u64>, chunks: Vec<usize>) -> Self {
            Self {
                size: Some(size),
                chunks,
                chunk_delay: Duration::ZERO,
                stall_after: None,
                fail_fetch: false,
                fill: 0xAB,
                probes: AtomicUsize::new(0),
                fetches: AtomicUsize::new(0),
            }
        }

        /// `total` bytes delivered in `chunk`-sized pieces
        pub(crate) fn sized(total: usize, chunk: usize) -> Self {
            let mut chunks = vec![chunk; total / chunk];
            if total % chunk > 0 {
                chunks.push(total % chunk);
            }
            Self::new(Some(total as u64), chunks)
        }

        pub(crate) fn failing_probe(mut self) -> Self {
            self.size = None;
            self
        }

        pub(crate) fn failing_fetch(mut self) -> Self {
            self.fail_fetch = true;
            self
        }

        /// Hang forever before delivering chunk `index`
        pub(crate) fn stalling_after(mut self, index: usize) -> Self {
            self.stall_after = Some(index);
            self
        }

        pub(crate) fn with_chunk_delay(mut self, delay: Duration) -> Self {
            self.chunk_delay = delay;
            self
        }

        pub(crate) fn filled_with(mut self, fill: u8) -> Self {
            self.fill = fill;
            self
        }

        pub(crate) fn probe_count(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }

        pub(crate) fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn check_size(&self, resource: &Resource) -> Result<Option<u64>, TransportError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.size.ok_or_else(|| TransportError::Status {
                url: resource.remote.to_string(),
                status: 500,
            })
        }

        async fn fetch(
            &self,
            resource: &Resource,
            on_bytes: &mut ByteSink<'_>,
        ) -> Result<(), TransportError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_fetch {
                return Err(TransportError::Status {
                    url: resource.remote.to_string(),
                    status: 503,
                });
            }

            // Plain std IO keeps paused-clock tests free of blocking-pool work
            let mut file = std::fs::File::create(&resource.staging)?;
            for (index, &len) in self.chunks.iter().enumerate() {
                if self.stall_after == Some(index) {
                    std::future::pending::<()>().await;
                }
                if !self.chunk_delay.is_zero() {
                    tokio::time::sleep(self.chunk_delay).await;
                }
                file.write_all(&vec![self.fill; len])?;
                if on_bytes(len as u64).is_break() {
                    return Err(TransportError::Aborted);
                }
                tokio::task::yield_now().await;
            }
            file.flush()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedTransport;
    use super::*;
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use uplift_types::Progress;

    fn resource(dir: &TempDir, name: &str) -> Resource {
        let url = url::Url::parse(&format!("http://x/{}", name)).unwrap();
        Resource::new(url, dir.path().join(name))
    }

    fn recorder() -> (Arc<Mutex<Vec<Progress>>>, Arc<dyn ProgressObserver>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |p: Progress| sink.lock().push(p)))
    }

    fn percents(seen: &Mutex<Vec<Progress>>) -> Vec<u8> {
        seen.lock().iter().filter_map(|p| p.percent()).collect()
    }

    #[tokio::test]
    async fn test_four_even_chunks_report_quarters() {
        let dir = TempDir::new().unwrap();
        let rsrc = resource(&dir, "app.jar");
        let (seen, observer) = recorder();

        let downloader =
            Downloader::new(ScriptedTransport::sized(1000, 250)).with_observer(observer);
        let outcome = downloader.run(std::slice::from_ref(&rsrc)).await;

        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(percents(&seen), vec![25, 50, 75, 100]);
        assert_eq!(std::fs::metadata(&rsrc.staging).unwrap().len(), 1000);
        assert!(!rsrc.local.exists());
    }

    #[tokio::test]
    async fn test_denominator_spans_whole_batch() {
        let dir = TempDir::new().unwrap();
        let resources = vec![resource(&dir, "a.jar"), resource(&dir, "b.jar")];
        let (seen, observer) = recorder();

        // Both resources report 400 bytes, so the batch total is 800
        let downloader =
            Downloader::new(ScriptedTransport::sized(400, 200)).with_observer(observer);
        assert_eq!(downloader.run(&resources).await, Outcome::Succeeded);

        assert_eq!(downloader.transport().probe_count(), 2);
        assert_eq!(percents(&seen), vec![25, 50, 75, 100]);
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let dir = TempDir::new().unwrap();
        let resources = vec![resource(&dir, "a"), resource(&dir, "b"), resource(&dir, "c")];
        let (seen, observer) = recorder();

        let transport = ScriptedTransport::new(Some(1000), vec![1, 333, 7, 500, 159]);
        let downloader = Downloader::new(transport).with_observer(observer);
        assert_eq!(downloader.run(&resources).await, Outcome::Succeeded);

        let reported = percents(&seen);
        assert!(reported.windows(2).all(|w| w[0] <= w[1]), "{reported:?}");
        assert_eq!(reported.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_empty_batch_completes_at_100() {
        let (seen, observer) = recorder();
        let downloader =
            Downloader::new(ScriptedTransport::sized(1000, 250)).with_observer(observer);

        assert_eq!(downloader.run(&[]).await, Outcome::Succeeded);
        assert_eq!(*seen.lock(), vec![Progress::Percent(100)]);
        assert_eq!(downloader.transport().probe_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_size_reports_indeterminate() {
        let dir = TempDir::new().unwrap();
        let (seen, observer) = recorder();

        let downloader = Downloader::new(ScriptedTransport::new(None, vec![100, 100]))
            .with_observer(observer);
        let outcome = downloader.run(&[resource(&dir, "stream.bin")]).await;

        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(*seen.lock(), vec![Progress::Indeterminate]);
    }

    #[tokio::test]
    async fn test_failed_probe_aborts_batch_before_fetching() {
        let dir = TempDir::new().unwrap();
        let downloader = Downloader::new(Arc::new(ScriptedTransport::sized(10, 10).failing_probe()));

        let outcome = downloader
            .run(&[resource(&dir, "a"), resource(&dir, "b")])
            .await;

        assert!(matches!(outcome, Outcome::Failed(_)));
        assert_eq!(downloader.transport().probe_count(), 1);
        assert_eq!(downloader.transport().fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_fetch_discards_staging() {
        let dir = TempDir::new().unwrap();
        let rsrc = resource(&dir, "a");
        std::fs::write(&rsrc.staging, b"leftover").unwrap();

        let downloader = Downloader::new(ScriptedTransport::sized(10, 10).failing_fetch());
        let err = downloader
            .try_run(std::slice::from_ref(&rsrc))
            .await
            .unwrap_err();

        assert!(matches!(err, UpliftError::Transport(TransportError::Status { status: 503, .. })));
        assert!(!rsrc.staging.exists());
    }

    #[tokio::test]
    async fn test_cancel_mid_fetch_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let rsrc = resource(&dir, "app.jar");

        let downloader = Downloader::new(ScriptedTransport::sized(1000, 100));
        let cancel = downloader.cancel_handle();
        let observer: Arc<dyn ProgressObserver> = Arc::new(move |p: Progress| {
            if p.percent().unwrap_or(0) >= 30 {
                cancel.cancel();
            }
        });
        let downloader = downloader.with_observer(observer);

        let outcome = downloader.run(std::slice::from_ref(&rsrc)).await;

        assert_eq!(outcome, Outcome::Cancelled);
        assert!(!rsrc.staging.exists());
        assert!(!rsrc.local.exists());
    }

    #[tokio::test]
    async fn test_cancel_without_observer_still_stops() {
        let dir = TempDir::new().unwrap();
        let downloader = Downloader::new(ScriptedTransport::sized(100, 10));
        downloader.cancel_handle().cancel();

        let outcome = downloader.run(&[resource(&dir, "a")]).await;
        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(downloader.transport().probe_count(), 0);
    }

    #[tokio::test]
    async fn test_spawned_batch_reports_outcome() {
        let dir = TempDir::new().unwrap();
        let rsrc = resource(&dir, "bg.bin");
        let handle = Downloader::new(ScriptedTransport::sized(64, 16)).spawn(vec![rsrc.clone()]);

        assert_eq!(handle.await.unwrap(), Outcome::Succeeded);
        assert_eq!(std::fs::read(&rsrc.staging).unwrap(), vec![0xAB; 64]);
    }
}
